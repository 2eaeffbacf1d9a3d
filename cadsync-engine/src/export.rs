//! 导出器：查询存储 → 重建交换结构 → 序列化 → 记录任务结果。
//!
//! 阶段：`Started → Reconstructing → Writing → {Completed, Failed}`。
//! 任务先以 pending 提交，进入重建前推进到 processing；任何不可恢复的错误
//! 都把任务标记为 failed 并保留原因，输出先写入同目录的临时文件，
//! 成功后才改名为最终文件，因此失败时不会留下半成品。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use cadsync_core::geometry::Bounds2D;
use cadsync_core::model::{
    DrawingId, DrawingUnits, ExportCounts, ExportJob, HorizontalJustification, JobId, JobStatus,
    LayerId, Space, StandardAttributes, StandardCategory, StandardEntry, StandardId,
    StyleOverrides, TextAnnotation, VerticalJustification,
};
use cadsync_core::style::Color;
use cadsync_io::{
    AttributeRecord, BlockRecord, DimStyleRecord, DocumentSaver, DxfDocument, DxfFacade,
    DxfVersion, EntityCommon, EntityData, EntityRecord, HatchEdge, HatchLoop, LayerRecord,
    LineTypeRecord, PolylineVertex, TextStyleRecord,
};
use cadsync_store::{Store, StoreError, Transaction};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::convert;
use crate::errors::{ExportError, GeometryError};
use crate::import::CancelFlag;

/// 外部环 + 多段线边界。
const HATCH_LOOP_FLAGS: i32 = 0x01 | 0x02;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub model_space: bool,
    pub paper_space: bool,
    /// 图层白名单；为空表示导出全部图层。
    pub layers: Option<Vec<String>>,
    pub output_dir: PathBuf,
    /// 为空时使用 `<图纸名>-<任务号>.dxf`。
    pub file_name: Option<String>,
    pub cancel: CancelFlag,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            model_space: true,
            paper_space: true,
            layers: None,
            output_dir: PathBuf::from("exports"),
            file_name: None,
            cancel: CancelFlag::default(),
        }
    }
}

impl ExportOptions {
    fn allows(&self, layer: &str) -> bool {
        match &self.layers {
            None => true,
            Some(names) => names.iter().any(|name| name.eq_ignore_ascii_case(layer)),
        }
    }

    fn wants(&self, space: Space) -> bool {
        match space {
            Space::Model => self.model_space,
            Space::Paper => self.paper_space,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Started,
    Reconstructing,
    Writing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub job_id: JobId,
    pub location: PathBuf,
    pub counts: ExportCounts,
    pub warnings: Vec<String>,
}

pub struct Exporter<'s> {
    store: &'s dyn Store,
    saver: Box<dyn DocumentSaver + 's>,
    phase: ExportPhase,
}

impl<'s> Exporter<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self::with_saver(store, Box::new(DxfFacade::new()))
    }

    pub fn with_saver(store: &'s dyn Store, saver: Box<dyn DocumentSaver + 's>) -> Self {
        Self {
            store,
            saver,
            phase: ExportPhase::Started,
        }
    }

    #[inline]
    pub fn phase(&self) -> ExportPhase {
        self.phase
    }

    /// 导出图纸。任务创建之后的失败以 [`ExportError::JobFailed`] 返回，
    /// 其中带有任务标识，任务本身已记为 failed。
    pub fn export(
        &mut self,
        drawing: DrawingId,
        version: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult, ExportError> {
        self.enter(ExportPhase::Started);
        let target: DxfVersion = version
            .parse()
            .map_err(|_| ExportError::UnsupportedVersion(version.to_string()))?;

        let mut job = ExportJob::pending(drawing, target.tag());
        let job_id = {
            let mut tx = self.store.begin()?;
            let name = tx
                .drawing(drawing)?
                .map(|drawing| drawing.name)
                .ok_or(ExportError::DrawingNotFound(drawing))?;
            let id = tx.insert_job(&job)?;
            tx.commit()?;
            info!(drawing = %drawing, job = %id, version = %target, name = %name, "导出任务已创建");
            id
        };

        job.status = JobStatus::Processing;
        if let Err(err) = self.save_job(job_id, &job) {
            self.enter(ExportPhase::Failed);
            return Err(ExportError::JobFailed {
                job: job_id,
                source: Box::new(err.into()),
            });
        }

        match self.produce(job_id, &mut job, target, options) {
            Ok(result) => {
                self.enter(ExportPhase::Completed);
                info!(
                    job = %job_id,
                    location = %result.location.display(),
                    primitives = result.counts.primitives,
                    warnings = result.warnings.len(),
                    "导出完成"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(job = %job_id, error = %err, "导出失败");
                job.status = JobStatus::Failed;
                job.error = Some(err.to_string());
                job.output = None;
                job.finished_at = Some(Utc::now());
                if let Err(record) = self.save_job(job_id, &job) {
                    warn!(job = %job_id, error = %record, "无法记录导出任务失败状态");
                }
                self.enter(ExportPhase::Failed);
                Err(ExportError::JobFailed {
                    job: job_id,
                    source: Box::new(err),
                })
            }
        }
    }

    fn produce(
        &mut self,
        job_id: JobId,
        job: &mut ExportJob,
        version: DxfVersion,
        options: &ExportOptions,
    ) -> Result<ExportResult, ExportError> {
        self.enter(ExportPhase::Reconstructing);
        let (document, drawing_name, counts, mut warnings) = {
            let mut tx = self.store.begin()?;
            let rebuilt = Rebuild::run(tx.as_mut(), job.drawing_id, version, options);
            if let Err(err) = tx.rollback() {
                debug!(error = %err, "关闭只读事务失败");
            }
            rebuilt?
        };
        checkpoint(options)?;

        self.enter(ExportPhase::Writing);
        fs::create_dir_all(&options.output_dir).map_err(|source| ExportError::Output {
            path: options.output_dir.clone(),
            source,
        })?;
        let file_name = options
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}-{job_id}.dxf", sanitize(&drawing_name)));
        let location = options.output_dir.join(file_name);
        let mut staging =
            NamedTempFile::new_in(&options.output_dir).map_err(|source| ExportError::Output {
                path: options.output_dir.clone(),
                source,
            })?;
        let report = self
            .saver
            .save(&document, staging.as_file_mut())
            .map_err(ExportError::Write)?;
        warnings.extend(report.warnings);
        checkpoint(options)?;
        staging
            .persist(&location)
            .map_err(|err| ExportError::Output {
                path: location.clone(),
                source: err.error,
            })?;

        job.status = JobStatus::Completed;
        job.counts = counts;
        job.warnings = warnings.clone();
        job.output = Some(location.display().to_string());
        job.finished_at = Some(Utc::now());
        if let Err(err) = self.save_job(job_id, job) {
            discard(&location);
            return Err(err.into());
        }
        Ok(ExportResult {
            job_id,
            location,
            counts,
            warnings,
        })
    }

    fn save_job(&self, id: JobId, job: &ExportJob) -> Result<(), StoreError> {
        let mut tx = self.store.begin()?;
        tx.update_job(id, job)?;
        tx.commit()?;
        debug!(job = %id, status = %job.status, "导出任务状态已更新");
        Ok(())
    }

    fn enter(&mut self, phase: ExportPhase) {
        debug!(from = ?self.phase, to = ?phase, "导出阶段切换");
        self.phase = phase;
    }
}

fn checkpoint(options: &ExportOptions) -> Result<(), ExportError> {
    if options.cancel.is_cancelled() {
        Err(ExportError::Cancelled)
    } else {
        Ok(())
    }
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "无法删除导出文件");
    }
}

/// 文件名只保留字母数字、`-` 与 `_`。
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "drawing".to_string()
    } else {
        cleaned
    }
}

/// 重建阶段的状态：在一个只读事务内把存储记录还原为交换结构。
struct Rebuild<'a> {
    tx: &'a mut dyn Transaction,
    options: &'a ExportOptions,
    document: DxfDocument,
    counts: ExportCounts,
    warnings: Vec<String>,
    layer_names: HashMap<LayerId, String>,
    standards: HashMap<StandardId, Option<StandardEntry>>,
    line_types: BTreeMap<String, LineTypeRecord>,
    text_styles: BTreeMap<String, TextStyleRecord>,
    dim_styles: BTreeMap<String, DimStyleRecord>,
    approximated: BTreeMap<&'static str, usize>,
}

type Rebuilt = (DxfDocument, String, ExportCounts, Vec<String>);

impl<'a> Rebuild<'a> {
    fn run(
        tx: &'a mut dyn Transaction,
        drawing_id: DrawingId,
        version: DxfVersion,
        options: &'a ExportOptions,
    ) -> Result<Rebuilt, ExportError> {
        let drawing = tx
            .drawing(drawing_id)?
            .ok_or(ExportError::DrawingNotFound(drawing_id))?;
        let mut document = DxfDocument::new(version);
        if drawing.units != DrawingUnits::Unitless {
            document.units = Some(drawing.units.code());
        }
        let mut rebuild = Rebuild {
            tx,
            options,
            document,
            counts: ExportCounts::default(),
            warnings: Vec::new(),
            layer_names: HashMap::new(),
            standards: HashMap::new(),
            line_types: BTreeMap::new(),
            text_styles: BTreeMap::new(),
            dim_styles: BTreeMap::new(),
            approximated: BTreeMap::new(),
        };
        rebuild.layers(drawing_id)?;
        checkpoint(options)?;
        rebuild.primitives(drawing_id)?;
        rebuild.texts(drawing_id)?;
        rebuild.dimensions(drawing_id)?;
        rebuild.hatches(drawing_id)?;
        checkpoint(options)?;
        rebuild.placements(drawing_id)?;
        rebuild.viewports(drawing_id)?;
        Ok(rebuild.finish(drawing.name))
    }

    fn layers(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        for (id, layer) in self.tx.layers(drawing)? {
            self.layer_names.insert(id, layer.name.clone());
            if !self.options.allows(&layer.name) {
                continue;
            }
            let line_type = match layer.line_style {
                Some(style) => self.line_type(style)?,
                None => None,
            };
            let mut flags = 0;
            if layer.frozen {
                flags |= 0x01;
            }
            if layer.locked {
                flags |= 0x04;
            }
            self.document.layers.push(LayerRecord {
                handle: layer.handle,
                name: layer.name,
                color: layer.color.aci(),
                true_color: layer.color.true_color(),
                line_type,
                line_weight: Some(layer.line_weight.to_dxf()),
                flags,
            });
        }
        Ok(())
    }

    /// 返回实体所在图层名；图层不在白名单或空间未选中时返回 `None`。
    fn target_layer(&self, layer: LayerId, space: Space) -> Option<String> {
        if !self.options.wants(space) {
            return None;
        }
        self.layer_names
            .get(&layer)
            .filter(|name| self.options.allows(name))
            .cloned()
    }

    fn primitives(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        for (id, primitive) in self.tx.primitives(drawing)? {
            let Some(layer) = self.target_layer(primitive.layer_id, primitive.space) else {
                continue;
            };
            let rebuilt = convert::from_normalized(primitive.kind, &primitive.shape)
                .map_err(|source| ExportError::Geometry {
                    what: format!("primitive {id}"),
                    source,
                })?;
            if !rebuilt.exact {
                *self.approximated.entry(primitive.kind.as_str()).or_insert(0) += 1;
            }
            let common = self.common(
                primitive.handle,
                layer,
                primitive.space,
                &primitive.style,
            )?;
            self.document
                .entities
                .push(EntityRecord::new(common, rebuilt.data));
            self.counts.primitives += 1;
        }
        Ok(())
    }

    fn texts(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        for (_, text) in self.tx.texts(drawing)? {
            let Some(layer) = self.target_layer(text.layer_id, text.space) else {
                continue;
            };
            let style = match text.style {
                Some(style) => self.text_style(style)?,
                None => None,
            };
            let common = self.common(
                text.handle.clone(),
                layer,
                text.space,
                &StyleOverrides::default(),
            )?;
            let data = text_entity(text, style);
            self.document.entities.push(EntityRecord::new(common, data));
            self.counts.text += 1;
        }
        Ok(())
    }

    fn dimensions(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        for (_, dimension) in self.tx.dimensions(drawing)? {
            let Some(layer) = self.target_layer(dimension.layer_id, dimension.space) else {
                continue;
            };
            let style = self.dim_style(dimension.style)?;
            let common = self.common(
                dimension.handle,
                layer,
                dimension.space,
                &StyleOverrides::default(),
            )?;
            let geometry = dimension.geometry;
            let data = EntityData::Dimension {
                block_name: None,
                style,
                flags: dimension.kind.flags(),
                definition_point: geometry.definition_point,
                text_midpoint: geometry.text_position,
                first_point: geometry.first_point,
                second_point: geometry.second_point,
                arc_point: geometry.arc_point,
                arc_location: geometry.arc_location,
                text: dimension.text_override,
                measurement: dimension.measurement,
                rotation: dimension.rotation,
            };
            self.document.entities.push(EntityRecord::new(common, data));
            self.counts.dimensions += 1;
        }
        Ok(())
    }

    fn hatches(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        for (id, hatch) in self.tx.hatches(drawing)? {
            let Some(layer) = self.target_layer(hatch.layer_id, hatch.space) else {
                continue;
            };
            let pattern_name = match self.standard(hatch.pattern)? {
                Some(entry) => entry.name,
                None => if hatch.solid { "SOLID" } else { "USER" }.to_string(),
            };
            let mut loops = Vec::with_capacity(hatch.boundary.len());
            for ring in &hatch.boundary {
                let (ring, auto_closed) = convert::close_ring(ring).map_err(|source| {
                    ExportError::Geometry {
                        what: format!("hatch {id}"),
                        source,
                    }
                })?;
                if auto_closed {
                    self.warn(format!(
                        "填充 {} 的边界未闭合，已自动闭合",
                        hatch.handle.as_deref().unwrap_or(&id.to_string())
                    ));
                }
                let vertices = ring[..ring.len() - 1]
                    .iter()
                    .copied()
                    .map(PolylineVertex::new)
                    .collect();
                loops.push(HatchLoop {
                    flags: HATCH_LOOP_FLAGS,
                    edges: vec![HatchEdge::Polyline {
                        vertices,
                        closed: true,
                    }],
                });
            }
            if loops.is_empty() {
                return Err(ExportError::Geometry {
                    what: format!("hatch {id}"),
                    source: GeometryError::TooFewRingPoints { distinct: 0 },
                });
            }
            let elevation = hatch
                .boundary
                .first()
                .and_then(|ring| ring.first())
                .map(|point| point.z())
                .unwrap_or(0.0);
            let common = self.common(
                hatch.handle,
                layer,
                hatch.space,
                &StyleOverrides::default(),
            )?;
            let data = EntityData::Hatch {
                pattern_name,
                solid: hatch.solid,
                scale: hatch.scale,
                angle: hatch.angle,
                elevation,
                loops,
            };
            self.document.entities.push(EntityRecord::new(common, data));
            self.counts.hatches += 1;
        }
        Ok(())
    }

    fn placements(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        let mut used: Vec<(String, Option<StandardId>)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (_, placement) in self.tx.placements(drawing)? {
            let layer = match placement.layer_id {
                Some(layer) => self.target_layer(layer, placement.space),
                None if self.options.wants(placement.space) && self.options.allows("0") => {
                    Some("0".to_string())
                }
                None => None,
            };
            let Some(layer) = layer else {
                continue;
            };
            if seen.insert(placement.name.clone()) {
                used.push((placement.name.clone(), placement.symbol));
            }
            let common = self.common(
                placement.handle,
                layer,
                placement.space,
                &StyleOverrides::default(),
            )?;
            let data = EntityData::Insert {
                name: placement.name,
                insert: placement.insert,
                scale: [placement.scale.x, placement.scale.y, placement.scale.z],
                rotation: placement.rotation,
                attributes: placement
                    .attributes
                    .into_iter()
                    .map(|(tag, value)| AttributeRecord {
                        handle: None,
                        tag,
                        value,
                    })
                    .collect(),
            };
            self.document.entities.push(EntityRecord::new(common, data));
            self.counts.symbols += 1;
        }
        for (name, symbol) in used {
            let block = self.symbol_block(&name, symbol)?;
            self.document.blocks.push(block);
        }
        Ok(())
    }

    /// 由符号定义还原块；没有定义时写出空块并给出警告。
    fn symbol_block(
        &mut self,
        name: &str,
        symbol: Option<StandardId>,
    ) -> Result<BlockRecord, ExportError> {
        let entry = match symbol {
            Some(id) => self.standard(id)?,
            None => self
                .tx
                .find_standard(StandardCategory::Symbol, name)?
                .map(|(_, entry)| entry),
        };
        let mut block = BlockRecord::new(name);
        let Some(StandardAttributes::Symbol(definition)) = entry.map(|entry| entry.attributes)
        else {
            self.warn(format!("符号 {name} 没有定义，已写出空块"));
            return Ok(block);
        };
        if let Some(base_point) = definition.base_point {
            block.base_point = base_point;
        }
        block.attribute_tags = definition.attribute_tags;
        for member in definition.members {
            match convert::from_normalized(member.kind, &member.shape) {
                Ok(rebuilt) => {
                    let layer = if self.options.allows(&member.layer) {
                        member.layer
                    } else {
                        "0".to_string()
                    };
                    let mut common = EntityCommon::on_layer(layer);
                    if let Some(color) = member.color {
                        common.color = Some(color.aci());
                        common.true_color = color.true_color();
                    }
                    block.entities.push(EntityRecord::new(common, rebuilt.data));
                }
                Err(err) => self.warn(format!(
                    "符号 {name} 的 {} 成员无法还原，已省略：{err}",
                    member.kind
                )),
            }
        }
        Ok(block)
    }

    fn viewports(&mut self, drawing: DrawingId) -> Result<(), ExportError> {
        if !self.options.paper_space {
            return Ok(());
        }
        for (id, viewport) in self.tx.viewports(drawing)? {
            let (ring, auto_closed) =
                convert::close_ring(&viewport.boundary).map_err(|source| ExportError::Geometry {
                    what: format!("viewport {id}"),
                    source,
                })?;
            if auto_closed {
                self.warn(format!(
                    "视口 {} 的边界未闭合，已自动闭合",
                    viewport.handle.as_deref().unwrap_or(&id.to_string())
                ));
            }
            let bounds = Bounds2D::from_points(ring.iter());
            let center = bounds.center();
            let height = bounds.height();
            let view_height = if viewport.view_scale > 0.0 {
                height / viewport.view_scale
            } else {
                height
            };
            let frozen_layers = viewport
                .frozen_layers
                .into_iter()
                .filter(|name| self.options.allows(name))
                .collect();
            let mut common = EntityCommon::on_layer("0");
            common.handle = viewport.handle;
            common.paper_space = true;
            let data = EntityData::Viewport {
                center: center.with_z(0.0),
                width: bounds.width(),
                height,
                id: None,
                view_center: viewport.view_center,
                view_height,
                twist: viewport.twist,
                frozen_layers,
            };
            self.document.entities.push(EntityRecord::new(common, data));
            self.counts.viewports += 1;
        }
        Ok(())
    }

    fn common(
        &mut self,
        handle: Option<String>,
        layer: String,
        space: Space,
        style: &StyleOverrides,
    ) -> Result<EntityCommon, ExportError> {
        let line_type = match style.line_style {
            Some(id) => self.line_type(id)?,
            None => None,
        };
        Ok(EntityCommon {
            handle,
            layer,
            line_type,
            color: style.color.map(Color::aci),
            true_color: style.color.and_then(Color::true_color),
            line_weight: style.line_weight.map(|weight| weight.to_dxf()),
            transparency: style.transparency.map(|value| value.to_dxf()),
            paper_space: space == Space::Paper,
        })
    }

    fn standard(&mut self, id: StandardId) -> Result<Option<StandardEntry>, StoreError> {
        if let Some(entry) = self.standards.get(&id) {
            return Ok(entry.clone());
        }
        let entry = self.tx.standard(id)?;
        if entry.is_none() {
            warn!(standard = %id, "引用的标准库条目不存在");
        }
        self.standards.insert(id, entry.clone());
        Ok(entry)
    }

    /// 线型名，同时登记线型表记录。
    fn line_type(&mut self, id: StandardId) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.standard(id)? else {
            return Ok(None);
        };
        if let StandardAttributes::LineStyle {
            description,
            pattern,
        } = &entry.attributes
        {
            self.line_types
                .entry(entry.name.clone())
                .or_insert_with(|| LineTypeRecord {
                    handle: None,
                    name: entry.name.clone(),
                    description: description.clone(),
                    pattern: pattern.clone(),
                });
        }
        Ok(Some(entry.name))
    }

    fn text_style(&mut self, id: StandardId) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.standard(id)? else {
            return Ok(None);
        };
        if let StandardAttributes::TextStyle {
            font,
            height,
            width_factor,
        } = &entry.attributes
        {
            self.text_styles
                .entry(entry.name.clone())
                .or_insert_with(|| TextStyleRecord {
                    handle: None,
                    name: entry.name.clone(),
                    font: font.clone(),
                    height: *height,
                    width_factor: *width_factor,
                });
        }
        Ok(Some(entry.name))
    }

    fn dim_style(&mut self, id: StandardId) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.standard(id)? else {
            return Ok(None);
        };
        if let StandardAttributes::DimensionStyle {
            text_height,
            arrow_size,
        } = &entry.attributes
        {
            self.dim_styles
                .entry(entry.name.clone())
                .or_insert_with(|| DimStyleRecord {
                    handle: None,
                    name: entry.name.clone(),
                    text_height: *text_height,
                    arrow_size: *arrow_size,
                });
        }
        Ok(Some(entry.name))
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    fn finish(mut self, drawing_name: String) -> Rebuilt {
        for (kind, count) in std::mem::take(&mut self.approximated) {
            self.warnings
                .push(format!("{count} 个 {kind} 图元以多段线近似导出"));
        }
        self.document.line_types = self.line_types.into_values().collect();
        self.document.text_styles = self.text_styles.into_values().collect();
        self.document.dim_styles = self.dim_styles.into_values().collect();
        (self.document, drawing_name, self.counts, self.warnings)
    }
}

fn text_entity(text: TextAnnotation, style: Option<String>) -> EntityData {
    if text.multiline {
        return EntityData::MText {
            insert: text.insert,
            height: text.height,
            content: text.content,
            rotation: text.rotation,
            style,
            attachment: justification_attachment(text.horizontal, text.vertical),
            reference_width: None,
        };
    }
    let justified = text.horizontal != HorizontalJustification::Left
        || text.vertical != VerticalJustification::Baseline;
    EntityData::Text {
        insert: text.insert,
        alignment_point: justified.then_some(text.insert),
        height: text.height,
        content: text.content,
        rotation: text.rotation,
        style,
        horizontal: text.horizontal.to_dxf(),
        vertical: text.vertical.to_dxf(),
    }
}

/// 对齐方式换算为 MTEXT 附着点 1-9。
fn justification_attachment(
    horizontal: HorizontalJustification,
    vertical: VerticalJustification,
) -> i16 {
    let column = match horizontal {
        HorizontalJustification::Left => 0,
        HorizontalJustification::Right => 2,
        _ => 1,
    };
    let row = match vertical {
        VerticalJustification::Top => 0,
        VerticalJustification::Middle => 1,
        VerticalJustification::Bottom | VerticalJustification::Baseline => 2,
    };
    row * 3 + column + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::attachment_justification;

    #[test]
    fn attachment_round_trips_through_justification() {
        for attachment in 1..=9 {
            let (horizontal, vertical) = attachment_justification(attachment);
            assert_eq!(justification_attachment(horizontal, vertical), attachment);
        }
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize("Site Plan/rev 2"), "Site_Plan_rev_2");
        assert_eq!(sanitize("C-STORM_01"), "C-STORM_01");
        assert_eq!(sanitize(""), "drawing");
    }

    #[test]
    fn allow_list_ignores_case() {
        let options = ExportOptions {
            layers: Some(vec!["C-STORM".to_string()]),
            ..ExportOptions::default()
        };
        assert!(options.allows("c-storm"));
        assert!(!options.allows("C-SEWER"));
        assert!(ExportOptions::default().allows("C-SEWER"));
    }
}
