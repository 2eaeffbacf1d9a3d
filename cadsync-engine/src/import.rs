//! 导入器：解码 → 名称解析 → 几何转换 → 在单个事务内持久化。
//!
//! 阶段：`Started → Parsing → Persisting → {Committed, RolledBack}`。
//! 解析失败发生在任何写入之前；单个实体的几何错误记录后跳过（fail-fast 时中止），
//! 存储错误、取消与参考系冲突都回滚整个事务。

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadsync_core::crs::CoordinateReference;
use cadsync_core::geometry::Point3;
use cadsync_core::model::{
    DimensionAnnotation, DimensionGeometry, DimensionKind, Drawing, DrawingId, DrawingUnits,
    HatchInstance, HorizontalJustification, LayerId, LayoutViewport, PrimitiveEntity,
    ScaleFactors, Space, StandardAttributes, StandardId, StyleOverrides, SymbolDefinition,
    SymbolMember, SymbolPlacement, TextAnnotation, VerticalJustification,
};
use cadsync_core::style::{Color, LineWeight, Transparency};
use cadsync_io::{
    BlockRecord, DocumentLoader, DxfDocument, DxfFacade, EntityCommon, EntityData, EntityRecord,
    LayerRecord, LineTypeRecord,
};
use cadsync_store::{Store, StoreError, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convert::{self, ConversionSettings};
use crate::errors::{GeometryError, ImportError};
use crate::resolve::{LayerHints, NameResolver, ResolverStats};

const DEFAULT_STYLE: &str = "Standard";
const DEFAULT_LAYER: &str = "0";
/// 图纸空间整体视口的编号，不作为布局视口导入。
const OVERALL_VIEWPORT_ID: i16 = 1;

/// 导入目标：已有图纸或新建图纸。
#[derive(Debug, Clone, PartialEq)]
pub enum ImportTarget {
    Existing(DrawingId),
    New {
        name: String,
        /// 为空时取源文件的 `$INSUNITS`。
        units: Option<DrawingUnits>,
        scale: f64,
    },
}

impl ImportTarget {
    pub fn new_drawing(name: impl Into<String>) -> Self {
        ImportTarget::New {
            name: name.into(),
            units: None,
            scale: 1.0,
        }
    }
}

/// 跨线程共享的取消标记。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub model_space: bool,
    pub paper_space: bool,
    /// 宿主提供的参考系标签，核心不做查询或变换。
    pub crs: CoordinateReference,
    pub conversion: ConversionSettings,
    pub fail_fast: bool,
    /// 把具名块登记为符号定义。
    pub register_symbols: bool,
    pub cancel: CancelFlag,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            model_space: true,
            paper_space: true,
            crs: CoordinateReference::Local,
            conversion: ConversionSettings::default(),
            fail_fast: false,
            register_symbols: true,
            cancel: CancelFlag::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Started,
    Parsing,
    Persisting,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    pub primitives: usize,
    pub text: usize,
    pub dimensions: usize,
    pub hatches: usize,
    pub placements: usize,
    pub viewports: usize,
    /// 引用到的不同图层名数量。
    pub layers: usize,
    /// 引用到的不同线型名数量。
    pub line_styles: usize,
    pub symbol_definitions: usize,
}

/// 被跳过的单个实体：源句柄、实体类型与原因。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub handle: Option<String>,
    pub entity: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub drawing_id: DrawingId,
    pub counts: ImportCounts,
    pub layer_names: Vec<String>,
    pub line_style_names: Vec<String>,
    pub errors: Vec<ItemError>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub resolver: ResolverStats,
}

pub struct Importer<'s> {
    store: &'s dyn Store,
    loader: Box<dyn DocumentLoader + 's>,
    resolver: NameResolver,
    phase: ImportPhase,
}

impl<'s> Importer<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self::with_loader(store, Box::new(DxfFacade::new()))
    }

    pub fn with_loader(store: &'s dyn Store, loader: Box<dyn DocumentLoader + 's>) -> Self {
        Self {
            store,
            loader,
            resolver: NameResolver::new(),
            phase: ImportPhase::Started,
        }
    }

    #[inline]
    pub fn phase(&self) -> ImportPhase {
        self.phase
    }

    /// 执行一次导入。无论成败都会清空名称缓存。
    pub fn run(
        &mut self,
        source: &mut dyn Read,
        target: &ImportTarget,
        options: &ImportOptions,
    ) -> Result<ImportResult, ImportError> {
        self.enter(ImportPhase::Started);
        let outcome = self.run_inner(source, target, options);
        self.resolver.clear();
        if let Err(err) = &outcome {
            warn!(error = %err, "导入失败，未写入任何数据");
            self.enter(ImportPhase::RolledBack);
        }
        outcome
    }

    fn run_inner(
        &mut self,
        source: &mut dyn Read,
        target: &ImportTarget,
        options: &ImportOptions,
    ) -> Result<ImportResult, ImportError> {
        self.enter(ImportPhase::Parsing);
        let document = self.loader.load(source).map_err(ImportError::Format)?;
        info!(
            version = %document.version,
            entities = document.entities.len(),
            blocks = document.blocks.len(),
            "交换文件解析完成"
        );
        if options.cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        self.enter(ImportPhase::Persisting);
        let mut tx = self.store.begin()?;
        let staged = Session::stage(tx.as_mut(), &mut self.resolver, &document, target, options)
            .and_then(|result| {
                self.resolver.flush_usage(tx.as_mut())?;
                if options.cancel.is_cancelled() {
                    return Err(ImportError::Cancelled);
                }
                Ok(result)
            });
        let mut result = match staged {
            Ok(result) => result,
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "回滚导入事务失败");
                }
                return Err(err);
            }
        };
        tx.commit()?;
        result.resolver = self.resolver.stats();
        self.enter(ImportPhase::Committed);
        info!(
            drawing = %result.drawing_id,
            primitives = result.counts.primitives,
            text = result.counts.text,
            dimensions = result.counts.dimensions,
            hatches = result.counts.hatches,
            placements = result.counts.placements,
            viewports = result.counts.viewports,
            skipped = result.errors.len(),
            "导入已提交"
        );
        Ok(result)
    }

    fn enter(&mut self, phase: ImportPhase) {
        debug!(from = ?self.phase, to = ?phase, "导入阶段切换");
        self.phase = phase;
    }
}

/// 单个实体失败的两种性质：可跳过的几何错误与必须中止的错误。
enum EntityFailure {
    Geometry(GeometryError),
    Fatal(ImportError),
}

impl From<GeometryError> for EntityFailure {
    fn from(err: GeometryError) -> Self {
        EntityFailure::Geometry(err)
    }
}

impl From<StoreError> for EntityFailure {
    fn from(err: StoreError) -> Self {
        EntityFailure::Fatal(ImportError::Storage(err))
    }
}

/// 一次导入在事务内的暂存状态。
struct Session<'a> {
    tx: &'a mut dyn Transaction,
    resolver: &'a mut NameResolver,
    document: &'a DxfDocument,
    options: &'a ImportOptions,
    drawing: DrawingId,
    crs: CoordinateReference,
    counts: ImportCounts,
    layer_names: BTreeSet<String>,
    line_style_names: BTreeSet<String>,
    errors: Vec<ItemError>,
    warnings: Vec<String>,
}

impl<'a> Session<'a> {
    fn stage(
        tx: &'a mut dyn Transaction,
        resolver: &'a mut NameResolver,
        document: &'a DxfDocument,
        target: &ImportTarget,
        options: &'a ImportOptions,
    ) -> Result<ImportResult, ImportError> {
        let (drawing, crs) = open_drawing(tx, document, target, options)?;
        let mut session = Session {
            tx,
            resolver,
            document,
            options,
            drawing,
            crs,
            counts: ImportCounts::default(),
            layer_names: BTreeSet::new(),
            line_style_names: BTreeSet::new(),
            errors: Vec::new(),
            warnings: document.warnings.clone(),
        };

        if options.register_symbols {
            for block in document.blocks.iter().filter(|block| !block.is_anonymous()) {
                session.register_block(block)?;
            }
        }

        for (space, record) in session.entities() {
            if options.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            match session.stage_entity(space, record) {
                Ok(()) => {}
                Err(EntityFailure::Fatal(err)) => return Err(err),
                Err(EntityFailure::Geometry(err)) => {
                    let handle = record.common.handle.clone();
                    let entity = record.data.type_name().to_string();
                    if options.fail_fast {
                        return Err(ImportError::Geometry {
                            entity,
                            handle: handle.unwrap_or_default(),
                            source: err,
                        });
                    }
                    warn!(entity = %entity, handle = ?handle, error = %err, "跳过无法转换的实体");
                    session.errors.push(ItemError {
                        handle,
                        entity,
                        reason: err.to_string(),
                    });
                }
            }
        }

        for skipped in &document.skipped {
            session.errors.push(ItemError {
                handle: skipped.handle.clone(),
                entity: skipped.kind.clone(),
                reason: "unsupported entity type".to_string(),
            });
        }

        Ok(session.finish())
    }

    /// 按文件顺序列出要导入的实体及其所属空间。
    fn entities(&self) -> Vec<(Space, &'a EntityRecord)> {
        let document = self.document;
        let mut selected: Vec<(Space, &'a EntityRecord)> = Vec::new();
        for record in &document.entities {
            let space = if record.common.paper_space {
                Space::Paper
            } else {
                Space::Model
            };
            if self.wants(space) {
                selected.push((space, record));
            }
        }
        if self.options.paper_space {
            selected.extend(
                document
                    .paper_space_block_entities()
                    .map(|record| (Space::Paper, record)),
            );
        }
        selected
    }

    fn wants(&self, space: Space) -> bool {
        match space {
            Space::Model => self.options.model_space,
            Space::Paper => self.options.paper_space,
        }
    }

    fn stage_entity(&mut self, space: Space, record: &EntityRecord) -> Result<(), EntityFailure> {
        let common = &record.common;
        match &record.data {
            EntityData::Text {
                insert,
                alignment_point,
                height,
                content,
                rotation,
                style,
                horizontal,
                vertical,
            } => {
                finite("TEXT", &[*insert])?;
                let justified = *horizontal != 0 || *vertical != 0;
                let insert = match alignment_point {
                    Some(point) if justified => *point,
                    _ => *insert,
                };
                let text = TextAnnotation {
                    drawing_id: self.drawing,
                    layer_id: self.layer(&common.layer)?,
                    content: content.clone(),
                    insert,
                    height: *height,
                    rotation: *rotation,
                    style: Some(self.text_style(style.as_deref())?),
                    horizontal: HorizontalJustification::from_dxf(*horizontal),
                    vertical: VerticalJustification::from_dxf(*vertical),
                    multiline: false,
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                };
                self.tx.insert_text(&text)?;
                self.counts.text += 1;
            }
            EntityData::MText {
                insert,
                height,
                content,
                rotation,
                style,
                attachment,
                ..
            } => {
                finite("MTEXT", &[*insert])?;
                let (horizontal, vertical) = attachment_justification(*attachment);
                let text = TextAnnotation {
                    drawing_id: self.drawing,
                    layer_id: self.layer(&common.layer)?,
                    content: content.clone(),
                    insert: *insert,
                    height: *height,
                    rotation: *rotation,
                    style: Some(self.text_style(style.as_deref())?),
                    horizontal,
                    vertical,
                    multiline: true,
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                };
                self.tx.insert_text(&text)?;
                self.counts.text += 1;
            }
            EntityData::Dimension {
                style,
                flags,
                definition_point,
                text_midpoint,
                first_point,
                second_point,
                arc_point,
                arc_location,
                text,
                measurement,
                rotation,
                ..
            } => {
                let optional = [first_point, second_point, arc_point, arc_location];
                finite("DIMENSION", &[*definition_point, *text_midpoint])?;
                finite(
                    "DIMENSION",
                    &optional.iter().filter_map(|point| **point).collect::<Vec<_>>(),
                )?;
                let dimension = DimensionAnnotation {
                    drawing_id: self.drawing,
                    layer_id: self.layer(&common.layer)?,
                    style: self.dimension_style(style.as_deref())?,
                    kind: DimensionKind::from_flags(*flags),
                    geometry: DimensionGeometry {
                        definition_point: *definition_point,
                        text_position: *text_midpoint,
                        first_point: *first_point,
                        second_point: *second_point,
                        arc_point: *arc_point,
                        arc_location: *arc_location,
                    },
                    text_override: text
                        .clone()
                        .filter(|text| !text.is_empty() && text != "<>"),
                    measurement: *measurement,
                    rotation: *rotation,
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                };
                self.tx.insert_dimension(&dimension)?;
                self.counts.dimensions += 1;
            }
            EntityData::Hatch {
                pattern_name,
                solid,
                scale,
                angle,
                elevation,
                loops,
            } => {
                if loops.is_empty() {
                    return Err(GeometryError::Degenerate {
                        kind: "HATCH",
                        reason: "没有边界环".to_string(),
                    }
                    .into());
                }
                let mut boundary = Vec::with_capacity(loops.len());
                for hatch_loop in loops {
                    let (points, explicit) = convert::hatch_loop_points(
                        hatch_loop,
                        *elevation,
                        &self.options.conversion,
                    )?;
                    let (ring, auto_closed) = convert::close_ring(&points)?;
                    if auto_closed && !explicit {
                        self.warn(format!(
                            "HATCH {} 的边界环未闭合，已自动闭合",
                            common.handle.as_deref().unwrap_or("?")
                        ));
                    }
                    boundary.push(ring);
                }
                let pattern_name = if pattern_name.is_empty() {
                    if *solid { "SOLID" } else { "USER" }
                } else {
                    pattern_name.as_str()
                };
                let pattern = self.resolver.resolve_fill_pattern(
                    &mut *self.tx,
                    pattern_name,
                    Some(StandardAttributes::FillPattern { solid: *solid }),
                )?;
                let hatch = HatchInstance {
                    drawing_id: self.drawing,
                    layer_id: self.layer(&common.layer)?,
                    pattern,
                    boundary,
                    solid: *solid,
                    scale: *scale,
                    angle: *angle,
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                };
                self.tx.insert_hatch(&hatch)?;
                self.counts.hatches += 1;
            }
            EntityData::Insert {
                name,
                insert,
                scale,
                rotation,
                attributes,
            } => {
                finite("INSERT", &[*insert])?;
                let symbol = self.resolver.resolve_symbol(&mut *self.tx, name)?;
                let placement = SymbolPlacement {
                    drawing_id: self.drawing,
                    layer_id: Some(self.layer(&common.layer)?),
                    name: name.clone(),
                    symbol,
                    insert: *insert,
                    scale: ScaleFactors {
                        x: scale[0],
                        y: scale[1],
                        z: scale[2],
                    },
                    rotation: *rotation,
                    attributes: attributes
                        .iter()
                        .map(|attribute| (attribute.tag.clone(), attribute.value.clone()))
                        .collect::<BTreeMap<_, _>>(),
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                };
                self.tx.insert_placement(&placement)?;
                self.counts.placements += 1;
            }
            EntityData::Viewport {
                center,
                width,
                height,
                id,
                view_center,
                view_height,
                twist,
                frozen_layers,
            } => {
                if *id == Some(OVERALL_VIEWPORT_ID) {
                    debug!(handle = ?common.handle, "跳过图纸空间整体视口");
                    return Ok(());
                }
                finite("VIEWPORT", &[*center, *view_center])?;
                if !(*width > 0.0 && *height > 0.0) {
                    return Err(GeometryError::Degenerate {
                        kind: "VIEWPORT",
                        reason: "宽度或高度不为正".to_string(),
                    }
                    .into());
                }
                let viewport = LayoutViewport {
                    drawing_id: self.drawing,
                    boundary: viewport_rectangle(*center, *width, *height),
                    view_center: *view_center,
                    view_scale: if *view_height > 0.0 {
                        height / view_height
                    } else {
                        1.0
                    },
                    twist: *twist,
                    frozen_layers: frozen_layers.clone(),
                    crs: self.crs.clone(),
                    handle: common.handle.clone(),
                };
                self.tx.insert_viewport(&viewport)?;
                self.counts.viewports += 1;
            }
            data => {
                let normalized = convert::to_normalized(data, &self.options.conversion)?;
                let primitive = PrimitiveEntity {
                    drawing_id: self.drawing,
                    layer_id: self.layer(&common.layer)?,
                    kind: normalized.kind,
                    shape: normalized.shape,
                    crs: self.crs.clone(),
                    space,
                    handle: common.handle.clone(),
                    style: self.overrides(common)?,
                };
                self.tx.insert_primitive(&primitive)?;
                self.counts.primitives += 1;
            }
        }
        Ok(())
    }

    fn register_block(&mut self, block: &BlockRecord) -> Result<(), ImportError> {
        let mut members = Vec::with_capacity(block.entities.len());
        for record in &block.entities {
            match convert::to_normalized(&record.data, &self.options.conversion) {
                Ok(normalized) => members.push(SymbolMember {
                    kind: normalized.kind,
                    shape: normalized.shape,
                    layer: record.common.layer.clone(),
                    color: Color::from_dxf(record.common.color, record.common.true_color),
                }),
                Err(err) => self.warn(format!(
                    "块 {} 中的 {} 未登记为符号成员：{err}",
                    block.name,
                    record.data.type_name()
                )),
            }
        }
        let definition = SymbolDefinition {
            base_point: Some(block.base_point),
            members,
            attribute_tags: block.attribute_tags.clone(),
        };
        self.resolver
            .register_symbol(&mut *self.tx, &block.name, definition)?;
        self.counts.symbol_definitions += 1;
        Ok(())
    }

    fn layer(&mut self, name: &str) -> Result<LayerId, StoreError> {
        let name = if name.is_empty() { DEFAULT_LAYER } else { name };
        let hints = self.document.layer(name).map(layer_hints);
        if let Some(line_style) = hints.as_ref().and_then(|hints| hints.line_style.clone()) {
            self.line_style(&line_style)?;
        }
        let (layer, _) =
            self.resolver
                .resolve_layer(&mut *self.tx, self.drawing, name, hints.as_ref())?;
        self.layer_names.insert(name.to_string());
        Ok(layer)
    }

    fn line_style(&mut self, name: &str) -> Result<StandardId, StoreError> {
        let hint = self
            .document
            .line_types
            .iter()
            .find(|record| record.name.eq_ignore_ascii_case(name))
            .map(|record| StandardAttributes::LineStyle {
                description: record.description.clone(),
                pattern: record.pattern.clone(),
            });
        self.line_style_names.insert(name.to_string());
        self.resolver.resolve_line_style(&mut *self.tx, name, hint)
    }

    fn text_style(&mut self, name: Option<&str>) -> Result<StandardId, StoreError> {
        let name = name.filter(|name| !name.is_empty()).unwrap_or(DEFAULT_STYLE);
        let hint = self
            .document
            .text_styles
            .iter()
            .find(|record| record.name.eq_ignore_ascii_case(name))
            .map(|record| StandardAttributes::TextStyle {
                font: record.font.clone(),
                height: record.height,
                width_factor: record.width_factor,
            });
        self.resolver.resolve_text_style(&mut *self.tx, name, hint)
    }

    fn dimension_style(&mut self, name: Option<&str>) -> Result<StandardId, StoreError> {
        let name = name.filter(|name| !name.is_empty()).unwrap_or(DEFAULT_STYLE);
        let hint = self
            .document
            .dim_styles
            .iter()
            .find(|record| record.name.eq_ignore_ascii_case(name))
            .map(|record| StandardAttributes::DimensionStyle {
                text_height: record.text_height,
                arrow_size: record.arrow_size,
            });
        self.resolver
            .resolve_dimension_style(&mut *self.tx, name, hint)
    }

    /// 实体自身的样式覆盖。随层的取值不作为覆盖保存。
    fn overrides(&mut self, common: &EntityCommon) -> Result<StyleOverrides, StoreError> {
        let line_style = match common.line_type.as_deref() {
            Some(name) if !name.is_empty() && !LineTypeRecord::is_pseudo(name) => {
                Some(self.line_style(name)?)
            }
            _ => None,
        };
        Ok(StyleOverrides {
            color: Color::from_dxf(common.color, common.true_color)
                .filter(|color| *color != Color::ByLayer),
            line_style,
            line_weight: common
                .line_weight
                .map(LineWeight::from_dxf)
                .filter(|weight| *weight != LineWeight::ByLayer),
            transparency: common.transparency.and_then(Transparency::from_dxf),
        })
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    fn finish(mut self) -> ImportResult {
        self.counts.layers = self.layer_names.len();
        self.counts.line_styles = self.line_style_names.len();
        ImportResult {
            drawing_id: self.drawing,
            counts: self.counts,
            layer_names: self.layer_names.into_iter().collect(),
            line_style_names: self.line_style_names.into_iter().collect(),
            errors: self.errors,
            warnings: self.warnings,
            resolver: ResolverStats::default(),
        }
    }
}

/// 取得或创建目标图纸。已有图纸的参考系必须与本次请求一致。
fn open_drawing(
    tx: &mut dyn Transaction,
    document: &DxfDocument,
    target: &ImportTarget,
    options: &ImportOptions,
) -> Result<(DrawingId, CoordinateReference), ImportError> {
    match target {
        ImportTarget::Existing(id) => {
            let drawing = tx
                .drawing(*id)?
                .ok_or(ImportError::DrawingNotFound(*id))?;
            if drawing.crs != options.crs {
                return Err(ImportError::CrsMismatch {
                    drawing: *id,
                    existing: drawing.crs,
                    requested: options.crs.clone(),
                });
            }
            Ok((*id, drawing.crs))
        }
        ImportTarget::New { name, units, scale } => {
            let units = units.unwrap_or_else(|| {
                document
                    .units
                    .map(DrawingUnits::from_code)
                    .unwrap_or_default()
            });
            let mut drawing = Drawing::new(name.clone())
                .with_units(units)
                .with_crs(options.crs.clone());
            drawing.scale = *scale;
            let id = tx.insert_drawing(&drawing)?;
            info!(drawing = %id, name = %name, crs = %options.crs, "新建图纸");
            Ok((id, options.crs.clone()))
        }
    }
}

fn layer_hints(record: &LayerRecord) -> LayerHints {
    let color = match Color::from_dxf(Some(record.color), record.true_color) {
        Some(Color::ByLayer | Color::ByBlock) | None => Color::WHITE,
        Some(color) => color,
    };
    let line_weight = match record.line_weight.map(LineWeight::from_dxf) {
        Some(LineWeight::ByLayer | LineWeight::ByBlock) | None => LineWeight::Standard,
        Some(weight) => weight,
    };
    LayerHints {
        color,
        line_style: record
            .line_type
            .clone()
            .filter(|name| !name.is_empty() && !LineTypeRecord::is_pseudo(name)),
        line_weight,
        frozen: record.is_frozen(),
        locked: record.is_locked(),
        handle: record.handle.clone(),
    }
}

/// MTEXT 附着点 1-9（左上到右下）换算为对齐方式。
pub(crate) fn attachment_justification(
    attachment: i16,
) -> (HorizontalJustification, VerticalJustification) {
    let index = attachment.clamp(1, 9) - 1;
    (
        HorizontalJustification::from_dxf(index % 3),
        VerticalJustification::from_dxf(3 - index / 3),
    )
}

fn viewport_rectangle(center: Point3, width: f64, height: f64) -> Vec<Point3> {
    let (half_width, half_height) = (width / 2.0, height / 2.0);
    let corner = |dx: f64, dy: f64| Point3::new(center.x() + dx, center.y() + dy, 0.0);
    vec![
        corner(-half_width, -half_height),
        corner(half_width, -half_height),
        corner(half_width, half_height),
        corner(-half_width, half_height),
        corner(-half_width, -half_height),
    ]
}

fn finite(kind: &'static str, points: &[Point3]) -> Result<(), GeometryError> {
    if points.iter().all(|point| point.is_finite()) {
        Ok(())
    } else {
        Err(GeometryError::NonFinite { kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_maps_to_justification() {
        assert_eq!(
            attachment_justification(1),
            (HorizontalJustification::Left, VerticalJustification::Top)
        );
        assert_eq!(
            attachment_justification(5),
            (HorizontalJustification::Center, VerticalJustification::Middle)
        );
        assert_eq!(
            attachment_justification(9),
            (HorizontalJustification::Right, VerticalJustification::Bottom)
        );
    }

    #[test]
    fn layer_record_pseudo_values_become_defaults() {
        let mut record = LayerRecord::new("C-STORM");
        record.color = -1;
        record.line_type = Some("ByLayer".to_string());
        record.line_weight = Some(-1);
        record.flags = 0x05;
        let hints = layer_hints(&record);
        assert_eq!(hints.color, Color::RED);
        assert_eq!(hints.line_style, None);
        assert_eq!(hints.line_weight, LineWeight::Standard);
        assert!(hints.frozen && hints.locked);
    }

    #[test]
    fn viewport_rectangle_is_closed() {
        let ring = viewport_rectangle(Point3::planar(50.0, 40.0), 100.0, 60.0);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring[0], ring[4]);
        assert_eq!(ring[0], Point3::planar(0.0, 10.0));
        assert_eq!(ring[2], Point3::planar(100.0, 70.0));
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
