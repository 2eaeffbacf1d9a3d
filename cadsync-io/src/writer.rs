use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::TAU;
use std::io::Write;

use cadsync_core::geometry::Point3;
use cadsync_core::style::Color;
use tracing::debug;

use crate::IoError;
use crate::model::{
    BlockRecord, DimStyleRecord, DxfDocument, EntityCommon, EntityData, EntityRecord, HatchEdge,
    HatchLoop, LayerRecord, LineTypeRecord, PolylineVertex, TextStyleRecord,
};
use crate::version::{DxfVersion, Feature};

/// 写出结果：版本降级产生的警告。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub warnings: Vec<String>,
}

/// 单行 MTEXT 组码值的最大长度，超出部分拆分到组码 3。
const MTEXT_CHUNK: usize = 250;
/// 降级时椭圆、圆弧边的离散段数。
const DOWNGRADE_SEGMENTS: usize = 64;

/// ASCII 组码/值写出器。
struct GroupWriter<W: Write> {
    inner: W,
}

impl<W: Write> GroupWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }

    fn into_inner(self) -> W {
        self.inner
    }

    fn write_code(&mut self, code: i32) -> Result<(), IoError> {
        let result = if code < 10 {
            writeln!(self.inner, "  {code}")
        } else if code < 100 {
            writeln!(self.inner, " {code}")
        } else {
            writeln!(self.inner, "{code}")
        };
        result.map_err(|source| IoError::Write { source })
    }

    fn write_string(&mut self, code: i32, value: &str) -> Result<(), IoError> {
        self.write_code(code)?;
        writeln!(self.inner, "{value}").map_err(|source| IoError::Write { source })
    }

    fn write_i16(&mut self, code: i32, value: i16) -> Result<(), IoError> {
        self.write_string(code, &value.to_string())
    }

    fn write_i32(&mut self, code: i32, value: i32) -> Result<(), IoError> {
        self.write_string(code, &value.to_string())
    }

    fn write_double(&mut self, code: i32, value: f64) -> Result<(), IoError> {
        if !value.is_finite() {
            return Err(IoError::InvalidDocument(format!(
                "组码 {code} 的数值 {value} 不是有限数"
            )));
        }
        let text = if value == value.trunc() && value.abs() < 1e15 {
            format!("{value:.1}")
        } else {
            format!("{value}")
        };
        self.write_string(code, &text)
    }

    fn write_point(&mut self, code: i32, point: Point3) -> Result<(), IoError> {
        self.write_double(code, point.x())?;
        self.write_double(code + 10, point.y())?;
        self.write_double(code + 20, point.z())
    }

    fn write_point2(&mut self, code: i32, point: Point3) -> Result<(), IoError> {
        self.write_double(code, point.x())?;
        self.write_double(code + 10, point.y())
    }

    fn write_section_start(&mut self, name: &str) -> Result<(), IoError> {
        self.write_string(0, "SECTION")?;
        self.write_string(2, name)
    }

    fn write_section_end(&mut self) -> Result<(), IoError> {
        self.write_string(0, "ENDSEC")
    }
}

/// 句柄分配：优先沿用原句柄，重复或缺失时在最大已用句柄之上分配。
struct HandleAllocator {
    emitted: HashSet<u64>,
    next: u64,
}

impl HandleAllocator {
    fn new(document: &DxfDocument) -> Self {
        let mut max: u64 = 0;
        let mut observe = |handle: &Option<String>| {
            if let Some(value) = handle.as_deref().and_then(parse_handle) {
                max = max.max(value);
            }
        };
        document.line_types.iter().for_each(|r| observe(&r.handle));
        document.layers.iter().for_each(|r| observe(&r.handle));
        document.text_styles.iter().for_each(|r| observe(&r.handle));
        document.dim_styles.iter().for_each(|r| observe(&r.handle));
        for block in &document.blocks {
            observe(&block.handle);
            block.entities.iter().for_each(|e| observe_entity(e, &mut observe));
        }
        document
            .entities
            .iter()
            .for_each(|e| observe_entity(e, &mut observe));
        Self {
            emitted: HashSet::new(),
            next: max + 1,
        }
    }

    fn claim(&mut self, preserved: Option<&str>) -> String {
        if let Some(value) = preserved.and_then(parse_handle) {
            if self.emitted.insert(value) {
                return format!("{value:X}");
            }
        }
        self.fresh()
    }

    fn fresh(&mut self) -> String {
        loop {
            let value = self.next;
            self.next += 1;
            if self.emitted.insert(value) {
                return format!("{value:X}");
            }
        }
    }

    fn seed(&self) -> String {
        format!("{:X}", self.next)
    }
}

fn observe_entity(entity: &EntityRecord, observe: &mut impl FnMut(&Option<String>)) {
    observe(&entity.common.handle);
    if let EntityData::Insert { attributes, .. } = &entity.data {
        attributes.iter().for_each(|attribute| observe(&attribute.handle));
    }
}

fn parse_handle(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim(), 16)
        .ok()
        .filter(|value| *value != 0)
}

pub(crate) fn write_document(
    document: &DxfDocument,
    out: &mut dyn Write,
) -> Result<WriteReport, IoError> {
    let mut writer = DxfWriter::new(document);
    let mut body = GroupWriter::new(Vec::new());
    writer.write_tables(&mut body)?;
    writer.write_blocks(&mut body)?;
    writer.write_entities(&mut body)?;
    body.write_string(0, "EOF")?;

    let mut head = GroupWriter::new(&mut *out);
    writer.write_header(&mut head)?;
    out.write_all(&body.into_inner())
        .map_err(|source| IoError::Write { source })?;
    out.flush().map_err(|source| IoError::Write { source })?;

    let report = writer.report();
    debug!(
        version = %document.version,
        warnings = report.warnings.len(),
        "交换文件写出完成"
    );
    Ok(report)
}

struct DxfWriter<'a> {
    document: &'a DxfDocument,
    version: DxfVersion,
    handles: HandleAllocator,
    downgrades: BTreeMap<Feature, usize>,
    notes: Vec<String>,
    layer_handles: HashMap<String, String>,
    next_viewport_id: i16,
}

impl<'a> DxfWriter<'a> {
    fn new(document: &'a DxfDocument) -> Self {
        Self {
            document,
            version: document.version,
            handles: HandleAllocator::new(document),
            downgrades: BTreeMap::new(),
            notes: Vec::new(),
            layer_handles: HashMap::new(),
            next_viewport_id: 2,
        }
    }

    fn report(&self) -> WriteReport {
        let mut warnings: Vec<String> = self
            .downgrades
            .iter()
            .map(|(feature, count)| {
                format!(
                    "{} 不受目标版本 {} 支持，{count} 处{}",
                    feature.describe(),
                    self.version,
                    downgrade_action(*feature)
                )
            })
            .collect();
        warnings.extend(self.notes.iter().cloned());
        warnings
            .iter()
            .for_each(|warning| debug!(warning = %warning, "版本降级"));
        WriteReport { warnings }
    }

    fn downgrade(&mut self, feature: Feature) {
        *self.downgrades.entry(feature).or_insert(0) += 1;
    }

    #[inline]
    fn markers(&self) -> bool {
        self.version.writes_subclass_markers()
    }

    fn subclass<W: Write>(&self, out: &mut GroupWriter<W>, marker: &str) -> Result<(), IoError> {
        if self.markers() {
            out.write_string(100, marker)?;
        }
        Ok(())
    }

    fn write_header<W: Write>(&mut self, out: &mut GroupWriter<W>) -> Result<(), IoError> {
        out.write_section_start("HEADER")?;
        out.write_string(9, "$ACADVER")?;
        out.write_string(1, self.version.acad_code())?;
        out.write_string(9, "$HANDSEED")?;
        out.write_string(5, &self.handles.seed())?;
        if self.version == DxfVersion::R12 {
            out.write_string(9, "$HANDLING")?;
            out.write_i16(70, 1)?;
        }
        if let Some(units) = self.document.units {
            if self.version.supports(Feature::Units) {
                out.write_string(9, "$INSUNITS")?;
                out.write_i16(70, units)?;
            } else {
                self.downgrade(Feature::Units);
            }
        }
        out.write_section_end()
    }

    fn write_tables<W: Write>(&mut self, out: &mut GroupWriter<W>) -> Result<(), IoError> {
        out.write_section_start("TABLES")?;

        let line_types = self.collect_line_types();
        self.table_start(out, "LTYPE", line_types.len())?;
        for record in &line_types {
            self.write_line_type(out, record)?;
        }
        out.write_string(0, "ENDTAB")?;

        let layers = self.collect_layers();
        self.table_start(out, "LAYER", layers.len())?;
        for record in &layers {
            self.write_layer(out, record)?;
        }
        out.write_string(0, "ENDTAB")?;

        let styles = self.collect_text_styles();
        self.table_start(out, "STYLE", styles.len())?;
        for record in &styles {
            self.write_text_style(out, record)?;
        }
        out.write_string(0, "ENDTAB")?;

        self.table_start(out, "APPID", 1)?;
        out.write_string(0, "APPID")?;
        self.record_handle(out, 5, None)?;
        self.subclass(out, "AcDbSymbolTableRecord")?;
        self.subclass(out, "AcDbRegAppTableRecord")?;
        out.write_string(2, "ACAD")?;
        out.write_i16(70, 0)?;
        out.write_string(0, "ENDTAB")?;

        let dim_styles = self.collect_dim_styles();
        self.table_start(out, "DIMSTYLE", dim_styles.len())?;
        for record in &dim_styles {
            self.write_dim_style(out, record)?;
        }
        out.write_string(0, "ENDTAB")?;

        if self.markers() {
            let names = self.block_names();
            self.table_start(out, "BLOCK_RECORD", names.len())?;
            for name in &names {
                out.write_string(0, "BLOCK_RECORD")?;
                self.record_handle(out, 5, None)?;
                out.write_string(100, "AcDbSymbolTableRecord")?;
                out.write_string(100, "AcDbBlockTableRecord")?;
                out.write_string(2, name)?;
            }
            out.write_string(0, "ENDTAB")?;
        }

        out.write_section_end()
    }

    fn table_start<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        name: &str,
        count: usize,
    ) -> Result<(), IoError> {
        out.write_string(0, "TABLE")?;
        out.write_string(2, name)?;
        if self.markers() {
            let handle = self.handles.fresh();
            out.write_string(5, &handle)?;
            out.write_string(100, "AcDbSymbolTable")?;
        }
        out.write_i16(70, i16::try_from(count).unwrap_or(i16::MAX))
    }

    fn record_handle<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        code: i32,
        preserved: Option<&str>,
    ) -> Result<String, IoError> {
        let handle = self.handles.claim(preserved);
        out.write_string(code, &handle)?;
        Ok(handle)
    }

    /// 文档线型 + 必需的 ByBlock/ByLayer/Continuous + 被引用但未定义的线型。
    fn collect_line_types(&self) -> Vec<LineTypeRecord> {
        let mut records: Vec<LineTypeRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for name in ["ByBlock", "ByLayer", "Continuous"] {
            let existing = self
                .document
                .line_types
                .iter()
                .find(|record| record.name.eq_ignore_ascii_case(name));
            let record = existing.cloned().unwrap_or_else(|| LineTypeRecord {
                name: name.to_string(),
                description: if name == "Continuous" {
                    "Solid line".to_string()
                } else {
                    String::new()
                },
                ..LineTypeRecord::default()
            });
            seen.insert(record.name.to_ascii_uppercase());
            records.push(record);
        }
        for record in &self.document.line_types {
            if seen.insert(record.name.to_ascii_uppercase()) {
                records.push(record.clone());
            }
        }
        let referenced = self
            .document
            .layers
            .iter()
            .filter_map(|layer| layer.line_type.clone())
            .chain(self.all_entities().filter_map(|e| e.common.line_type.clone()));
        for name in referenced {
            if seen.insert(name.to_ascii_uppercase()) {
                records.push(LineTypeRecord {
                    name,
                    ..LineTypeRecord::default()
                });
            }
        }
        records
    }

    fn collect_layers(&self) -> Vec<LayerRecord> {
        let mut records: Vec<LayerRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        if !self.document.layers.iter().any(|layer| layer.name == "0") {
            records.push(LayerRecord::new("0"));
            seen.insert("0".to_string());
        }
        for layer in &self.document.layers {
            if seen.insert(layer.name.clone()) {
                records.push(layer.clone());
            }
        }
        let referenced: Vec<String> = self
            .all_entities()
            .map(|entity| entity.common.layer.clone())
            .collect();
        for name in referenced {
            if seen.insert(name.clone()) {
                records.push(LayerRecord::new(name));
            }
        }
        records
    }

    fn collect_text_styles(&self) -> Vec<TextStyleRecord> {
        let mut records = self.document.text_styles.clone();
        if !records
            .iter()
            .any(|style| style.name.eq_ignore_ascii_case("Standard"))
        {
            records.insert(
                0,
                TextStyleRecord {
                    handle: None,
                    name: "Standard".to_string(),
                    font: "txt".to_string(),
                    height: 0.0,
                    width_factor: 1.0,
                },
            );
        }
        records
    }

    fn collect_dim_styles(&self) -> Vec<DimStyleRecord> {
        let mut records = self.document.dim_styles.clone();
        if !records
            .iter()
            .any(|style| style.name.eq_ignore_ascii_case("Standard"))
        {
            records.insert(
                0,
                DimStyleRecord {
                    name: "Standard".to_string(),
                    ..DimStyleRecord::default()
                },
            );
        }
        records
    }

    fn block_names(&self) -> Vec<String> {
        let mut names = vec!["*Model_Space".to_string(), "*Paper_Space".to_string()];
        for block in &self.document.blocks {
            if !names.iter().any(|name| name.eq_ignore_ascii_case(&block.name)) {
                names.push(block.name.clone());
            }
        }
        names
    }

    fn all_entities(&self) -> impl Iterator<Item = &'a EntityRecord> + 'a {
        let document = self.document;
        document.entities.iter().chain(
            document
                .blocks
                .iter()
                .flat_map(|block| block.entities.iter()),
        )
    }

    fn write_line_type<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        record: &LineTypeRecord,
    ) -> Result<(), IoError> {
        out.write_string(0, "LTYPE")?;
        self.record_handle(out, 5, record.handle.as_deref())?;
        self.subclass(out, "AcDbSymbolTableRecord")?;
        self.subclass(out, "AcDbLinetypeTableRecord")?;
        out.write_string(2, &record.name)?;
        out.write_i16(70, 0)?;
        out.write_string(3, &record.description)?;
        out.write_i16(72, 65)?;
        out.write_i16(73, i16::try_from(record.pattern.len()).unwrap_or(0))?;
        let total: f64 = record.pattern.iter().map(|value| value.abs()).sum();
        out.write_double(40, total)?;
        for dash in &record.pattern {
            out.write_double(49, *dash)?;
            if self.markers() {
                out.write_i16(74, 0)?;
            }
        }
        Ok(())
    }

    fn write_layer<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        record: &LayerRecord,
    ) -> Result<(), IoError> {
        out.write_string(0, "LAYER")?;
        let handle = self.record_handle(out, 5, record.handle.as_deref())?;
        self.layer_handles.insert(record.name.clone(), handle);
        self.subclass(out, "AcDbSymbolTableRecord")?;
        self.subclass(out, "AcDbLayerTableRecord")?;
        out.write_string(2, &record.name)?;
        out.write_i16(70, record.flags)?;
        match record.true_color {
            Some(rgb) if self.version.supports(Feature::TrueColor) => {
                out.write_i16(62, record.color)?;
                out.write_i32(420, rgb as i32)?;
            }
            Some(rgb) => {
                self.downgrade(Feature::TrueColor);
                out.write_i16(62, Color::Rgb(rgb).aci())?;
            }
            None => out.write_i16(62, record.color)?,
        }
        out.write_string(6, record.line_type.as_deref().unwrap_or("Continuous"))?;
        if let Some(weight) = record.line_weight {
            if self.version.supports(Feature::LineWeight) {
                out.write_i16(370, weight)?;
            } else {
                self.downgrade(Feature::LineWeight);
            }
        }
        Ok(())
    }

    fn write_text_style<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        record: &TextStyleRecord,
    ) -> Result<(), IoError> {
        out.write_string(0, "STYLE")?;
        self.record_handle(out, 5, record.handle.as_deref())?;
        self.subclass(out, "AcDbSymbolTableRecord")?;
        self.subclass(out, "AcDbTextStyleTableRecord")?;
        out.write_string(2, &record.name)?;
        out.write_i16(70, 0)?;
        out.write_double(40, record.height)?;
        out.write_double(41, record.width_factor)?;
        out.write_double(50, 0.0)?;
        out.write_i16(71, 0)?;
        out.write_double(42, 2.5)?;
        out.write_string(3, &record.font)?;
        out.write_string(4, "")
    }

    fn write_dim_style<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        record: &DimStyleRecord,
    ) -> Result<(), IoError> {
        out.write_string(0, "DIMSTYLE")?;
        let code = if self.markers() { 105 } else { 5 };
        self.record_handle(out, code, record.handle.as_deref())?;
        self.subclass(out, "AcDbSymbolTableRecord")?;
        self.subclass(out, "AcDbDimStyleTableRecord")?;
        out.write_string(2, &record.name)?;
        out.write_i16(70, 0)?;
        if let Some(size) = record.arrow_size {
            out.write_double(41, size)?;
        }
        if let Some(height) = record.text_height {
            out.write_double(140, height)?;
        }
        Ok(())
    }

    fn write_blocks<W: Write>(&mut self, out: &mut GroupWriter<W>) -> Result<(), IoError> {
        out.write_section_start("BLOCKS")?;
        if self.markers() {
            for name in ["*Model_Space", "*Paper_Space"] {
                if self.document.block(name).is_none() {
                    let block = BlockRecord::new(name);
                    self.write_block(out, &block)?;
                }
            }
        }
        let document = self.document;
        for block in &document.blocks {
            self.write_block(out, block)?;
        }
        out.write_section_end()
    }

    fn write_block<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        block: &BlockRecord,
    ) -> Result<(), IoError> {
        out.write_string(0, "BLOCK")?;
        self.record_handle(out, 5, block.handle.as_deref())?;
        self.subclass(out, "AcDbEntity")?;
        if block.is_paper_space() {
            out.write_i16(67, 1)?;
        }
        out.write_string(8, "0")?;
        self.subclass(out, "AcDbBlockBegin")?;
        out.write_string(2, &block.name)?;
        let flags = if block.attribute_tags.is_empty() { 0 } else { 2 };
        out.write_i16(70, flags)?;
        out.write_point(10, block.base_point)?;
        out.write_string(3, &block.name)?;
        out.write_string(1, "")?;

        for tag in &block.attribute_tags {
            out.write_string(0, "ATTDEF")?;
            self.record_handle(out, 5, None)?;
            self.subclass(out, "AcDbEntity")?;
            out.write_string(8, "0")?;
            self.subclass(out, "AcDbText")?;
            out.write_point(10, block.base_point)?;
            out.write_double(40, 1.0)?;
            out.write_string(1, "")?;
            self.subclass(out, "AcDbAttributeDefinition")?;
            out.write_string(3, tag)?;
            out.write_string(2, tag)?;
            out.write_i16(70, 0)?;
        }

        for entity in &block.entities {
            self.write_entity(out, entity)?;
        }

        out.write_string(0, "ENDBLK")?;
        self.record_handle(out, 5, None)?;
        self.subclass(out, "AcDbEntity")?;
        out.write_string(8, "0")?;
        self.subclass(out, "AcDbBlockEnd")
    }

    fn write_entities<W: Write>(&mut self, out: &mut GroupWriter<W>) -> Result<(), IoError> {
        out.write_section_start("ENTITIES")?;
        let document = self.document;
        for entity in &document.entities {
            self.write_entity(out, entity)?;
        }
        out.write_section_end()
    }

    fn write_common<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        kind: &str,
        common: &EntityCommon,
        subclass: &str,
    ) -> Result<(), IoError> {
        out.write_string(0, kind)?;
        self.record_handle(out, 5, common.handle.as_deref())?;
        self.subclass(out, "AcDbEntity")?;
        if common.paper_space {
            out.write_i16(67, 1)?;
        }
        out.write_string(8, &common.layer)?;
        if let Some(line_type) = &common.line_type {
            out.write_string(6, line_type)?;
        }
        match common.true_color {
            Some(rgb) if self.version.supports(Feature::TrueColor) => {
                if let Some(color) = common.color {
                    out.write_i16(62, color)?;
                }
                out.write_i32(420, rgb as i32)?;
            }
            Some(rgb) => {
                self.downgrade(Feature::TrueColor);
                out.write_i16(62, Color::Rgb(rgb).aci())?;
            }
            None => {
                if let Some(color) = common.color {
                    out.write_i16(62, color)?;
                }
            }
        }
        if let Some(weight) = common.line_weight {
            if self.version.supports(Feature::LineWeight) {
                out.write_i16(370, weight)?;
            } else {
                self.downgrade(Feature::LineWeight);
            }
        }
        if let Some(transparency) = common.transparency {
            if self.version.supports(Feature::Transparency) {
                out.write_i32(440, transparency)?;
            } else {
                self.downgrade(Feature::Transparency);
            }
        }
        self.subclass(out, subclass)
    }

    fn write_entity<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        entity: &EntityRecord,
    ) -> Result<(), IoError> {
        let common = &entity.common;
        match &entity.data {
            EntityData::Line { start, end } => {
                self.write_common(out, "LINE", common, "AcDbLine")?;
                out.write_point(10, *start)?;
                out.write_point(11, *end)?;
            }
            EntityData::Point { location } => {
                self.write_common(out, "POINT", common, "AcDbPoint")?;
                out.write_point(10, *location)?;
            }
            EntityData::Circle { center, radius } => {
                self.write_common(out, "CIRCLE", common, "AcDbCircle")?;
                out.write_point(10, *center)?;
                out.write_double(40, *radius)?;
            }
            EntityData::Arc {
                center,
                radius,
                start_angle,
                end_angle,
            } => {
                self.write_common(out, "ARC", common, "AcDbCircle")?;
                out.write_point(10, *center)?;
                out.write_double(40, *radius)?;
                self.subclass(out, "AcDbArc")?;
                out.write_double(50, *start_angle)?;
                out.write_double(51, *end_angle)?;
            }
            EntityData::Ellipse {
                center,
                major_axis,
                ratio,
                start_parameter,
                end_parameter,
            } => {
                if self.version.supports(Feature::Ellipse) {
                    self.write_common(out, "ELLIPSE", common, "AcDbEllipse")?;
                    out.write_point(10, *center)?;
                    let axis = major_axis.as_vec3();
                    out.write_point(11, Point3::new(axis.x, axis.y, axis.z))?;
                    out.write_double(40, *ratio)?;
                    out.write_double(41, *start_parameter)?;
                    out.write_double(42, *end_parameter)?;
                } else {
                    self.downgrade(Feature::Ellipse);
                    let axis = major_axis.as_vec3();
                    let points = sample_ellipse(
                        *center,
                        (axis.x, axis.y),
                        *ratio,
                        *start_parameter,
                        *end_parameter,
                    );
                    let closed = (end_parameter - start_parameter).abs() >= TAU - 1e-9;
                    let vertices: Vec<PolylineVertex> =
                        points.into_iter().map(PolylineVertex::new).collect();
                    self.write_legacy_polyline(out, common, &vertices, closed, false)?;
                }
            }
            EntityData::LwPolyline { vertices, closed } => {
                if self.version.supports(Feature::LwPolyline) {
                    self.write_common(out, "LWPOLYLINE", common, "AcDbPolyline")?;
                    out.write_i32(90, i32::try_from(vertices.len()).unwrap_or(i32::MAX))?;
                    out.write_i16(70, if *closed { 1 } else { 0 })?;
                    let elevation = vertices.first().map(|v| v.position.z()).unwrap_or(0.0);
                    if elevation != 0.0 {
                        out.write_double(38, elevation)?;
                    }
                    for vertex in vertices {
                        out.write_point2(10, vertex.position)?;
                        if vertex.bulge != 0.0 {
                            out.write_double(42, vertex.bulge)?;
                        }
                    }
                } else {
                    self.write_legacy_polyline(out, common, vertices, *closed, false)?;
                }
            }
            EntityData::Polyline {
                vertices,
                closed,
                is_3d,
            } => {
                self.write_legacy_polyline(out, common, vertices, *closed, *is_3d)?;
            }
            EntityData::Spline {
                degree,
                closed,
                knots,
                weights,
                control_points,
                fit_points,
            } => {
                if self.version.supports(Feature::Spline) {
                    self.write_common(out, "SPLINE", common, "AcDbSpline")?;
                    let rational = weights.iter().any(|w| (*w - 1.0).abs() > f64::EPSILON);
                    let mut flags: i16 = 8;
                    if *closed {
                        flags |= 1;
                    }
                    if rational {
                        flags |= 4;
                    }
                    out.write_i16(70, flags)?;
                    out.write_i16(71, i16::try_from(*degree).unwrap_or(3))?;
                    out.write_i16(72, i16::try_from(knots.len()).unwrap_or(0))?;
                    out.write_i16(73, i16::try_from(control_points.len()).unwrap_or(0))?;
                    out.write_i16(74, i16::try_from(fit_points.len()).unwrap_or(0))?;
                    for knot in knots {
                        out.write_double(40, *knot)?;
                    }
                    if rational {
                        for weight in weights {
                            out.write_double(41, *weight)?;
                        }
                    }
                    for point in control_points {
                        out.write_point(10, *point)?;
                    }
                    for point in fit_points {
                        out.write_point(11, *point)?;
                    }
                } else {
                    self.downgrade(Feature::Spline);
                    let source = if fit_points.is_empty() {
                        control_points
                    } else {
                        fit_points
                    };
                    if source.len() < 2 {
                        return Err(IoError::UnsupportedFeature(format!(
                            "SPLINE 无法在 {} 中以多段线表示（点数不足）",
                            self.version
                        )));
                    }
                    let vertices: Vec<PolylineVertex> =
                        source.iter().copied().map(PolylineVertex::new).collect();
                    self.write_legacy_polyline(out, common, &vertices, *closed, true)?;
                }
            }
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
                self.write_text(
                    out,
                    common,
                    TextFields {
                        insert: *insert,
                        alignment_point: *alignment_point,
                        height: *height,
                        content: &content.replace('\n', " "),
                        rotation: *rotation,
                        style: style.as_deref(),
                        horizontal: *horizontal,
                        vertical: *vertical,
                    },
                )?;
            }
            EntityData::MText {
                insert,
                height,
                content,
                rotation,
                style,
                attachment,
                reference_width,
            } => {
                if self.version.supports(Feature::MText) {
                    self.write_common(out, "MTEXT", common, "AcDbMText")?;
                    out.write_point(10, *insert)?;
                    out.write_double(40, *height)?;
                    if let Some(width) = reference_width {
                        out.write_double(41, *width)?;
                    }
                    out.write_i16(71, *attachment)?;
                    out.write_i16(72, 1)?;
                    let encoded = encode_mtext_content(content);
                    let chunks = split_chunks(&encoded, MTEXT_CHUNK);
                    let count = chunks.len();
                    for (index, chunk) in chunks.iter().enumerate() {
                        out.write_string(if index + 1 == count { 1 } else { 3 }, chunk)?;
                    }
                    if let Some(style) = style {
                        out.write_string(7, style)?;
                    }
                    out.write_double(50, *rotation)?;
                } else {
                    self.downgrade(Feature::MText);
                    let (horizontal, vertical) = attachment_to_justification(*attachment);
                    self.write_text(
                        out,
                        common,
                        TextFields {
                            insert: *insert,
                            alignment_point: None,
                            height: *height,
                            content: content.lines().next().unwrap_or(""),
                            rotation: *rotation,
                            style: style.as_deref(),
                            horizontal,
                            vertical,
                        },
                    )?;
                }
            }
            EntityData::Dimension {
                block_name,
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
            } => {
                self.write_common(out, "DIMENSION", common, "AcDbDimension")?;
                if let Some(block) = block_name {
                    out.write_string(2, block)?;
                }
                out.write_point(10, *definition_point)?;
                out.write_point(11, *text_midpoint)?;
                out.write_i16(70, *flags)?;
                if let Some(text) = text {
                    out.write_string(1, text)?;
                }
                if let Some(value) = measurement {
                    out.write_double(42, *value)?;
                }
                if let Some(style) = style {
                    out.write_string(3, style)?;
                }
                let kind = flags & 0x0F;
                let marker = match kind {
                    0 | 1 => "AcDbAlignedDimension",
                    2 => "AcDb2LineAngularDimension",
                    3 => "AcDbDiametricDimension",
                    4 => "AcDbRadialDimension",
                    5 => "AcDb3PointAngularDimension",
                    _ => "AcDbOrdinateDimension",
                };
                self.subclass(out, marker)?;
                for (code, point) in [
                    (13, first_point),
                    (14, second_point),
                    (15, arc_point),
                    (16, arc_location),
                ] {
                    if let Some(point) = point {
                        out.write_point(code, *point)?;
                    }
                }
                if kind == 0 {
                    out.write_double(50, *rotation)?;
                    self.subclass(out, "AcDbRotatedDimension")?;
                }
            }
            EntityData::Hatch {
                pattern_name,
                solid,
                scale,
                angle,
                elevation,
                loops,
            } => {
                if self.version.supports(Feature::Hatch) {
                    self.write_hatch(
                        out,
                        common,
                        pattern_name,
                        *solid,
                        *scale,
                        *angle,
                        *elevation,
                        loops,
                    )?;
                } else {
                    self.downgrade(Feature::Hatch);
                    let rings: Vec<Vec<PolylineVertex>> = loops
                        .iter()
                        .map(flatten_loop)
                        .filter(|ring| ring.len() >= 2)
                        .collect();
                    if rings.is_empty() {
                        return Err(IoError::UnsupportedFeature(format!(
                            "HATCH 在 {} 中没有可写出的边界",
                            self.version
                        )));
                    }
                    for (index, ring) in rings.iter().enumerate() {
                        let mut ring_common = common.clone();
                        if index > 0 {
                            ring_common.handle = None;
                        }
                        self.write_legacy_polyline(out, &ring_common, ring, true, false)?;
                    }
                }
            }
            EntityData::Insert {
                name,
                insert,
                scale,
                rotation,
                attributes,
            } => {
                self.write_common(out, "INSERT", common, "AcDbBlockReference")?;
                if !attributes.is_empty() {
                    out.write_i16(66, 1)?;
                }
                out.write_string(2, name)?;
                out.write_point(10, *insert)?;
                out.write_double(41, scale[0])?;
                out.write_double(42, scale[1])?;
                out.write_double(43, scale[2])?;
                out.write_double(50, *rotation)?;
                if !attributes.is_empty() {
                    for attribute in attributes {
                        out.write_string(0, "ATTRIB")?;
                        self.record_handle(out, 5, attribute.handle.as_deref())?;
                        self.subclass(out, "AcDbEntity")?;
                        if common.paper_space {
                            out.write_i16(67, 1)?;
                        }
                        out.write_string(8, &common.layer)?;
                        self.subclass(out, "AcDbText")?;
                        out.write_point(10, *insert)?;
                        out.write_double(40, 1.0)?;
                        out.write_string(1, &attribute.value)?;
                        self.subclass(out, "AcDbAttribute")?;
                        out.write_string(2, &attribute.tag)?;
                        out.write_i16(70, 0)?;
                    }
                    self.write_seqend(out, common)?;
                }
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
                let mut viewport_common = common.clone();
                viewport_common.paper_space = true;
                self.write_common(out, "VIEWPORT", &viewport_common, "AcDbViewport")?;
                out.write_point(10, *center)?;
                out.write_double(40, *width)?;
                out.write_double(41, *height)?;
                out.write_i16(68, 1)?;
                let viewport_id = match id {
                    Some(id) => *id,
                    None => {
                        let next = self.next_viewport_id;
                        self.next_viewport_id = next.saturating_add(1);
                        next
                    }
                };
                out.write_i16(69, viewport_id)?;
                if self.markers() {
                    out.write_point2(12, *view_center)?;
                    out.write_double(45, *view_height)?;
                    out.write_double(51, *twist)?;
                }
                if !frozen_layers.is_empty() {
                    if self.version.supports(Feature::ViewportFrozenLayers) {
                        for name in frozen_layers {
                            match self.layer_handles.get(name).cloned() {
                                Some(handle) => out.write_string(331, &handle)?,
                                None => self.notes.push(format!(
                                    "视口冻结图层 {name} 不在图层表中，已忽略"
                                )),
                            }
                        }
                    } else {
                        self.downgrade(Feature::ViewportFrozenLayers);
                    }
                }
                if !self.markers() {
                    write_legacy_view(out, *view_center, *view_height, *twist)?;
                }
            }
        }
        Ok(())
    }

    fn write_text<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        common: &EntityCommon,
        fields: TextFields<'_>,
    ) -> Result<(), IoError> {
        self.write_common(out, "TEXT", common, "AcDbText")?;
        out.write_point(10, fields.insert)?;
        out.write_double(40, fields.height)?;
        out.write_string(1, fields.content)?;
        if fields.rotation != 0.0 {
            out.write_double(50, fields.rotation)?;
        }
        if let Some(style) = fields.style {
            out.write_string(7, style)?;
        }
        if fields.horizontal != 0 {
            out.write_i16(72, fields.horizontal)?;
        }
        if fields.horizontal != 0 || fields.vertical != 0 {
            out.write_point(11, fields.alignment_point.unwrap_or(fields.insert))?;
        }
        self.subclass(out, "AcDbText")?;
        if fields.vertical != 0 {
            out.write_i16(73, fields.vertical)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_hatch<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        common: &EntityCommon,
        pattern_name: &str,
        solid: bool,
        scale: f64,
        angle: f64,
        elevation: f64,
        loops: &[HatchLoop],
    ) -> Result<(), IoError> {
        self.write_common(out, "HATCH", common, "AcDbHatch")?;
        out.write_point(10, Point3::new(0.0, 0.0, elevation))?;
        out.write_point(210, Point3::new(0.0, 0.0, 1.0))?;
        out.write_string(2, if solid { "SOLID" } else { pattern_name })?;
        out.write_i16(70, if solid { 1 } else { 0 })?;
        out.write_i16(71, 0)?;
        out.write_i32(91, i32::try_from(loops.len()).unwrap_or(0))?;
        for hatch_loop in loops {
            let polyline = match hatch_loop.edges.as_slice() {
                [HatchEdge::Polyline { vertices, closed }] => Some((vertices, *closed)),
                _ => None,
            };
            match polyline {
                Some((vertices, closed)) => {
                    out.write_i32(92, hatch_loop.flags | 0x02)?;
                    let has_bulge = vertices.iter().any(|v| v.bulge != 0.0);
                    out.write_i16(72, if has_bulge { 1 } else { 0 })?;
                    out.write_i16(73, if closed { 1 } else { 0 })?;
                    out.write_i32(93, i32::try_from(vertices.len()).unwrap_or(0))?;
                    for vertex in vertices {
                        out.write_point2(10, vertex.position)?;
                        if has_bulge {
                            out.write_double(42, vertex.bulge)?;
                        }
                    }
                }
                None => {
                    out.write_i32(92, hatch_loop.flags & !0x02)?;
                    out.write_i32(93, i32::try_from(hatch_loop.edges.len()).unwrap_or(0))?;
                    for edge in &hatch_loop.edges {
                        write_hatch_edge(out, edge)?;
                    }
                }
            }
            out.write_i32(97, 0)?;
        }
        out.write_i16(75, 0)?;
        out.write_i16(76, 1)?;
        if !solid {
            out.write_double(52, angle)?;
            out.write_double(41, scale)?;
            out.write_i16(77, 0)?;
            out.write_i16(78, 0)?;
        }
        out.write_i32(98, 0)
    }

    fn write_legacy_polyline<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        common: &EntityCommon,
        vertices: &[PolylineVertex],
        closed: bool,
        is_3d: bool,
    ) -> Result<(), IoError> {
        let subclass = if is_3d {
            "AcDb3dPolyline"
        } else {
            "AcDb2dPolyline"
        };
        self.write_common(out, "POLYLINE", common, subclass)?;
        out.write_i16(66, 1)?;
        let elevation = if is_3d {
            0.0
        } else {
            vertices.first().map(|v| v.position.z()).unwrap_or(0.0)
        };
        out.write_point(10, Point3::new(0.0, 0.0, elevation))?;
        let mut flags: i16 = if closed { 1 } else { 0 };
        if is_3d {
            flags |= 8;
        }
        out.write_i16(70, flags)?;
        for vertex in vertices {
            out.write_string(0, "VERTEX")?;
            self.record_handle(out, 5, None)?;
            self.subclass(out, "AcDbEntity")?;
            if common.paper_space {
                out.write_i16(67, 1)?;
            }
            out.write_string(8, &common.layer)?;
            self.subclass(out, "AcDbVertex")?;
            self.subclass(
                out,
                if is_3d {
                    "AcDb3dPolylineVertex"
                } else {
                    "AcDb2dVertex"
                },
            )?;
            out.write_point(10, vertex.position)?;
            if vertex.bulge != 0.0 {
                out.write_double(42, vertex.bulge)?;
            }
            out.write_i16(70, if is_3d { 32 } else { 0 })?;
        }
        self.write_seqend(out, common)
    }

    fn write_seqend<W: Write>(
        &mut self,
        out: &mut GroupWriter<W>,
        common: &EntityCommon,
    ) -> Result<(), IoError> {
        out.write_string(0, "SEQEND")?;
        self.record_handle(out, 5, None)?;
        self.subclass(out, "AcDbEntity")?;
        if common.paper_space {
            out.write_i16(67, 1)?;
        }
        out.write_string(8, &common.layer)
    }
}

struct TextFields<'t> {
    insert: Point3,
    alignment_point: Option<Point3>,
    height: f64,
    content: &'t str,
    rotation: f64,
    style: Option<&'t str>,
    horizontal: i16,
    vertical: i16,
}

fn downgrade_action(feature: Feature) -> &'static str {
    match feature {
        Feature::LwPolyline | Feature::Ellipse | Feature::Spline => "已转换为 POLYLINE",
        Feature::MText => "已转换为单行 TEXT",
        Feature::Hatch => "仅保留边界多段线",
        Feature::TrueColor => "已转换为最接近的 ACI 颜色",
        Feature::LineWeight
        | Feature::Transparency
        | Feature::ViewportFrozenLayers
        | Feature::Units => "已忽略",
    }
}

/// MTEXT 附着点（1-9）换算为 TEXT 的水平/垂直对齐。
fn attachment_to_justification(attachment: i16) -> (i16, i16) {
    let index = attachment.clamp(1, 9) - 1;
    let horizontal = index % 3;
    let vertical = 3 - index / 3;
    (horizontal, vertical)
}

fn write_hatch_edge<W: Write>(out: &mut GroupWriter<W>, edge: &HatchEdge) -> Result<(), IoError> {
    match edge {
        HatchEdge::Line { start, end } => {
            out.write_i16(72, 1)?;
            out.write_point2(10, *start)?;
            out.write_point2(11, *end)?;
        }
        HatchEdge::Arc {
            center,
            radius,
            start_angle,
            end_angle,
            counter_clockwise,
        } => {
            out.write_i16(72, 2)?;
            out.write_point2(10, *center)?;
            out.write_double(40, *radius)?;
            out.write_double(50, *start_angle)?;
            out.write_double(51, *end_angle)?;
            out.write_i16(73, if *counter_clockwise { 1 } else { 0 })?;
        }
        HatchEdge::Ellipse {
            center,
            major_axis,
            ratio,
            start_angle,
            end_angle,
            counter_clockwise,
        } => {
            out.write_i16(72, 3)?;
            out.write_point2(10, *center)?;
            let axis = major_axis.as_vec3();
            out.write_point2(11, Point3::new(axis.x, axis.y, 0.0))?;
            out.write_double(40, *ratio)?;
            out.write_double(50, *start_angle)?;
            out.write_double(51, *end_angle)?;
            out.write_i16(73, if *counter_clockwise { 1 } else { 0 })?;
        }
        HatchEdge::Spline {
            degree,
            knots,
            control_points,
            weights,
        } => {
            out.write_i16(72, 4)?;
            out.write_i32(94, *degree)?;
            out.write_i16(73, if weights.is_empty() { 0 } else { 1 })?;
            out.write_i16(74, 0)?;
            out.write_i32(95, i32::try_from(knots.len()).unwrap_or(0))?;
            out.write_i32(96, i32::try_from(control_points.len()).unwrap_or(0))?;
            for knot in knots {
                out.write_double(40, *knot)?;
            }
            for (index, point) in control_points.iter().enumerate() {
                out.write_point2(10, *point)?;
                if let Some(weight) = weights.get(index) {
                    out.write_double(42, *weight)?;
                }
            }
        }
        HatchEdge::Polyline { vertices, .. } => {
            // 混合边界中的多段线按直线边写出
            for pair in vertices.windows(2) {
                out.write_i16(72, 1)?;
                out.write_point2(10, pair[0].position)?;
                out.write_point2(11, pair[1].position)?;
            }
        }
    }
    Ok(())
}

/// R12 视口的视图参数保存在 ACAD/MVIEW 扩展数据中。
fn write_legacy_view<W: Write>(
    out: &mut GroupWriter<W>,
    view_center: Point3,
    view_height: f64,
    twist: f64,
) -> Result<(), IoError> {
    out.write_string(1001, "ACAD")?;
    out.write_string(1000, "MVIEW")?;
    out.write_string(1002, "{")?;
    out.write_i16(1070, 16)?;
    for (x, y, z) in [(0.0, 0.0, 0.0), (0.0, 0.0, 1.0)] {
        out.write_double(1010, x)?;
        out.write_double(1020, y)?;
        out.write_double(1030, z)?;
    }
    for value in [
        twist,
        view_height,
        view_center.x(),
        view_center.y(),
        50.0,
        0.0,
        0.0,
    ] {
        out.write_double(1040, value)?;
    }
    out.write_string(1002, "{")?;
    out.write_string(1002, "}")?;
    out.write_string(1002, "}")
}

fn sample_ellipse(
    center: Point3,
    axis: (f64, f64),
    ratio: f64,
    start: f64,
    end: f64,
) -> Vec<Point3> {
    let mut sweep = end - start;
    if sweep <= 0.0 {
        sweep += TAU;
    }
    let (ax, ay) = axis;
    let (bx, by) = (-ay * ratio, ax * ratio);
    (0..=DOWNGRADE_SEGMENTS)
        .map(|step| {
            let t = start + sweep * step as f64 / DOWNGRADE_SEGMENTS as f64;
            let (sin, cos) = t.sin_cos();
            Point3::new(
                center.x() + ax * cos + bx * sin,
                center.y() + ay * cos + by * sin,
                center.z(),
            )
        })
        .collect()
}

fn flatten_loop(hatch_loop: &HatchLoop) -> Vec<PolylineVertex> {
    let mut vertices: Vec<PolylineVertex> = Vec::new();
    for edge in &hatch_loop.edges {
        match edge {
            HatchEdge::Polyline { vertices: own, .. } => vertices.extend(own.iter().copied()),
            HatchEdge::Line { start, end } => {
                vertices.push(PolylineVertex::new(*start));
                vertices.push(PolylineVertex::new(*end));
            }
            HatchEdge::Arc {
                center,
                radius,
                start_angle,
                end_angle,
                counter_clockwise,
            } => {
                let axis = (*radius, 0.0);
                let points = sample_ellipse(
                    *center,
                    axis,
                    1.0,
                    start_angle.to_radians(),
                    end_angle.to_radians(),
                );
                push_oriented(&mut vertices, points, *center, *counter_clockwise);
            }
            HatchEdge::Ellipse {
                center,
                major_axis,
                ratio,
                start_angle,
                end_angle,
                counter_clockwise,
            } => {
                let axis = major_axis.as_vec3();
                let points = sample_ellipse(
                    *center,
                    (axis.x, axis.y),
                    *ratio,
                    start_angle.to_radians(),
                    end_angle.to_radians(),
                );
                push_oriented(&mut vertices, points, *center, *counter_clockwise);
            }
            HatchEdge::Spline { control_points, .. } => {
                vertices.extend(control_points.iter().copied().map(PolylineVertex::new));
            }
        }
    }
    vertices.dedup_by(|a, b| a.position.approx_eq(b.position, 1e-12));
    vertices
}

/// 顺时针边的角度以镜像方式存储，取点时关于中心的水平轴翻转。
fn push_oriented(
    vertices: &mut Vec<PolylineVertex>,
    points: Vec<Point3>,
    center: Point3,
    counter_clockwise: bool,
) {
    for point in points {
        let point = if counter_clockwise {
            point
        } else {
            Point3::new(point.x(), 2.0 * center.y() - point.y(), point.z())
        };
        vertices.push(PolylineVertex::new(point));
    }
}

fn encode_mtext_content(content: &str) -> String {
    content.replace('\\', "\\\\").replace('\n', "\\P")
}

fn split_chunks(text: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > size {
        let mut cut = size;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // 不在转义序列中间断开
        if rest[..cut].ends_with('\\') && cut > 1 {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_keep_one_decimal() {
        let mut out = GroupWriter::new(Vec::new());
        out.write_double(40, 2.0).expect("写出");
        out.write_double(41, 0.125).expect("写出");
        let text = String::from_utf8(out.into_inner()).expect("utf8");
        assert_eq!(text, " 40\n2.0\n 41\n0.125\n");
    }

    #[test]
    fn rejects_non_finite_values() {
        let mut out = GroupWriter::new(Vec::new());
        assert!(out.write_double(10, f64::NAN).is_err());
    }

    #[test]
    fn duplicate_handles_are_reassigned() {
        let mut document = DxfDocument::new(DxfVersion::R2018);
        document.layers.push(LayerRecord {
            handle: Some("1F".to_string()),
            ..LayerRecord::new("A")
        });
        let mut allocator = HandleAllocator::new(&document);
        assert_eq!(allocator.claim(Some("1F")), "1F");
        assert_eq!(allocator.claim(Some("1F")), "20");
        assert_eq!(allocator.claim(None), "21");
        assert_eq!(allocator.seed(), "22");
    }

    #[test]
    fn long_mtext_is_split_on_char_boundaries() {
        let text = "测".repeat(100);
        let chunks = split_chunks(&text, MTEXT_CHUNK);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn attachment_maps_to_text_alignment() {
        assert_eq!(attachment_to_justification(1), (0, 3));
        assert_eq!(attachment_to_justification(5), (1, 2));
        assert_eq!(attachment_to_justification(9), (2, 1));
    }
}
