use std::collections::HashMap;
use std::convert::TryFrom;

use cadsync_core::geometry::{Point3, Vector3};
use tracing::debug;

use crate::model::{
    AttributeRecord, BlockRecord, DimStyleRecord, DxfDocument, EntityCommon, EntityData,
    EntityRecord, HatchEdge, HatchLoop, LayerRecord, LineTypeRecord, PolylineVertex,
    SkippedEntity, TextStyleRecord,
};
use crate::version::DxfVersion;

#[derive(Debug)]
pub(crate) enum DxfError {
    Unsupported { feature: String },
    Invalid { message: String },
}

impl DxfError {
    fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// 单个实体的解析结果：成功，或因类型暂不支持而整体跳过。
enum Parsed {
    Entity(EntityRecord),
    Skipped(SkippedEntity),
}

pub(crate) struct DxfParser<'a> {
    reader: DxfReader<'a>,
}

impl<'a> DxfParser<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
        }
    }

    pub(crate) fn parse(mut self) -> Result<DxfDocument, DxfError> {
        let mut document = DxfDocument::default();
        let mut saw_section = false;
        let mut reached_eof = false;
        while let Some((code, value)) = self.reader.next_pair()? {
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "意外的组码 {code}（期望 0 表示 SECTION/EOF）"
                )));
            }
            match value.trim() {
                "SECTION" => {
                    let (name_code, name) = self
                        .reader
                        .next_pair()?
                        .ok_or_else(|| DxfError::invalid("SECTION 缺少名称（组码 2）"))?;
                    if name_code != 2 {
                        return Err(DxfError::invalid(format!(
                            "SECTION 名称使用了组码 {name_code}（期望 2）"
                        )));
                    }
                    saw_section = true;
                    match name.trim() {
                        "HEADER" => self.parse_header(&mut document)?,
                        "TABLES" => self.parse_tables(&mut document)?,
                        "BLOCKS" => self.parse_blocks(&mut document)?,
                        "ENTITIES" => self.parse_entities(&mut document)?,
                        other => {
                            debug!(section = other, "跳过 SECTION");
                            self.skip_section()?
                        }
                    }
                }
                "EOF" => {
                    reached_eof = true;
                    break;
                }
                unexpected => {
                    return Err(DxfError::invalid(format!(
                        "意外的标记 {unexpected}，期望 SECTION 或 EOF"
                    )));
                }
            }
        }
        if !saw_section {
            return Err(DxfError::invalid("文件不包含任何 SECTION"));
        }
        if !reached_eof {
            return Err(DxfError::invalid("文件缺少 EOF 结束标记，可能已被截断"));
        }
        resolve_viewport_layers(&mut document);
        Ok(document)
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    return Err(DxfError::invalid("SECTION 未找到 ENDSEC 终止标记"));
                }
            }
        }
        Ok(())
    }

    fn parse_header(&mut self, document: &mut DxfDocument) -> Result<(), DxfError> {
        let mut variable: Option<String> = None;
        loop {
            let (code, value) = self
                .reader
                .next_pair()?
                .ok_or_else(|| DxfError::invalid("HEADER 段提前结束"))?;
            match code {
                0 if value.trim() == "ENDSEC" => break,
                0 => {
                    return Err(DxfError::invalid(format!(
                        "HEADER 段遇到意外的标记 {}",
                        value.trim()
                    )));
                }
                9 => variable = Some(value.trim().to_string()),
                _ => match variable.as_deref() {
                    Some("$ACADVER") if code == 1 => {
                        document.version =
                            DxfVersion::from_acad_code(&value).ok_or_else(|| {
                                DxfError::unsupported(format!(
                                    "不支持的格式版本 {}",
                                    value.trim()
                                ))
                            })?;
                    }
                    Some("$INSUNITS") if code == 70 => {
                        document.units = Some(parse_i16(&value, "$INSUNITS")?);
                    }
                    _ => {}
                },
            }
        }
        Ok(())
    }

    fn parse_tables(&mut self, document: &mut DxfDocument) -> Result<(), DxfError> {
        loop {
            let (code, value) = self
                .reader
                .next_pair()?
                .ok_or_else(|| DxfError::invalid("TABLES 段提前结束"))?;
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "TABLES 段遇到组码 {code}（期望 0 表示 TABLE 起始）"
                )));
            }
            match value.trim() {
                "ENDSEC" => break,
                "TABLE" => self.parse_table(document)?,
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    fn parse_table(&mut self, document: &mut DxfDocument) -> Result<(), DxfError> {
        loop {
            let (code, value) = self
                .reader
                .next_pair()?
                .ok_or_else(|| DxfError::invalid("TABLE 未找到 ENDTAB 终止标记"))?;
            if code != 0 {
                // 表头字段（名称、句柄、数量）
                continue;
            }
            match value.trim() {
                "ENDTAB" => {
                    self.skip_entity_body()?;
                    break;
                }
                "ENDSEC" => return Err(DxfError::invalid("TABLE 未找到 ENDTAB 终止标记")),
                "LTYPE" => {
                    let record = self.parse_line_type()?;
                    if !record.name.is_empty() {
                        document.line_types.push(record);
                    }
                }
                "LAYER" => {
                    let record = self.parse_layer()?;
                    if !record.name.is_empty() {
                        document.layers.push(record);
                    }
                }
                "STYLE" => {
                    if let Some(record) = self.parse_text_style()? {
                        document.text_styles.push(record);
                    }
                }
                "DIMSTYLE" => {
                    let record = self.parse_dim_style()?;
                    if !record.name.is_empty() {
                        document.dim_styles.push(record);
                    }
                }
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    fn parse_line_type(&mut self) -> Result<LineTypeRecord, DxfError> {
        let mut record = LineTypeRecord::default();
        while let Some((code, value)) = self.next_body_pair("LTYPE 表项")? {
            match code {
                5 => record.handle = non_empty(&value),
                2 => record.name = value.trim().to_string(),
                3 => record.description = value.trim().to_string(),
                49 => record
                    .pattern
                    .push(parse_f64(&value, "LTYPE 线型单元长度（组码 49）")?),
                _ => {}
            }
        }
        Ok(record)
    }

    fn parse_layer(&mut self) -> Result<LayerRecord, DxfError> {
        let mut record = LayerRecord::new("");
        while let Some((code, value)) = self.next_body_pair("LAYER 表项")? {
            match code {
                5 => record.handle = non_empty(&value),
                2 => record.name = value.trim().to_string(),
                62 => record.color = parse_i16(&value, "LAYER 颜色（组码 62）")?,
                420 => {
                    record.true_color = Some(parse_true_color(&value, "LAYER 真彩色（组码 420）")?)
                }
                6 => record.line_type = non_empty(&value),
                370 => record.line_weight = Some(parse_i16(&value, "LAYER 线宽（组码 370）")?),
                70 => record.flags = parse_i16(&value, "LAYER 标志（组码 70）")?,
                _ => {}
            }
        }
        Ok(record)
    }

    fn parse_text_style(&mut self) -> Result<Option<TextStyleRecord>, DxfError> {
        let mut record = TextStyleRecord {
            handle: None,
            name: String::new(),
            font: String::new(),
            height: 0.0,
            width_factor: 1.0,
        };
        let mut flags = 0;
        while let Some((code, value)) = self.next_body_pair("STYLE 表项")? {
            match code {
                5 => record.handle = non_empty(&value),
                2 => record.name = value.trim().to_string(),
                3 => record.font = value.trim().to_string(),
                40 => record.height = parse_f64(&value, "STYLE 固定字高（组码 40）")?,
                41 => record.width_factor = parse_f64(&value, "STYLE 宽度因子（组码 41）")?,
                70 => flags = parse_i16(&value, "STYLE 标志（组码 70）")?,
                _ => {}
            }
        }
        // 形文件条目没有名称，不是文字样式
        if record.name.is_empty() || flags & 0x01 != 0 {
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn parse_dim_style(&mut self) -> Result<DimStyleRecord, DxfError> {
        let mut record = DimStyleRecord::default();
        while let Some((code, value)) = self.next_body_pair("DIMSTYLE 表项")? {
            match code {
                105 | 5 => record.handle = non_empty(&value),
                2 => record.name = value.trim().to_string(),
                140 => record.text_height = Some(parse_f64(&value, "DIMSTYLE 文字高度（组码 140）")?),
                41 => record.arrow_size = Some(parse_f64(&value, "DIMSTYLE 箭头大小（组码 41）")?),
                _ => {}
            }
        }
        Ok(record)
    }

    fn parse_entities(&mut self, document: &mut DxfDocument) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("ENTITIES 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "ENTITIES 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                "SEQEND" | "ATTRIB" => {
                    self.skip_entity_body()?;
                }
                entity => match self.parse_entity(entity)? {
                    Parsed::Entity(record) => document.entities.push(record),
                    Parsed::Skipped(skipped) => document.skipped.push(skipped),
                },
            }
        }
        Ok(())
    }

    fn parse_blocks(&mut self, document: &mut DxfDocument) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("BLOCKS 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "BLOCKS 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                "BLOCK" => {
                    let block = self.parse_block_definition(&mut document.skipped)?;
                    document.blocks.push(block);
                }
                _ => {
                    // 未预期的条目（例如嵌套记录），直接跳过
                    self.skip_entity_body()?;
                }
            }
        }
        Ok(())
    }

    fn parse_block_definition(
        &mut self,
        skipped: &mut Vec<SkippedEntity>,
    ) -> Result<BlockRecord, DxfError> {
        let mut block = BlockRecord::new("");
        let mut base = CoordSlots::default();
        let mut header_done = false;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    if !header_done {
                        header_done = true;
                        if block.name.is_empty() {
                            return Err(DxfError::invalid("BLOCK 缺少名称（组码 2）"));
                        }
                        block.base_point = base.optional("BLOCK 基点")?.unwrap_or(Point3::origin());
                    }
                    // 匿名块只保留图纸空间块的内容
                    let collect = !block.is_anonymous() || block.is_paper_space();
                    match value.trim() {
                        "ENDBLK" => {
                            self.skip_entity_body()?;
                            break;
                        }
                        "ATTDEF" => {
                            let tag = self.parse_attdef()?;
                            if collect && !tag.is_empty() {
                                block.attribute_tags.push(tag);
                            }
                        }
                        "SEQEND" | "ATTRIB" => self.skip_entity_body()?,
                        entity_kind if collect => match self.parse_entity(entity_kind)? {
                            Parsed::Entity(mut record) => {
                                if block.is_paper_space() {
                                    record.common.paper_space = true;
                                }
                                block.entities.push(record);
                            }
                            Parsed::Skipped(entry) => skipped.push(entry),
                        },
                        _ => self.skip_entity_body()?,
                    }
                }
                Some((code, value)) => match code {
                    2 => block.name = value.trim().to_string(),
                    5 => block.handle = non_empty(&value),
                    10 => assign_coord(&mut base.x, &value, "BLOCK 基点 X")?,
                    20 => assign_coord(&mut base.y, &value, "BLOCK 基点 Y")?,
                    30 => assign_coord(&mut base.z, &value, "BLOCK 基点 Z")?,
                    _ => {}
                },
                None => {
                    return Err(DxfError::invalid("BLOCK 定义未找到 ENDBLK 终止标记"));
                }
            }
        }

        Ok(block)
    }

    fn parse_entity(&mut self, kind: &str) -> Result<Parsed, DxfError> {
        let record = match kind {
            "LINE" => self.parse_line()?,
            "POINT" => self.parse_point()?,
            "CIRCLE" => self.parse_circle()?,
            "ARC" => self.parse_arc()?,
            "ELLIPSE" => self.parse_ellipse()?,
            "LWPOLYLINE" => self.parse_lwpolyline()?,
            "POLYLINE" => return self.parse_polyline(),
            "SPLINE" => self.parse_spline()?,
            "TEXT" => self.parse_text()?,
            "MTEXT" => self.parse_mtext()?,
            "DIMENSION" => self.parse_dimension()?,
            "HATCH" => self.parse_hatch()?,
            "INSERT" => self.parse_insert()?,
            "VIEWPORT" => self.parse_viewport()?,
            other => {
                let handle = self.skip_entity_body_capturing_handle()?;
                debug!(kind = other, ?handle, "跳过暂不支持的实体");
                return Ok(Parsed::Skipped(SkippedEntity {
                    kind: other.to_string(),
                    handle,
                }));
            }
        };
        Ok(Parsed::Entity(record))
    }

    fn parse_line(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        while let Some((code, value)) = self.next_body_pair("LINE")? {
            if absorb_common(&mut common, code, &value, "LINE")? {
                continue;
            }
            points.absorb(code, &value, "LINE")?;
        }
        let start = points.required(0, "LINE 起点（组码 10/20）")?;
        let end = points.required(1, "LINE 终点（组码 11/21）")?;
        Ok(EntityRecord::new(common, EntityData::Line { start, end }))
    }

    fn parse_point(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        while let Some((code, value)) = self.next_body_pair("POINT")? {
            if absorb_common(&mut common, code, &value, "POINT")? {
                continue;
            }
            points.absorb(code, &value, "POINT")?;
        }
        let location = points.required(0, "POINT 位置（组码 10/20）")?;
        Ok(EntityRecord::new(common, EntityData::Point { location }))
    }

    fn parse_circle(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut radius = None;
        while let Some((code, value)) = self.next_body_pair("CIRCLE")? {
            if absorb_common(&mut common, code, &value, "CIRCLE")? {
                continue;
            }
            match code {
                40 => assign_coord(&mut radius, &value, "CIRCLE 半径（组码 40）")?,
                _ => {
                    points.absorb(code, &value, "CIRCLE")?;
                }
            }
        }
        let center = points.required(0, "CIRCLE 圆心（组码 10/20）")?;
        let radius = radius.ok_or_else(|| DxfError::invalid("CIRCLE 缺少半径（组码 40）"))?;
        Ok(EntityRecord::new(common, EntityData::Circle { center, radius }))
    }

    fn parse_arc(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        while let Some((code, value)) = self.next_body_pair("ARC")? {
            if absorb_common(&mut common, code, &value, "ARC")? {
                continue;
            }
            match code {
                40 => assign_coord(&mut radius, &value, "ARC 半径（组码 40）")?,
                50 => assign_coord(&mut start_angle, &value, "ARC 起始角（组码 50）")?,
                51 => assign_coord(&mut end_angle, &value, "ARC 终止角（组码 51）")?,
                _ => {
                    points.absorb(code, &value, "ARC")?;
                }
            }
        }
        let center = points.required(0, "ARC 圆心（组码 10/20）")?;
        let radius = radius.ok_or_else(|| DxfError::invalid("ARC 缺少半径（组码 40）"))?;
        let start_angle =
            start_angle.ok_or_else(|| DxfError::invalid("ARC 缺少起始角（组码 50）"))?;
        let end_angle = end_angle.ok_or_else(|| DxfError::invalid("ARC 缺少终止角（组码 51）"))?;
        Ok(EntityRecord::new(
            common,
            EntityData::Arc {
                center,
                radius,
                start_angle,
                end_angle,
            },
        ))
    }

    fn parse_ellipse(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut ratio = None;
        let mut start_parameter = 0.0;
        let mut end_parameter = std::f64::consts::TAU;
        while let Some((code, value)) = self.next_body_pair("ELLIPSE")? {
            if absorb_common(&mut common, code, &value, "ELLIPSE")? {
                continue;
            }
            match code {
                40 => assign_coord(&mut ratio, &value, "ELLIPSE 短长轴比（组码 40）")?,
                41 => start_parameter = parse_f64(&value, "ELLIPSE 起始参数（组码 41）")?,
                42 => end_parameter = parse_f64(&value, "ELLIPSE 终止参数（组码 42）")?,
                _ => {
                    points.absorb(code, &value, "ELLIPSE")?;
                }
            }
        }
        let center = points.required(0, "ELLIPSE 中心（组码 10/20）")?;
        let axis = points.required(1, "ELLIPSE 主轴端点（组码 11/21）")?;
        let ratio = ratio.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少短长轴比（组码 40）"))?;
        Ok(EntityRecord::new(
            common,
            EntityData::Ellipse {
                center,
                major_axis: Vector3::new(axis.x(), axis.y(), axis.z()),
                ratio,
                start_parameter,
                end_parameter,
            },
        ))
    }

    fn parse_lwpolyline(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut closed = false;
        let mut elevation = 0.0;
        let mut coords: Vec<CoordSlots> = Vec::new();
        let mut bulges: Vec<f64> = Vec::new();
        while let Some((code, value)) = self.next_body_pair("LWPOLYLINE")? {
            if absorb_common(&mut common, code, &value, "LWPOLYLINE")? {
                continue;
            }
            match code {
                70 => {
                    let flag = parse_i32(&value, "LWPOLYLINE 标志")?;
                    closed = flag & 0x01 == 0x01;
                }
                38 => elevation = parse_f64(&value, "LWPOLYLINE 高程（组码 38）")?,
                10 => {
                    push_axis(&mut coords, 0, &value, "LWPOLYLINE 顶点 X")?;
                    bulges.push(0.0);
                }
                20 => push_axis(&mut coords, 1, &value, "LWPOLYLINE 顶点 Y")?,
                42 => {
                    let bulge = parse_f64(&value, "LWPOLYLINE 顶点 bulge")?;
                    match bulges.last_mut() {
                        Some(slot) => *slot = bulge,
                        None => {
                            return Err(DxfError::invalid(
                                "LWPOLYLINE 在定义首个顶点前遇到 bulge（组码 42）",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        let points = finish_points(&coords, "LWPOLYLINE 顶点（组码 10/20）")?;
        if points.is_empty() {
            return Err(DxfError::invalid("LWPOLYLINE 未解析到任何顶点"));
        }
        let vertices = points
            .into_iter()
            .zip(bulges)
            .map(|(point, bulge)| {
                PolylineVertex::with_bulge(Point3::new(point.x(), point.y(), elevation), bulge)
            })
            .collect();
        Ok(EntityRecord::new(
            common,
            EntityData::LwPolyline { vertices, closed },
        ))
    }

    fn parse_polyline(&mut self) -> Result<Parsed, DxfError> {
        let mut common = EntityCommon::default();
        let mut flags: i16 = 0;
        let mut elevation = 0.0;
        while let Some((code, value)) = self.next_body_pair("POLYLINE")? {
            if absorb_common(&mut common, code, &value, "POLYLINE")? {
                continue;
            }
            match code {
                70 => flags = parse_i16(&value, "POLYLINE 标志（组码 70）")?,
                30 => elevation = parse_f64(&value, "POLYLINE 高程（组码 30）")?,
                _ => {}
            }
        }

        let mut vertices = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" => {
                        if let Some(vertex) = self.parse_vertex()? {
                            vertices.push(vertex);
                        }
                    }
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        // 缺少 SEQEND 时以下一个实体为界
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, _)) => {
                    return Err(DxfError::invalid(format!(
                        "POLYLINE 顶点序列出现意外组码 {code}"
                    )));
                }
                None => return Err(DxfError::invalid("POLYLINE 顶点序列未正确结束")),
            }
        }

        if flags & (0x10 | 0x40) != 0 {
            return Ok(Parsed::Skipped(SkippedEntity {
                kind: "POLYLINE（网格）".to_string(),
                handle: common.handle,
            }));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("POLYLINE 未解析到任何顶点"));
        }

        let is_3d = flags & 0x08 != 0;
        if !is_3d {
            for vertex in &mut vertices {
                vertex.position = Point3::new(vertex.position.x(), vertex.position.y(), elevation);
            }
        }
        Ok(Parsed::Entity(EntityRecord::new(
            common,
            EntityData::Polyline {
                vertices,
                closed: flags & 0x01 != 0,
                is_3d,
            },
        )))
    }

    fn parse_vertex(&mut self) -> Result<Option<PolylineVertex>, DxfError> {
        let mut points = PointSet::default();
        let mut bulge = 0.0;
        let mut flags: i16 = 0;
        while let Some((code, value)) = self.next_body_pair("VERTEX")? {
            match code {
                42 => bulge = parse_f64(&value, "VERTEX bulge（组码 42）")?,
                70 => flags = parse_i16(&value, "VERTEX 标志（组码 70）")?,
                _ => {
                    points.absorb(code, &value, "VERTEX")?;
                }
            }
        }
        // 样条拟合的控制框架点不属于多段线本身
        if flags & 0x10 != 0 {
            return Ok(None);
        }
        let position = points.required(0, "VERTEX 位置（组码 10/20）")?;
        Ok(Some(PolylineVertex::with_bulge(position, bulge)))
    }

    fn parse_spline(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut flags: i16 = 0;
        let mut degree: i32 = 3;
        let mut knots = Vec::new();
        let mut weights = Vec::new();
        let mut control: Vec<CoordSlots> = Vec::new();
        let mut fit: Vec<CoordSlots> = Vec::new();
        while let Some((code, value)) = self.next_body_pair("SPLINE")? {
            if absorb_common(&mut common, code, &value, "SPLINE")? {
                continue;
            }
            match code {
                70 => flags = parse_i16(&value, "SPLINE 标志（组码 70）")?,
                71 => degree = parse_i32(&value, "SPLINE 阶数（组码 71）")?,
                40 => knots.push(parse_f64(&value, "SPLINE 节点（组码 40）")?),
                41 => weights.push(parse_f64(&value, "SPLINE 权重（组码 41）")?),
                10 => push_axis(&mut control, 0, &value, "SPLINE 控制点 X")?,
                20 => push_axis(&mut control, 1, &value, "SPLINE 控制点 Y")?,
                30 => push_axis(&mut control, 2, &value, "SPLINE 控制点 Z")?,
                11 => push_axis(&mut fit, 0, &value, "SPLINE 拟合点 X")?,
                21 => push_axis(&mut fit, 1, &value, "SPLINE 拟合点 Y")?,
                31 => push_axis(&mut fit, 2, &value, "SPLINE 拟合点 Z")?,
                _ => {}
            }
        }
        let control_points = finish_points(&control, "SPLINE 控制点（组码 10/20）")?;
        let fit_points = finish_points(&fit, "SPLINE 拟合点（组码 11/21）")?;
        if control_points.is_empty() && fit_points.is_empty() {
            return Err(DxfError::invalid("SPLINE 既没有控制点也没有拟合点"));
        }
        if degree < 1 {
            return Err(DxfError::invalid(format!("SPLINE 阶数 {degree} 无效")));
        }
        Ok(EntityRecord::new(
            common,
            EntityData::Spline {
                degree,
                closed: flags & (0x01 | 0x02) != 0,
                knots,
                weights,
                control_points,
                fit_points,
            },
        ))
    }

    fn parse_text(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut height = None;
        let mut content: Option<String> = None;
        let mut rotation = 0.0;
        let mut style = None;
        let mut horizontal: i16 = 0;
        let mut vertical: i16 = 0;
        while let Some((code, value)) = self.next_body_pair("TEXT")? {
            if absorb_common(&mut common, code, &value, "TEXT")? {
                continue;
            }
            match code {
                40 => assign_coord(&mut height, &value, "TEXT 高度（组码 40）")?,
                1 => content = Some(value),
                50 => rotation = parse_f64(&value, "TEXT 旋转角（组码 50）")?,
                7 => style = non_empty(&value),
                72 => horizontal = parse_i16(&value, "TEXT 水平对齐（组码 72）")?,
                73 => vertical = parse_i16(&value, "TEXT 垂直对齐（组码 73）")?,
                _ => {
                    points.absorb(code, &value, "TEXT")?;
                }
            }
        }
        let insert = points.required(0, "TEXT 插入点（组码 10/20）")?;
        let alignment_point = points.optional(1, "TEXT 对齐点（组码 11/21）")?;
        let height = height.ok_or_else(|| DxfError::invalid("TEXT 缺少高度（组码 40）"))?;
        let content = content.ok_or_else(|| DxfError::invalid("TEXT 缺少内容（组码 1）"))?;
        Ok(EntityRecord::new(
            common,
            EntityData::Text {
                insert,
                alignment_point,
                height,
                content,
                rotation,
                style,
                horizontal,
                vertical,
            },
        ))
    }

    fn parse_mtext(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut insert = CoordSlots::default();
        let mut height = None;
        let mut reference_width: Option<f64> = None;
        let mut direction_x: Option<f64> = None;
        let mut direction_y: Option<f64> = None;
        let mut rotation_deg: Option<f64> = None;
        let mut attachment: i16 = 1;
        let mut style: Option<String> = None;
        let mut fragments: Vec<String> = Vec::new();
        let mut tail: Option<String> = None;

        while let Some((code, value)) = self.next_body_pair("MTEXT")? {
            if absorb_common(&mut common, code, &value, "MTEXT")? {
                continue;
            }
            match code {
                10 => assign_coord(&mut insert.x, &value, "MTEXT 插入点 X")?,
                20 => assign_coord(&mut insert.y, &value, "MTEXT 插入点 Y")?,
                30 => assign_coord(&mut insert.z, &value, "MTEXT 插入点 Z")?,
                40 => assign_coord(&mut height, &value, "MTEXT 高度（组码 40）")?,
                41 => {
                    let width = parse_f64(&value, "MTEXT 参考宽度")?;
                    reference_width = if width.abs() < f64::EPSILON {
                        None
                    } else {
                        Some(width)
                    };
                }
                11 => direction_x = Some(parse_f64(&value, "MTEXT 方向向量 X")?),
                21 => direction_y = Some(parse_f64(&value, "MTEXT 方向向量 Y")?),
                50 => rotation_deg = Some(parse_f64(&value, "MTEXT 旋转角")?),
                71 => attachment = parse_i16(&value, "MTEXT 附着点 (组码 71)")?,
                7 => style = non_empty(&value),
                3 => fragments.push(value),
                1 => tail = Some(value),
                _ => {}
            }
        }

        let insert = insert.required("MTEXT 插入点（组码 10/20）")?;
        let height = height.ok_or_else(|| DxfError::invalid("MTEXT 缺少文本高度（组码 40）"))?;
        let tail = tail.ok_or_else(|| DxfError::invalid("MTEXT 缺少内容（组码 1）"))?;
        fragments.push(tail);
        let raw: String = fragments.concat();

        // 方向向量优先于旋转角
        let rotation = match (direction_x, direction_y) {
            (Some(x), Some(y)) if x.abs() >= f64::EPSILON || y.abs() >= f64::EPSILON => {
                y.atan2(x).to_degrees()
            }
            _ => rotation_deg.unwrap_or(0.0),
        };

        Ok(EntityRecord::new(
            common,
            EntityData::MText {
                insert,
                height,
                content: decode_mtext_content(&raw),
                rotation,
                style,
                attachment,
                reference_width,
            },
        ))
    }

    fn parse_dimension(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut block_name = None;
        let mut style = None;
        let mut flags: i16 = 0;
        let mut text: Option<String> = None;
        let mut measurement = None;
        let mut rotation = 0.0;
        while let Some((code, value)) = self.next_body_pair("DIMENSION")? {
            if absorb_common(&mut common, code, &value, "DIMENSION")? {
                continue;
            }
            match code {
                2 => block_name = non_empty(&value),
                3 => style = non_empty(&value),
                70 => flags = parse_i16(&value, "DIMENSION 类型标志（组码 70）")?,
                1 => {
                    let entry = value.trim().to_string();
                    text = if entry == "<>" || entry.is_empty() {
                        None
                    } else {
                        Some(entry)
                    };
                }
                42 => measurement = Some(parse_f64(&value, "DIMENSION 测量值（组码 42）")?),
                50 => rotation = parse_f64(&value, "DIMENSION 旋转角（组码 50）")?,
                _ => {
                    points.absorb(code, &value, "DIMENSION")?;
                }
            }
        }
        let definition_point = points.required(0, "DIMENSION 定义点（组码 10/20）")?;
        let text_midpoint = points
            .optional(1, "DIMENSION 文本中点（组码 11/21）")?
            .unwrap_or(definition_point);
        Ok(EntityRecord::new(
            common,
            EntityData::Dimension {
                block_name,
                style,
                flags,
                definition_point,
                text_midpoint,
                first_point: points.optional(3, "DIMENSION 第一延伸线原点（组码 13/23）")?,
                second_point: points.optional(4, "DIMENSION 第二延伸线原点（组码 14/24）")?,
                arc_point: points.optional(5, "DIMENSION 圆弧定义点（组码 15/25）")?,
                arc_location: points.optional(6, "DIMENSION 弧线位置点（组码 16/26）")?,
                text,
                measurement,
                rotation,
            },
        ))
    }

    fn parse_hatch(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut pattern_name = String::new();
        let mut solid = false;
        let mut scale = 1.0;
        let mut angle = 0.0;
        let mut elevation = 0.0;
        let mut expected_loops: Option<usize> = None;
        let mut loops: Vec<HatchLoop> = Vec::new();
        let mut current: Option<LoopBuilder> = None;
        let mut phase = HatchPhase::Header;

        while let Some((code, value)) = self.next_body_pair("HATCH")? {
            match phase {
                HatchPhase::Header => {
                    if absorb_common(&mut common, code, &value, "HATCH")? {
                        continue;
                    }
                    match code {
                        30 => elevation = parse_f64(&value, "HATCH 高程（组码 30）")?,
                        2 => pattern_name = value.trim().to_string(),
                        70 => solid = parse_i16(&value, "HATCH 实体填充标志（组码 70）")? == 1,
                        91 => {
                            let count = parse_i32(&value, "HATCH 边界环数量（组码 91）")?;
                            expected_loops = Some(usize::try_from(count).map_err(|_| {
                                DxfError::invalid(format!("HATCH 边界环数量 {count} 无效"))
                            })?);
                            phase = HatchPhase::Boundary;
                        }
                        _ => {}
                    }
                }
                HatchPhase::Boundary => match code {
                    92 => {
                        if let Some(builder) = current.take() {
                            loops.push(builder.finish()?);
                        }
                        let flags = parse_i32(&value, "HATCH 边界环标志（组码 92）")?;
                        current = Some(LoopBuilder::new(flags, elevation));
                    }
                    75 | 76 | 52 | 41 | 47 | 98 => {
                        if let Some(builder) = current.take() {
                            loops.push(builder.finish()?);
                        }
                        phase = HatchPhase::Pattern;
                        match code {
                            52 => angle = parse_f64(&value, "HATCH 图案角度（组码 52）")?,
                            41 => scale = parse_f64(&value, "HATCH 图案比例（组码 41）")?,
                            98 => phase = HatchPhase::Seeds,
                            _ => {}
                        }
                    }
                    _ => {
                        if let Some(builder) = current.as_mut() {
                            builder.feed(code, &value)?;
                        }
                    }
                },
                HatchPhase::Pattern => match code {
                    52 => angle = parse_f64(&value, "HATCH 图案角度（组码 52）")?,
                    41 => scale = parse_f64(&value, "HATCH 图案比例（组码 41）")?,
                    98 => phase = HatchPhase::Seeds,
                    _ => {}
                },
                HatchPhase::Seeds => {}
            }
        }
        if let Some(builder) = current.take() {
            loops.push(builder.finish()?);
        }
        if let Some(expected) = expected_loops {
            if expected != loops.len() {
                return Err(DxfError::invalid(format!(
                    "HATCH 声明的边界环数量 {expected} 与实际数量 {} 不符",
                    loops.len()
                )));
            }
        }
        Ok(EntityRecord::new(
            common,
            EntityData::Hatch {
                pattern_name,
                solid,
                scale,
                angle,
                elevation,
                loops,
            },
        ))
    }

    fn parse_insert(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut name = None;
        let mut scale_x: Option<f64> = None;
        let mut scale_y: Option<f64> = None;
        let mut scale_z: Option<f64> = None;
        let mut rotation = 0.0;

        while let Some((code, value)) = self.next_body_pair("INSERT")? {
            if absorb_common(&mut common, code, &value, "INSERT")? {
                continue;
            }
            match code {
                2 => {
                    if name.is_some() {
                        return Err(DxfError::invalid("INSERT 遇到重复的块名（组码 2）"));
                    }
                    name = Some(value.trim().to_string());
                }
                41 => scale_x = Some(parse_f64(&value, "INSERT 缩放 X")?),
                42 => scale_y = Some(parse_f64(&value, "INSERT 缩放 Y")?),
                43 => scale_z = Some(parse_f64(&value, "INSERT 缩放 Z")?),
                50 => rotation = parse_f64(&value, "INSERT 旋转角")?,
                // 66 指示存在属性，解析流程会自动尝试读取
                _ => {
                    points.absorb(code, &value, "INSERT")?;
                }
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("INSERT 缺少块名（组码 2）"))?;
        let insert = points.required(0, "INSERT 插入点（组码 10/20）")?;
        let sx = scale_x.unwrap_or(1.0);
        let sy = scale_y.unwrap_or(sx);
        let sz = scale_z.unwrap_or(1.0);

        let mut attributes: Vec<AttributeRecord> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ATTRIB" => attributes.push(self.parse_attrib()?),
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "INSERT 属性段出现意外组码 {code} 值 {value}"
                    )));
                }
                None => break,
            }
        }

        Ok(EntityRecord::new(
            common,
            EntityData::Insert {
                name,
                insert,
                scale: [sx, sy, sz],
                rotation,
                attributes,
            },
        ))
    }

    fn parse_attrib(&mut self) -> Result<AttributeRecord, DxfError> {
        let mut handle = None;
        let mut tag: Option<String> = None;
        let mut value_text = String::new();
        while let Some((code, value)) = self.next_body_pair("ATTRIB")? {
            match code {
                5 => handle = non_empty(&value),
                2 => tag = Some(value.trim().to_string()),
                1 => value_text = value,
                _ => {}
            }
        }
        let tag = tag.ok_or_else(|| DxfError::invalid("ATTRIB 缺少标记（组码 2）"))?;
        Ok(AttributeRecord {
            handle,
            tag,
            value: value_text,
        })
    }

    fn parse_attdef(&mut self) -> Result<String, DxfError> {
        let mut tag = String::new();
        while let Some((code, value)) = self.next_body_pair("ATTDEF")? {
            if code == 2 {
                tag = value.trim().to_string();
            }
        }
        Ok(tag)
    }

    fn parse_viewport(&mut self) -> Result<EntityRecord, DxfError> {
        let mut common = EntityCommon::default();
        let mut points = PointSet::default();
        let mut width = None;
        let mut height = None;
        let mut id = None;
        let mut view_height = None;
        let mut twist = None;
        let mut frozen_layers = Vec::new();
        // R12 把视图参数保存在 ACAD/MVIEW 扩展数据中
        let mut legacy_reals: Vec<f64> = Vec::new();
        let mut in_mview = false;
        while let Some((code, value)) = self.next_body_pair("VIEWPORT")? {
            if absorb_common(&mut common, code, &value, "VIEWPORT")? {
                continue;
            }
            match code {
                40 => assign_coord(&mut width, &value, "VIEWPORT 宽度（组码 40）")?,
                41 => assign_coord(&mut height, &value, "VIEWPORT 高度（组码 41）")?,
                69 => id = Some(parse_i16(&value, "VIEWPORT 编号（组码 69）")?),
                45 => view_height = Some(parse_f64(&value, "VIEWPORT 视图高度（组码 45）")?),
                51 => twist = Some(parse_f64(&value, "VIEWPORT 扭转角（组码 51）")?),
                331 => {
                    if let Some(handle) = non_empty(&value) {
                        frozen_layers.push(format!("{HANDLE_PREFIX}{handle}"));
                    }
                }
                1000 => in_mview = value.trim() == "MVIEW",
                1040 if in_mview => {
                    legacy_reals.push(parse_f64(&value, "VIEWPORT 扩展数据（组码 1040）")?)
                }
                1003 if in_mview => {
                    if let Some(name) = non_empty(&value) {
                        frozen_layers.push(name);
                    }
                }
                _ => {
                    points.absorb(code, &value, "VIEWPORT")?;
                }
            }
        }
        let center = points.required(0, "VIEWPORT 中心（组码 10/20）")?;
        let width = width.ok_or_else(|| DxfError::invalid("VIEWPORT 缺少宽度（组码 40）"))?;
        let height = height.ok_or_else(|| DxfError::invalid("VIEWPORT 缺少高度（组码 41）"))?;
        let legacy_center = match (legacy_reals.get(2), legacy_reals.get(3)) {
            (Some(x), Some(y)) => Some(Point3::new(*x, *y, 0.0)),
            _ => None,
        };
        let view_center = match points.optional(2, "VIEWPORT 视图中心（组码 12/22）")? {
            Some(point) => point,
            None => legacy_center.unwrap_or(center),
        };
        let view_height = view_height
            .or_else(|| legacy_reals.get(1).copied())
            .unwrap_or(height);
        let twist = twist.or_else(|| legacy_reals.first().copied()).unwrap_or(0.0);
        common.paper_space = true;
        Ok(EntityRecord::new(
            common,
            EntityData::Viewport {
                center,
                width,
                height,
                id,
                view_center,
                view_height,
                twist,
                frozen_layers,
            },
        ))
    }

    /// 读取实体体内的下一个组码对；遇到组码 0 时回退并返回 `None`。
    fn next_body_pair(&mut self, context: &str) -> Result<Option<(i32, String)>, DxfError> {
        match self.reader.next_pair()? {
            Some((0, value)) => {
                self.reader.put_back((0, value));
                Ok(None)
            }
            Some(pair) => Ok(Some(pair)),
            None => Err(DxfError::invalid(format!("{context} 未正确结束"))),
        }
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        self.skip_entity_body_capturing_handle().map(|_| ())
    }

    fn skip_entity_body_capturing_handle(&mut self) -> Result<Option<String>, DxfError> {
        let mut handle = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((5, value)) => handle = non_empty(&value),
                Some(_) => continue,
                None => break,
            }
        }
        Ok(handle)
    }
}

/// 视口冻结图层在解析期间以句柄暂存，全部表读完后再换成图层名。
const HANDLE_PREFIX: &str = "\u{0}handle:";

fn resolve_viewport_layers(document: &mut DxfDocument) {
    let by_handle: HashMap<String, String> = document
        .layers
        .iter()
        .filter_map(|layer| {
            layer
                .handle
                .as_ref()
                .map(|handle| (handle.to_ascii_uppercase(), layer.name.clone()))
        })
        .collect();
    let mut warnings = Vec::new();
    let entities = document
        .entities
        .iter_mut()
        .chain(document.blocks.iter_mut().flat_map(|block| block.entities.iter_mut()));
    for entity in entities {
        if let EntityData::Viewport { frozen_layers, .. } = &mut entity.data {
            let mut resolved = Vec::with_capacity(frozen_layers.len());
            for entry in frozen_layers.drain(..) {
                match entry.strip_prefix(HANDLE_PREFIX) {
                    Some(handle) => match by_handle.get(&handle.to_ascii_uppercase()) {
                        Some(name) => resolved.push(name.clone()),
                        None => warnings.push(format!(
                            "VIEWPORT {} 引用了不存在的图层句柄 {handle}",
                            entity.common.handle.as_deref().unwrap_or("?")
                        )),
                    },
                    None => resolved.push(entry),
                }
            }
            *frozen_layers = resolved;
        }
    }
    document.warnings.extend(warnings);
}

fn absorb_common(
    common: &mut EntityCommon,
    code: i32,
    value: &str,
    kind: &str,
) -> Result<bool, DxfError> {
    match code {
        5 => common.handle = non_empty(value),
        8 => {
            let trimmed = value.trim();
            common.layer = if trimmed.is_empty() { "0" } else { trimmed }.to_string();
        }
        6 => common.line_type = non_empty(value),
        62 => common.color = Some(parse_i16(value, &format!("{kind} 颜色（组码 62）"))?),
        420 => {
            common.true_color = Some(parse_true_color(
                value,
                &format!("{kind} 真彩色（组码 420）"),
            )?)
        }
        370 => common.line_weight = Some(parse_i16(value, &format!("{kind} 线宽（组码 370）"))?),
        440 => {
            common.transparency = Some(parse_i32(value, &format!("{kind} 透明度（组码 440）"))?)
        }
        67 => common.paper_space = parse_i16(value, &format!("{kind} 空间标志（组码 67）"))? == 1,
        _ => return Ok(false),
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy)]
enum HatchPhase {
    Header,
    Boundary,
    Pattern,
    Seeds,
}

struct LoopBuilder {
    flags: i32,
    elevation: f64,
    is_polyline: bool,
    has_bulge: bool,
    closed: bool,
    expected: Option<usize>,
    vertices: Vec<CoordSlots>,
    bulges: Vec<f64>,
    edges: Vec<HatchEdge>,
    edge: Option<EdgeBuilder>,
}

impl LoopBuilder {
    fn new(flags: i32, elevation: f64) -> Self {
        Self {
            flags,
            elevation,
            is_polyline: flags & 0x02 != 0,
            has_bulge: false,
            closed: true,
            expected: None,
            vertices: Vec::new(),
            bulges: Vec::new(),
            edges: Vec::new(),
            edge: None,
        }
    }

    fn feed(&mut self, code: i32, value: &str) -> Result<(), DxfError> {
        if self.is_polyline {
            match code {
                72 => self.has_bulge = parse_i16(value, "HATCH 多段线 bulge 标志（组码 72）")? != 0,
                73 => self.closed = parse_i16(value, "HATCH 多段线闭合标志（组码 73）")? != 0,
                93 => self.expected = Some(parse_count(value, "HATCH 多段线顶点数（组码 93）")?),
                10 => {
                    push_axis(&mut self.vertices, 0, value, "HATCH 多段线顶点 X")?;
                    self.bulges.push(0.0);
                }
                20 => push_axis(&mut self.vertices, 1, value, "HATCH 多段线顶点 Y")?,
                42 => {
                    let bulge = parse_f64(value, "HATCH 多段线 bulge（组码 42）")?;
                    match self.bulges.last_mut() {
                        Some(slot) => *slot = bulge,
                        None => {
                            return Err(DxfError::invalid(
                                "HATCH 多段线在首个顶点前遇到 bulge（组码 42）",
                            ));
                        }
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match code {
            93 if self.edge.is_none() => {
                self.expected = Some(parse_count(value, "HATCH 边数量（组码 93）")?)
            }
            72 => {
                self.flush_edge()?;
                let edge_type = parse_i16(value, "HATCH 边类型（组码 72）")?;
                self.edge = Some(EdgeBuilder::new(edge_type)?);
            }
            330 => {}
            _ => {
                if let Some(edge) = self.edge.as_mut() {
                    edge.feed(code, value)?;
                }
            }
        }
        Ok(())
    }

    fn flush_edge(&mut self) -> Result<(), DxfError> {
        if let Some(edge) = self.edge.take() {
            self.edges.push(edge.finish(self.elevation)?);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<HatchLoop, DxfError> {
        if self.is_polyline {
            let points = finish_points(&self.vertices, "HATCH 多段线边界顶点")?;
            if let Some(expected) = self.expected {
                if expected != points.len() {
                    return Err(DxfError::invalid(format!(
                        "HATCH 多段线环路声明的顶点数量 {expected} 与实际数量 {} 不符",
                        points.len()
                    )));
                }
            }
            let elevation = self.elevation;
            let has_bulge = self.has_bulge;
            let vertices = points
                .into_iter()
                .zip(self.bulges)
                .map(|(point, bulge)| {
                    let bulge = if has_bulge { bulge } else { 0.0 };
                    PolylineVertex::with_bulge(lift(point, elevation), bulge)
                })
                .collect();
            return Ok(HatchLoop {
                flags: self.flags,
                edges: vec![HatchEdge::Polyline {
                    vertices,
                    closed: self.closed,
                }],
            });
        }

        self.flush_edge()?;
        if let Some(expected) = self.expected {
            if expected != self.edges.len() {
                return Err(DxfError::invalid(format!(
                    "HATCH 边界环声明的边数量 {expected} 与实际数量 {} 不符",
                    self.edges.len()
                )));
            }
        }
        Ok(HatchLoop {
            flags: self.flags,
            edges: self.edges,
        })
    }
}

struct EdgeBuilder {
    edge_type: i16,
    points: PointSet,
    value_40: Option<f64>,
    start_angle: Option<f64>,
    end_angle: Option<f64>,
    counter_clockwise: bool,
    degree: i32,
    knots: Vec<f64>,
    control: Vec<CoordSlots>,
    weights: Vec<f64>,
}

impl EdgeBuilder {
    fn new(edge_type: i16) -> Result<Self, DxfError> {
        if !(1..=4).contains(&edge_type) {
            return Err(DxfError::invalid(format!(
                "HATCH 边类型 {edge_type} 无效（期望 1-4）"
            )));
        }
        Ok(Self {
            edge_type,
            points: PointSet::default(),
            value_40: None,
            start_angle: None,
            end_angle: None,
            counter_clockwise: true,
            degree: 3,
            knots: Vec::new(),
            control: Vec::new(),
            weights: Vec::new(),
        })
    }

    fn feed(&mut self, code: i32, value: &str) -> Result<(), DxfError> {
        if self.edge_type == 4 {
            match code {
                94 => self.degree = parse_i32(value, "HATCH 样条边阶数（组码 94）")?,
                40 => self.knots.push(parse_f64(value, "HATCH 样条边节点（组码 40）")?),
                42 => self.weights.push(parse_f64(value, "HATCH 样条边权重（组码 42）")?),
                10 => push_axis(&mut self.control, 0, value, "HATCH 样条边控制点 X")?,
                20 => push_axis(&mut self.control, 1, value, "HATCH 样条边控制点 Y")?,
                // 拟合点与切向数据不参与重建
                _ => {}
            }
            return Ok(());
        }
        match code {
            40 => assign_coord(&mut self.value_40, value, "HATCH 边半径/比例（组码 40）")?,
            50 => assign_coord(&mut self.start_angle, value, "HATCH 边起始角（组码 50）")?,
            51 => assign_coord(&mut self.end_angle, value, "HATCH 边终止角（组码 51）")?,
            73 => self.counter_clockwise = parse_i16(value, "HATCH 边方向（组码 73）")? != 0,
            _ => {
                self.points.absorb(code, value, "HATCH 边")?;
            }
        }
        Ok(())
    }

    fn finish(self, elevation: f64) -> Result<HatchEdge, DxfError> {
        match self.edge_type {
            1 => Ok(HatchEdge::Line {
                start: lift(self.points.required(0, "HATCH 直线边起点")?, elevation),
                end: lift(self.points.required(1, "HATCH 直线边终点")?, elevation),
            }),
            2 => Ok(HatchEdge::Arc {
                center: lift(self.points.required(0, "HATCH 圆弧边圆心")?, elevation),
                radius: self
                    .value_40
                    .ok_or_else(|| DxfError::invalid("HATCH 圆弧边缺少半径（组码 40）"))?,
                start_angle: self.start_angle.unwrap_or(0.0),
                end_angle: self.end_angle.unwrap_or(360.0),
                counter_clockwise: self.counter_clockwise,
            }),
            3 => {
                let axis = self.points.required(1, "HATCH 椭圆边主轴端点")?;
                Ok(HatchEdge::Ellipse {
                    center: lift(self.points.required(0, "HATCH 椭圆边中心")?, elevation),
                    major_axis: Vector3::new(axis.x(), axis.y(), 0.0),
                    ratio: self
                        .value_40
                        .ok_or_else(|| DxfError::invalid("HATCH 椭圆边缺少短长轴比（组码 40）"))?,
                    start_angle: self.start_angle.unwrap_or(0.0),
                    end_angle: self.end_angle.unwrap_or(360.0),
                    counter_clockwise: self.counter_clockwise,
                })
            }
            _ => {
                let control_points = finish_points(&self.control, "HATCH 样条边控制点")?
                    .into_iter()
                    .map(|point| lift(point, elevation))
                    .collect::<Vec<_>>();
                if control_points.is_empty() {
                    return Err(DxfError::invalid("HATCH 样条边没有控制点"));
                }
                Ok(HatchEdge::Spline {
                    degree: self.degree,
                    knots: self.knots,
                    control_points,
                    weights: self.weights,
                })
            }
        }
    }
}

#[inline]
fn lift(point: Point3, elevation: f64) -> Point3 {
    Point3::new(point.x(), point.y(), elevation)
}

#[derive(Debug, Default, Clone, Copy)]
struct CoordSlots {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
}

impl CoordSlots {
    fn optional(&self, context: &str) -> Result<Option<Point3>, DxfError> {
        match (self.x, self.y, self.z) {
            (None, None, None) => Ok(None),
            (Some(x), Some(y), z) => Ok(Some(Point3::new(x, y, z.unwrap_or(0.0)))),
            _ => Err(DxfError::invalid(format!("{context} 缺少完整的 XY 坐标"))),
        }
    }

    fn required(&self, context: &str) -> Result<Point3, DxfError> {
        self.optional(context)?
            .ok_or_else(|| DxfError::invalid(format!("{context} 缺失")))
    }
}

/// 组码 1x/2x/3x 描述的单值点位（x 为点序号）。
#[derive(Debug, Default)]
struct PointSet {
    slots: [CoordSlots; 9],
}

impl PointSet {
    fn absorb(&mut self, code: i32, value: &str, kind: &str) -> Result<bool, DxfError> {
        let (index, axis) = match code {
            10..=18 => ((code - 10) as usize, 0),
            20..=28 => ((code - 20) as usize, 1),
            30..=38 => ((code - 30) as usize, 2),
            _ => return Ok(false),
        };
        let slot = &mut self.slots[index];
        let target = match axis {
            0 => &mut slot.x,
            1 => &mut slot.y,
            _ => &mut slot.z,
        };
        assign_coord(target, value, &format!("{kind} 坐标（组码 {code}）"))?;
        Ok(true)
    }

    fn optional(&self, index: usize, context: &str) -> Result<Option<Point3>, DxfError> {
        self.slots[index].optional(context)
    }

    fn required(&self, index: usize, context: &str) -> Result<Point3, DxfError> {
        self.slots[index].required(context)
    }
}

/// 顶点序列：X 开启新顶点，随后的 Y/Z 补齐最近一个顶点。
fn push_axis(
    points: &mut Vec<CoordSlots>,
    axis: usize,
    raw: &str,
    context: &str,
) -> Result<(), DxfError> {
    let value = parse_f64(raw, context)?;
    if axis == 0 {
        points.push(CoordSlots {
            x: Some(value),
            ..CoordSlots::default()
        });
        return Ok(());
    }
    let last = points
        .last_mut()
        .ok_or_else(|| DxfError::invalid(format!("{context} 出现在对应的 X 坐标之前")))?;
    let slot = if axis == 1 { &mut last.y } else { &mut last.z };
    if slot.replace(value).is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    Ok(())
}

fn finish_points(points: &[CoordSlots], context: &str) -> Result<Vec<Point3>, DxfError> {
    points.iter().map(|slots| slots.required(context)).collect()
}

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines(),
            buffer: None,
            line_number: 0,
        }
    }

    /// 返回下一个组码对，跳过 999 注释。
    fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }

        loop {
            let code_line = match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    line
                }
                None => return Ok(None),
            };

            let value_line = match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    line
                }
                None => {
                    if code_line.trim().is_empty() {
                        return Ok(None);
                    }
                    return Err(DxfError::invalid(format!(
                        "文件在第 {} 行结束，缺少与组码对应的值行",
                        self.line_number
                    )));
                }
            };

            let code = code_line.trim().parse::<i32>().map_err(|_| {
                DxfError::invalid(format!(
                    "第 {} 行的组码 \"{}\" 无法解析为整数",
                    self.line_number - 1,
                    code_line.trim()
                ))
            })?;
            if code == 999 {
                continue;
            }
            let value = value_line.trim_end_matches('\r').to_string();
            return Ok(Some((code, value)));
        }
    }

    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "内部错误：尝试多次回退 DXF pair");
        self.buffer = Some(pair);
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))?;
    if !value.is_finite() {
        return Err(DxfError::invalid(format!("{context} 不是有限数值（值：\"{raw}\"）")));
    }
    Ok(value)
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 超出 i16 范围（值：{value}）")))
}

fn parse_count(raw: &str, context: &str) -> Result<usize, DxfError> {
    let value = parse_i32(raw, context)?;
    usize::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 不能为负数（值：{value}）")))
}

/// 组码 420 的 24 位颜色；部分写出器以有符号整数保存。
fn parse_true_color(raw: &str, context: &str) -> Result<u32, DxfError> {
    let value = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))?;
    Ok((value as u32) & 0x00FF_FFFF)
}

fn decode_mtext_content(raw: &str) -> String {
    let mut result = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> DxfDocument {
        DxfParser::new(source).parse().expect("解析应成功")
    }

    #[test]
    fn decodes_mtext_paragraphs() {
        assert_eq!(decode_mtext_content("A\\PB\\\\C"), "A\nB\\C");
    }

    #[test]
    fn comments_are_ignored() {
        let document = parse("999\nnote\n0\nSECTION\n2\nENTITIES\n0\nENDSEC\n0\nEOF\n");
        assert!(document.entities.is_empty());
    }

    #[test]
    fn missing_eof_is_rejected() {
        let err = DxfParser::new("0\nSECTION\n2\nENTITIES\n0\nENDSEC\n")
            .parse()
            .expect_err("缺少 EOF 应失败");
        assert!(matches!(err, DxfError::Invalid { .. }));
    }

    #[test]
    fn unknown_entities_are_recorded() {
        let document = parse(
            "0\nSECTION\n2\nENTITIES\n0\n3DSOLID\n5\n2A\n8\n0\n0\nPOINT\n8\nP\n10\n1\n20\n2\n0\nENDSEC\n0\nEOF\n",
        );
        assert_eq!(document.entities.len(), 1);
        assert_eq!(document.skipped.len(), 1);
        assert_eq!(document.skipped[0].kind, "3DSOLID");
        assert_eq!(document.skipped[0].handle.as_deref(), Some("2A"));
    }

    #[test]
    fn duplicate_coordinate_is_invalid() {
        let err = DxfParser::new(
            "0\nSECTION\n2\nENTITIES\n0\nLINE\n10\n0\n10\n1\n20\n0\n11\n1\n21\n1\n0\nENDSEC\n0\nEOF\n",
        )
        .parse()
        .expect_err("重复坐标应失败");
        assert!(matches!(err, DxfError::Invalid { .. }));
    }

    #[test]
    fn paper_block_entities_are_marked() {
        let document = parse(
            "0\nSECTION\n2\nBLOCKS\n0\nBLOCK\n2\n*Paper_Space\n10\n0\n20\n0\n0\nPOINT\n8\n0\n10\n1\n20\n1\n0\nENDBLK\n0\nENDSEC\n0\nEOF\n",
        );
        let block = &document.blocks[0];
        assert!(block.is_paper_space());
        assert!(block.entities[0].common.paper_space);
    }
}
