//! 交换文件的内存结构表示。读取器产出它，写出器消费它。

use cadsync_core::geometry::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::version::DxfVersion;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DxfDocument {
    pub version: DxfVersion,
    /// `$INSUNITS`。
    pub units: Option<i16>,
    pub line_types: Vec<LineTypeRecord>,
    pub layers: Vec<LayerRecord>,
    pub text_styles: Vec<TextStyleRecord>,
    pub dim_styles: Vec<DimStyleRecord>,
    pub blocks: Vec<BlockRecord>,
    pub entities: Vec<EntityRecord>,
    /// 读取时跳过的实体（暂不支持的类型）。
    pub skipped: Vec<SkippedEntity>,
    /// 读取时发现、但不影响结构有效性的问题。
    pub warnings: Vec<String>,
}

impl DxfDocument {
    pub fn new(version: DxfVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn layer(&self, name: &str) -> Option<&LayerRecord> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn block(&self, name: &str) -> Option<&BlockRecord> {
        self.blocks.iter().find(|block| block.name == name)
    }

    /// 图纸空间块（`*Paper_Space*`）中的实体视为图纸空间内容。
    pub fn paper_space_block_entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.blocks
            .iter()
            .filter(|block| block.is_paper_space())
            .flat_map(|block| block.entities.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntity {
    pub kind: String,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineTypeRecord {
    pub handle: Option<String>,
    pub name: String,
    pub description: String,
    pub pattern: Vec<f64>,
}

impl LineTypeRecord {
    /// `ByLayer`/`ByBlock` 是伪线型，不进入标准库。
    pub fn is_pseudo(name: &str) -> bool {
        name.eq_ignore_ascii_case("BYLAYER") || name.eq_ignore_ascii_case("BYBLOCK")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub handle: Option<String>,
    pub name: String,
    pub color: i16,
    pub true_color: Option<u32>,
    pub line_type: Option<String>,
    pub line_weight: Option<i16>,
    pub flags: i16,
}

impl LayerRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            handle: None,
            name: name.into(),
            color: 7,
            true_color: None,
            line_type: None,
            line_weight: None,
            flags: 0,
        }
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.flags & 0x01 != 0
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flags & 0x04 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyleRecord {
    pub handle: Option<String>,
    pub name: String,
    pub font: String,
    pub height: f64,
    pub width_factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimStyleRecord {
    pub handle: Option<String>,
    pub name: String,
    /// DIMTXT（组码 140）。
    pub text_height: Option<f64>,
    /// DIMASZ（组码 41）。
    pub arrow_size: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub handle: Option<String>,
    pub name: String,
    pub base_point: Point3,
    pub entities: Vec<EntityRecord>,
    pub attribute_tags: Vec<String>,
}

impl BlockRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            handle: None,
            name: name.into(),
            base_point: Point3::origin(),
            entities: Vec::new(),
            attribute_tags: Vec::new(),
        }
    }

    /// 匿名块（`*D1`、`*Model_Space` 等）。
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with('*')
    }

    #[inline]
    pub fn is_paper_space(&self) -> bool {
        is_paper_space_block(&self.name)
    }
}

pub(crate) fn is_paper_space_block(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("*paper_space")
}

/// 所有实体共有的组码字段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCommon {
    pub handle: Option<String>,
    pub layer: String,
    pub line_type: Option<String>,
    pub color: Option<i16>,
    pub true_color: Option<u32>,
    pub line_weight: Option<i16>,
    pub transparency: Option<i32>,
    pub paper_space: bool,
}

impl EntityCommon {
    pub fn on_layer(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            ..Self::default()
        }
    }
}

impl Default for EntityCommon {
    fn default() -> Self {
        Self {
            handle: None,
            layer: "0".to_string(),
            line_type: None,
            color: None,
            true_color: None,
            line_weight: None,
            transparency: None,
            paper_space: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub common: EntityCommon,
    pub data: EntityData,
}

impl EntityRecord {
    pub fn new(common: EntityCommon, data: EntityData) -> Self {
        Self { common, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolylineVertex {
    pub position: Point3,
    pub bulge: f64,
}

impl PolylineVertex {
    #[inline]
    pub fn new(position: Point3) -> Self {
        Self {
            position,
            bulge: 0.0,
        }
    }

    #[inline]
    pub fn with_bulge(position: Point3, bulge: f64) -> Self {
        Self { position, bulge }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub handle: Option<String>,
    pub tag: String,
    pub value: String,
}

/// 填充边界环。坐标为二维，高程取填充实体的高程。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HatchLoop {
    pub flags: i32,
    pub edges: Vec<HatchEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HatchEdge {
    Polyline {
        vertices: Vec<PolylineVertex>,
        closed: bool,
    },
    Line {
        start: Point3,
        end: Point3,
    },
    Arc {
        center: Point3,
        radius: f64,
        /// 度。
        start_angle: f64,
        end_angle: f64,
        counter_clockwise: bool,
    },
    Ellipse {
        center: Point3,
        /// 主轴端点（相对圆心）。
        major_axis: Vector3,
        ratio: f64,
        /// 度。
        start_angle: f64,
        end_angle: f64,
        counter_clockwise: bool,
    },
    Spline {
        degree: i32,
        knots: Vec<f64>,
        control_points: Vec<Point3>,
        weights: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityData {
    Line {
        start: Point3,
        end: Point3,
    },
    Point {
        location: Point3,
    },
    Circle {
        center: Point3,
        radius: f64,
    },
    /// 角度单位为度，逆时针。
    Arc {
        center: Point3,
        radius: f64,
        start_angle: f64,
        end_angle: f64,
    },
    Ellipse {
        center: Point3,
        major_axis: Vector3,
        ratio: f64,
        start_parameter: f64,
        end_parameter: f64,
    },
    LwPolyline {
        vertices: Vec<PolylineVertex>,
        closed: bool,
    },
    Polyline {
        vertices: Vec<PolylineVertex>,
        closed: bool,
        is_3d: bool,
    },
    Spline {
        degree: i32,
        closed: bool,
        knots: Vec<f64>,
        weights: Vec<f64>,
        control_points: Vec<Point3>,
        fit_points: Vec<Point3>,
    },
    Text {
        insert: Point3,
        alignment_point: Option<Point3>,
        height: f64,
        content: String,
        rotation: f64,
        style: Option<String>,
        horizontal: i16,
        vertical: i16,
    },
    MText {
        insert: Point3,
        height: f64,
        content: String,
        rotation: f64,
        style: Option<String>,
        attachment: i16,
        reference_width: Option<f64>,
    },
    Dimension {
        block_name: Option<String>,
        style: Option<String>,
        flags: i16,
        definition_point: Point3,
        text_midpoint: Point3,
        first_point: Option<Point3>,
        second_point: Option<Point3>,
        arc_point: Option<Point3>,
        arc_location: Option<Point3>,
        text: Option<String>,
        measurement: Option<f64>,
        rotation: f64,
    },
    Hatch {
        pattern_name: String,
        solid: bool,
        scale: f64,
        angle: f64,
        elevation: f64,
        loops: Vec<HatchLoop>,
    },
    Insert {
        name: String,
        insert: Point3,
        scale: [f64; 3],
        rotation: f64,
        attributes: Vec<AttributeRecord>,
    },
    Viewport {
        center: Point3,
        width: f64,
        height: f64,
        id: Option<i16>,
        view_center: Point3,
        view_height: f64,
        twist: f64,
        frozen_layers: Vec<String>,
    },
}

impl EntityData {
    /// 对应 DXF 的实体类型名。
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityData::Line { .. } => "LINE",
            EntityData::Point { .. } => "POINT",
            EntityData::Circle { .. } => "CIRCLE",
            EntityData::Arc { .. } => "ARC",
            EntityData::Ellipse { .. } => "ELLIPSE",
            EntityData::LwPolyline { .. } => "LWPOLYLINE",
            EntityData::Polyline { .. } => "POLYLINE",
            EntityData::Spline { .. } => "SPLINE",
            EntityData::Text { .. } => "TEXT",
            EntityData::MText { .. } => "MTEXT",
            EntityData::Dimension { .. } => "DIMENSION",
            EntityData::Hatch { .. } => "HATCH",
            EntityData::Insert { .. } => "INSERT",
            EntityData::Viewport { .. } => "VIEWPORT",
        }
    }
}
