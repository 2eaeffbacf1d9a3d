//! 关系/空间存储中的记录模型。
//!
//! 记录本身不携带主键；存储层以 `(Id, Record)` 元组返回，与插入时分配的
//! 标识一一对应。所有几何字段都伴随一个 [`CoordinateReference`]，其值继承自
//! 所属图纸。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crs::CoordinateReference;
use crate::geometry::Point3;
use crate::style::{Color, LineWeight, Transparency};

macro_rules! record_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(u64);

            impl $name {
                #[inline]
                pub fn new(raw: u64) -> Self {
                    Self(raw)
                }

                /// 提供原始数值，便于持久化或日志输出。
                #[inline]
                pub fn get(self) -> u64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

record_id!(
    /// 图纸标识。
    DrawingId,
    /// 图层标识（图纸内）。
    LayerId,
    /// 标准库条目标识（跨图纸共享）。
    StandardId,
    PrimitiveId,
    TextId,
    DimensionId,
    HatchId,
    PlacementId,
    ViewportId,
    /// 导出任务标识。
    JobId,
);

/// 图纸单位，对应 `$INSUNITS`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawingUnits {
    #[default]
    Unitless,
    Inches,
    Feet,
    Millimeters,
    Centimeters,
    Meters,
    Other(i16),
}

impl DrawingUnits {
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => DrawingUnits::Unitless,
            1 => DrawingUnits::Inches,
            2 => DrawingUnits::Feet,
            4 => DrawingUnits::Millimeters,
            5 => DrawingUnits::Centimeters,
            6 => DrawingUnits::Meters,
            other => DrawingUnits::Other(other),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            DrawingUnits::Unitless => 0,
            DrawingUnits::Inches => 1,
            DrawingUnits::Feet => 2,
            DrawingUnits::Millimeters => 4,
            DrawingUnits::Centimeters => 5,
            DrawingUnits::Meters => 6,
            DrawingUnits::Other(code) => code,
        }
    }
}

/// 导入内容的容器。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub name: String,
    pub units: DrawingUnits,
    pub scale: f64,
    pub crs: CoordinateReference,
    pub created_at: DateTime<Utc>,
}

impl Drawing {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: DrawingUnits::default(),
            scale: 1.0,
            crs: CoordinateReference::Local,
            created_at: Utc::now(),
        }
    }

    pub fn with_crs(mut self, crs: CoordinateReference) -> Self {
        self.crs = crs;
        self
    }

    pub fn with_units(mut self, units: DrawingUnits) -> Self {
        self.units = units;
        self
    }
}

/// 模型空间或图纸空间。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    #[default]
    Model,
    Paper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub drawing_id: DrawingId,
    pub name: String,
    pub color: Color,
    pub line_style: Option<StandardId>,
    pub line_weight: LineWeight,
    pub frozen: bool,
    pub locked: bool,
    /// 关联的图层标准（若有）。
    pub standard: Option<StandardId>,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Line,
    Polyline,
    Arc,
    Circle,
    Ellipse,
    Spline,
    Point,
}

impl PrimitiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveKind::Line => "line",
            PrimitiveKind::Polyline => "polyline",
            PrimitiveKind::Arc => "arc",
            PrimitiveKind::Circle => "circle",
            PrimitiveKind::Ellipse => "ellipse",
            PrimitiveKind::Spline => "spline",
            PrimitiveKind::Point => "point",
        }
    }

    /// 源数据为真实曲线、入库时经过离散化的类型。
    #[inline]
    pub fn is_discretized_curve(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Arc | PrimitiveKind::Circle | PrimitiveKind::Ellipse | PrimitiveKind::Spline
        )
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规范化几何：单点、有序点序列或闭合环。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "points", rename_all = "snake_case")]
pub enum Shape {
    Point(Point3),
    Path(Vec<Point3>),
    /// 首尾点相同的闭合环。
    Ring(Vec<Point3>),
}

impl Shape {
    pub fn points(&self) -> &[Point3] {
        match self {
            Shape::Point(point) => std::slice::from_ref(point),
            Shape::Path(points) | Shape::Ring(points) => points,
        }
    }

    #[inline]
    pub fn is_ring(&self) -> bool {
        matches!(self, Shape::Ring(_))
    }
}

/// 覆盖图层默认值的样式；`None` 表示沿用图层。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleOverrides {
    pub color: Option<Color>,
    pub line_style: Option<StandardId>,
    pub line_weight: Option<LineWeight>,
    pub transparency: Option<Transparency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveEntity {
    pub drawing_id: DrawingId,
    pub layer_id: LayerId,
    pub kind: PrimitiveKind,
    pub shape: Shape,
    pub crs: CoordinateReference,
    pub space: Space,
    /// 源文件中的句柄，仅用于往返匹配，不做解释。
    pub handle: Option<String>,
    pub style: StyleOverrides,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalJustification {
    #[default]
    Left,
    Center,
    Right,
    Aligned,
    Middle,
    Fit,
}

impl HorizontalJustification {
    pub fn from_dxf(code: i16) -> Self {
        match code {
            1 => Self::Center,
            2 => Self::Right,
            3 => Self::Aligned,
            4 => Self::Middle,
            5 => Self::Fit,
            _ => Self::Left,
        }
    }

    pub fn to_dxf(self) -> i16 {
        match self {
            Self::Left => 0,
            Self::Center => 1,
            Self::Right => 2,
            Self::Aligned => 3,
            Self::Middle => 4,
            Self::Fit => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalJustification {
    #[default]
    Baseline,
    Bottom,
    Middle,
    Top,
}

impl VerticalJustification {
    pub fn from_dxf(code: i16) -> Self {
        match code {
            1 => Self::Bottom,
            2 => Self::Middle,
            3 => Self::Top,
            _ => Self::Baseline,
        }
    }

    pub fn to_dxf(self) -> i16 {
        match self {
            Self::Baseline => 0,
            Self::Bottom => 1,
            Self::Middle => 2,
            Self::Top => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextAnnotation {
    pub drawing_id: DrawingId,
    pub layer_id: LayerId,
    pub content: String,
    pub insert: Point3,
    pub height: f64,
    /// 旋转角，单位为度。
    pub rotation: f64,
    pub style: Option<StandardId>,
    pub horizontal: HorizontalJustification,
    pub vertical: VerticalJustification,
    /// 源实体为多行文字（MTEXT）。
    pub multiline: bool,
    pub crs: CoordinateReference,
    pub space: Space,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Linear,
    Aligned,
    Angular,
    Diameter,
    Radius,
    Angular3Point,
    Ordinate,
    Unknown(i16),
}

impl DimensionKind {
    pub fn from_flags(flags: i16) -> Self {
        match flags & 0x0F {
            0 => DimensionKind::Linear,
            1 => DimensionKind::Aligned,
            2 => DimensionKind::Angular,
            3 => DimensionKind::Diameter,
            4 => DimensionKind::Radius,
            5 => DimensionKind::Angular3Point,
            6 => DimensionKind::Ordinate,
            other => DimensionKind::Unknown(other),
        }
    }

    pub fn flags(self) -> i16 {
        match self {
            DimensionKind::Linear => 0,
            DimensionKind::Aligned => 1,
            DimensionKind::Angular => 2,
            DimensionKind::Diameter => 3,
            DimensionKind::Radius => 4,
            DimensionKind::Angular3Point => 5,
            DimensionKind::Ordinate => 6,
            DimensionKind::Unknown(code) => code,
        }
    }
}

/// 重绘标注所需的定义点。字段与 DXF 组码 10/11/13/14/15/16 对应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionGeometry {
    pub definition_point: Point3,
    pub text_position: Point3,
    pub first_point: Option<Point3>,
    pub second_point: Option<Point3>,
    pub arc_point: Option<Point3>,
    pub arc_location: Option<Point3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionAnnotation {
    pub drawing_id: DrawingId,
    pub layer_id: LayerId,
    pub style: StandardId,
    pub kind: DimensionKind,
    pub geometry: DimensionGeometry,
    pub text_override: Option<String>,
    pub measurement: Option<f64>,
    /// 度。
    pub rotation: f64,
    pub crs: CoordinateReference,
    pub space: Space,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HatchInstance {
    pub drawing_id: DrawingId,
    pub layer_id: LayerId,
    pub pattern: StandardId,
    /// 每个环首尾闭合。
    pub boundary: Vec<Vec<Point3>>,
    pub solid: bool,
    pub scale: f64,
    /// 度。
    pub angle: f64,
    pub crs: CoordinateReference,
    pub space: Space,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            z: 1.0,
        }
    }
}

/// 块参照。符号名在无标准定义时以自由文本保存。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolPlacement {
    pub drawing_id: DrawingId,
    pub layer_id: Option<LayerId>,
    pub name: String,
    pub symbol: Option<StandardId>,
    pub insert: Point3,
    pub scale: ScaleFactors,
    /// 度。
    pub rotation: f64,
    pub attributes: BTreeMap<String, String>,
    pub crs: CoordinateReference,
    pub space: Space,
    pub handle: Option<String>,
}

/// 图纸空间中指向模型空间的视口。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutViewport {
    pub drawing_id: DrawingId,
    pub boundary: Vec<Point3>,
    pub view_center: Point3,
    pub view_scale: f64,
    /// 度。
    pub twist: f64,
    pub frozen_layers: Vec<String>,
    pub crs: CoordinateReference,
    pub handle: Option<String>,
}

/// 标准库类别。除图层外都不区分图纸。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardCategory {
    Layer,
    LineStyle,
    TextStyle,
    FillPattern,
    DimensionStyle,
    Symbol,
}

impl StandardCategory {
    pub const ALL: [StandardCategory; 6] = [
        StandardCategory::Layer,
        StandardCategory::LineStyle,
        StandardCategory::TextStyle,
        StandardCategory::FillPattern,
        StandardCategory::DimensionStyle,
        StandardCategory::Symbol,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StandardCategory::Layer => "layer",
            StandardCategory::LineStyle => "line_style",
            StandardCategory::TextStyle => "text_style",
            StandardCategory::FillPattern => "fill_pattern",
            StandardCategory::DimensionStyle => "dimension_style",
            StandardCategory::Symbol => "symbol",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.as_str() == raw)
    }
}

impl fmt::Display for StandardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 符号定义中的成员图元，坐标相对块基点，不带参考系标签。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMember {
    pub kind: PrimitiveKind,
    pub shape: Shape,
    pub layer: String,
    pub color: Option<Color>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolDefinition {
    pub base_point: Option<Point3>,
    pub members: Vec<SymbolMember>,
    pub attribute_tags: Vec<String>,
}

/// 各类别标准条目的属性。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum StandardAttributes {
    Layer {
        color: Color,
        line_style: Option<String>,
        line_weight: LineWeight,
    },
    LineStyle {
        description: String,
        pattern: Vec<f64>,
    },
    TextStyle {
        font: String,
        height: f64,
        width_factor: f64,
    },
    FillPattern {
        solid: bool,
    },
    DimensionStyle {
        text_height: Option<f64>,
        arrow_size: Option<f64>,
    },
    Symbol(SymbolDefinition),
}

impl StandardAttributes {
    pub fn category(&self) -> StandardCategory {
        match self {
            StandardAttributes::Layer { .. } => StandardCategory::Layer,
            StandardAttributes::LineStyle { .. } => StandardCategory::LineStyle,
            StandardAttributes::TextStyle { .. } => StandardCategory::TextStyle,
            StandardAttributes::FillPattern { .. } => StandardCategory::FillPattern,
            StandardAttributes::DimensionStyle { .. } => StandardCategory::DimensionStyle,
            StandardAttributes::Symbol(_) => StandardCategory::Symbol,
        }
    }

    /// 某类别在没有任何提示时的缺省属性。
    pub fn default_for(category: StandardCategory) -> Self {
        match category {
            StandardCategory::Layer => StandardAttributes::Layer {
                color: Color::WHITE,
                line_style: None,
                line_weight: LineWeight::Standard,
            },
            StandardCategory::LineStyle => StandardAttributes::LineStyle {
                description: String::new(),
                pattern: Vec::new(),
            },
            StandardCategory::TextStyle => StandardAttributes::TextStyle {
                font: "txt".to_string(),
                height: 0.0,
                width_factor: 1.0,
            },
            StandardCategory::FillPattern => StandardAttributes::FillPattern { solid: false },
            StandardCategory::DimensionStyle => StandardAttributes::DimensionStyle {
                text_height: None,
                arrow_size: None,
            },
            StandardCategory::Symbol => StandardAttributes::Symbol(SymbolDefinition::default()),
        }
    }
}

/// 标准库条目，按 `(category, name)` 全局唯一。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardEntry {
    pub name: String,
    pub attributes: StandardAttributes,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

impl StandardEntry {
    pub fn new(name: impl Into<String>, attributes: StandardAttributes) -> Self {
        Self {
            name: name.into(),
            attributes,
            usage_count: 0,
            created_at: Utc::now(),
        }
    }

    #[inline]
    pub fn category(&self) -> StandardCategory {
        self.attributes.category()
    }
}

/// 导出任务状态，只能单调推进：pending → processing → completed | failed。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCounts {
    pub primitives: usize,
    pub text: usize,
    pub dimensions: usize,
    pub hatches: usize,
    pub symbols: usize,
    pub viewports: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub drawing_id: DrawingId,
    /// 请求的交换格式版本标签，例如 `R2018`。
    pub version: String,
    pub status: JobStatus,
    pub counts: ExportCounts,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn pending(drawing_id: DrawingId, version: impl Into<String>) -> Self {
        Self {
            drawing_id,
            version: version.into(),
            status: JobStatus::Pending,
            counts: ExportCounts::default(),
            warnings: Vec::new(),
            error: None,
            output: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// 单个图纸下各类记录数量，用于统计与回滚校验。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawingCounts {
    pub layers: usize,
    pub primitives: usize,
    pub text: usize,
    pub dimensions: usize,
    pub hatches: usize,
    pub placements: usize,
    pub viewports: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn dimension_flags_ignore_high_bits() {
        assert_eq!(DimensionKind::from_flags(32 | 1), DimensionKind::Aligned);
        assert_eq!(DimensionKind::from_flags(160 | 4), DimensionKind::Radius);
        assert_eq!(DimensionKind::Ordinate.flags(), 6);
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in StandardCategory::ALL {
            assert_eq!(StandardCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(
            StandardAttributes::default_for(StandardCategory::FillPattern).category(),
            StandardCategory::FillPattern
        );
    }

    #[test]
    fn shape_points_view() {
        let point = Shape::Point(Point3::planar(1.0, 2.0));
        assert_eq!(point.points().len(), 1);
        let ring = Shape::Ring(vec![Point3::origin(); 4]);
        assert!(ring.is_ring());
        assert_eq!(ring.points().len(), 4);
    }
}
