//! 几何转换：交换格式的坐标序列与规范化点序列互转，全部为纯函数。
//!
//! 圆、圆弧、椭圆按弦高容差选取角步长离散；样条按固定参数步长采样。
//! 导出时圆与圆弧由离散点反推回精确曲线，椭圆与样条以多段线写出。

use std::f64::consts::TAU;

use cadsync_core::geometry::{Point3, Vector3};
use cadsync_core::model::{PrimitiveKind, Shape};
use cadsync_io::{EntityData, HatchEdge, HatchLoop, PolylineVertex};
use glam::{DVec2, DVec3, DVec4};
use serde::{Deserialize, Serialize};

use crate::errors::GeometryError;

pub const MIN_SEGMENTS: usize = 8;
/// 单条曲线的分段上限，超出时报错而不放宽容差。
pub const MAX_SEGMENTS: usize = 1 << 20;
pub const DEFAULT_SPLINE_SAMPLES: usize = 64;

/// 判定两点重合的距离。
const COINCIDENT: f64 = 1e-9;
/// 圆/圆弧反推时允许的相对半径偏差。
const FIT_TOLERANCE: f64 = 1e-6;

/// 离散容差。弦高取 `min(absolute, relative * radius)`，
/// 没有半径信息时退化为 `absolute`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            absolute: 0.01,
            relative: 0.001,
        }
    }
}

impl Tolerance {
    pub fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    pub fn chord(&self, radius: Option<f64>) -> f64 {
        match radius {
            Some(radius) if radius.is_finite() && radius > 0.0 => {
                self.absolute.min(self.relative * radius)
            }
            _ => self.absolute,
        }
    }

    /// 在给定半径与扫掠角下满足弦高容差的分段数。
    /// 所需分段超过 [`MAX_SEGMENTS`] 时返回错误。
    pub fn segments(&self, radius: f64, sweep: f64) -> Result<usize, GeometryError> {
        let tolerance = self.chord(Some(radius));
        if !(tolerance > 0.0 && tolerance.is_finite()) {
            return Err(GeometryError::InvalidTolerance(tolerance));
        }
        if !(radius > 0.0) || tolerance >= radius {
            return Ok(MIN_SEGMENTS);
        }
        let step = 2.0 * (1.0 - tolerance / radius).acos();
        let needed = (sweep.abs() / step).ceil();
        if !(step > 0.0) || !needed.is_finite() || needed > MAX_SEGMENTS as f64 {
            return Err(GeometryError::TooManySegments {
                radius,
                tolerance,
                limit: MAX_SEGMENTS,
            });
        }
        Ok((needed as usize).max(MIN_SEGMENTS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionSettings {
    pub tolerance: Tolerance,
    pub spline_samples: usize,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::default(),
            spline_samples: DEFAULT_SPLINE_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPrimitive {
    pub kind: PrimitiveKind,
    pub shape: Shape,
}

/// 导出用的实体描述。`exact` 为假表示曲线以多段线近似写出。
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstructed {
    pub data: EntityData,
    pub exact: bool,
}

/// 交换格式图元转为规范化几何。非图元实体返回 [`GeometryError::NotAPrimitive`]。
pub fn to_normalized(
    data: &EntityData,
    settings: &ConversionSettings,
) -> Result<NormalizedPrimitive, GeometryError> {
    let tolerance = &settings.tolerance;
    let kind_name = data.type_name();
    let (kind, shape) = match data {
        EntityData::Line { start, end } => {
            if start.approx_eq(*end, COINCIDENT) {
                return Err(degenerate(kind_name, "起点与终点重合"));
            }
            (PrimitiveKind::Line, Shape::Path(vec![*start, *end]))
        }
        EntityData::Point { location } => (PrimitiveKind::Point, Shape::Point(*location)),
        EntityData::Circle { center, radius } => {
            positive_radius(kind_name, *radius)?;
            (
                PrimitiveKind::Circle,
                Shape::Ring(circle_ring(*center, *radius, tolerance)?),
            )
        }
        EntityData::Arc {
            center,
            radius,
            start_angle,
            end_angle,
        } => {
            positive_radius(kind_name, *radius)?;
            let start = start_angle.to_radians();
            let sweep = ccw_sweep(start, end_angle.to_radians());
            (
                PrimitiveKind::Arc,
                Shape::Path(arc_points(*center, *radius, start, sweep, tolerance)?),
            )
        }
        EntityData::Ellipse {
            center,
            major_axis,
            ratio,
            start_parameter,
            end_parameter,
        } => {
            if major_axis.length() <= COINCIDENT || !(*ratio > 0.0) {
                return Err(degenerate(kind_name, "主轴长度或轴比为零"));
            }
            let (points, full) = ellipse_points(
                *center,
                *major_axis,
                *ratio,
                *start_parameter,
                *end_parameter,
                tolerance,
            )?;
            let shape = if full {
                Shape::Ring(points)
            } else {
                Shape::Path(points)
            };
            (PrimitiveKind::Ellipse, shape)
        }
        EntityData::LwPolyline { vertices, closed }
        | EntityData::Polyline {
            vertices, closed, ..
        } => {
            if vertices.len() < 2 {
                return Err(degenerate(kind_name, "顶点少于两个"));
            }
            let points = polyline_points(vertices, *closed, tolerance)?;
            let shape = if *closed {
                Shape::Ring(close_ring(&points)?.0)
            } else {
                Shape::Path(points)
            };
            (PrimitiveKind::Polyline, shape)
        }
        EntityData::Spline {
            degree,
            closed,
            knots,
            weights,
            control_points,
            fit_points,
        } => {
            let degree = usize::try_from(*degree).unwrap_or(0);
            let points = if degree >= 1 && control_points.len() > degree {
                spline_points(
                    degree,
                    control_points,
                    knots,
                    weights,
                    settings.spline_samples,
                )?
            } else if fit_points.len() >= 2 {
                fit_points.clone()
            } else {
                return Err(degenerate(kind_name, "控制点不足"));
            };
            let shape = if *closed {
                Shape::Ring(close_ring(&points)?.0)
            } else {
                Shape::Path(points)
            };
            (PrimitiveKind::Spline, shape)
        }
        other => return Err(GeometryError::NotAPrimitive(other.type_name())),
    };
    if shape.points().iter().any(|point| !point.is_finite()) {
        return Err(GeometryError::NonFinite { kind: kind_name });
    }
    Ok(NormalizedPrimitive { kind, shape })
}

/// 规范化几何还原为导出实体。圆、圆弧尝试精确反推，失败时退回多段线。
pub fn from_normalized(kind: PrimitiveKind, shape: &Shape) -> Result<Reconstructed, GeometryError> {
    if let Shape::Point(location) = shape {
        return Ok(Reconstructed {
            data: EntityData::Point {
                location: *location,
            },
            exact: true,
        });
    }
    let points = shape.points();
    if points.len() < 2 {
        return Err(degenerate(kind.as_str(), "点序列为空"));
    }
    if points.iter().any(|point| !point.is_finite()) {
        return Err(GeometryError::NonFinite {
            kind: kind.as_str(),
        });
    }
    let exact = match (kind, shape) {
        (PrimitiveKind::Line, Shape::Path(_)) if points.len() == 2 => Some(EntityData::Line {
            start: points[0],
            end: points[1],
        }),
        (PrimitiveKind::Circle, Shape::Ring(_)) => fit_circle(&points[..points.len() - 1])
            .map(|(center, radius)| EntityData::Circle { center, radius }),
        (PrimitiveKind::Arc, Shape::Path(_)) => fit_arc(points),
        _ => None,
    };
    Ok(match exact {
        Some(data) => Reconstructed { data, exact: true },
        None => Reconstructed {
            data: polyline_entity(shape),
            exact: !kind.is_discretized_curve(),
        },
    })
}

/// 按弦高容差离散圆弧，`sweep` 为带符号弧度（正值逆时针）。首尾点都包含在内。
pub fn arc_points(
    center: Point3,
    radius: f64,
    start: f64,
    sweep: f64,
    tolerance: &Tolerance,
) -> Result<Vec<Point3>, GeometryError> {
    let segments = tolerance.segments(radius, sweep)?;
    Ok((0..=segments)
        .map(|step| {
            let angle = start + sweep * step as f64 / segments as f64;
            Point3::new(
                center.x() + radius * angle.cos(),
                center.y() + radius * angle.sin(),
                center.z(),
            )
        })
        .collect())
}

pub fn circle_ring(
    center: Point3,
    radius: f64,
    tolerance: &Tolerance,
) -> Result<Vec<Point3>, GeometryError> {
    let mut ring = arc_points(center, radius, 0.0, TAU, tolerance)?;
    close_exactly(&mut ring);
    Ok(ring)
}

/// 椭圆（或椭圆弧）离散，参数为弧度。返回值第二项表示是否为整椭圆。
pub fn ellipse_points(
    center: Point3,
    major_axis: Vector3,
    ratio: f64,
    start: f64,
    end: f64,
    tolerance: &Tolerance,
) -> Result<(Vec<Point3>, bool), GeometryError> {
    let major = major_axis.as_vec3();
    let minor = DVec3::new(-major.y, major.x, 0.0) * ratio;
    let sweep = ccw_sweep(start, end);
    let full = sweep >= TAU - COINCIDENT;
    let segments = tolerance.segments(major.length(), sweep)?;
    let mut points: Vec<Point3> = (0..=segments)
        .map(|step| {
            let t = start + sweep * step as f64 / segments as f64;
            Point3::from(center.as_vec3() + major * t.cos() + minor * t.sin())
        })
        .collect();
    if full {
        close_exactly(&mut points);
    }
    Ok((points, full))
}

/// 带 bulge 的一段：返回不含起点、含终点的点序列。
/// 包角为 `4·atan(bulge)`，正值逆时针。
pub fn bulge_points(
    start: Point3,
    end: Point3,
    bulge: f64,
    tolerance: &Tolerance,
) -> Result<Vec<Point3>, GeometryError> {
    let from = start.xy().as_vec2();
    let to = end.xy().as_vec2();
    let chord = to - from;
    let length = chord.length();
    if bulge.abs() < COINCIDENT || length < COINCIDENT {
        return Ok(vec![end]);
    }
    let included = 4.0 * bulge.atan();
    let radius = length / (2.0 * (included / 2.0).sin().abs());
    let normal = DVec2::new(-chord.y, chord.x) / length;
    let offset = (1.0 - bulge * bulge) / (2.0 * bulge) * (length / 2.0);
    let center = (from + to) * 0.5 + normal * offset;
    let radial = from - center;
    let mut points = arc_points(
        Point3::new(center.x, center.y, start.z()),
        radius,
        radial.y.atan2(radial.x),
        included,
        tolerance,
    )?;
    points.remove(0);
    if let Some(last) = points.last_mut() {
        *last = end;
    }
    Ok(points)
}

/// 展开多段线顶点。闭合时补上末顶点回到首顶点的一段。
pub fn polyline_points(
    vertices: &[PolylineVertex],
    closed: bool,
    tolerance: &Tolerance,
) -> Result<Vec<Point3>, GeometryError> {
    let Some(first) = vertices.first() else {
        return Ok(Vec::new());
    };
    let mut points = vec![first.position];
    let segments = if closed {
        vertices.len()
    } else {
        vertices.len() - 1
    };
    for index in 0..segments {
        let from = vertices[index];
        let to = vertices[(index + 1) % vertices.len()];
        points.extend(bulge_points(
            from.position,
            to.position,
            from.bulge,
            tolerance,
        )?);
    }
    Ok(points)
}

/// 有理 B 样条按固定参数步长采样。节点向量无效时改用夹持均匀节点，
/// 权重缺失或非正时按非有理处理。
pub fn spline_points(
    degree: usize,
    control_points: &[Point3],
    knots: &[f64],
    weights: &[f64],
    samples: usize,
) -> Result<Vec<Point3>, GeometryError> {
    let count = control_points.len();
    if degree == 0 || count <= degree {
        return Err(degenerate("SPLINE", "控制点数不大于阶数"));
    }
    let knots = if valid_knots(knots, count, degree) {
        knots.to_vec()
    } else {
        clamped_uniform_knots(count, degree)
    };
    let rational = weights.len() == count && weights.iter().all(|weight| *weight > 0.0);
    let homogeneous: Vec<DVec4> = control_points
        .iter()
        .enumerate()
        .map(|(index, point)| {
            let weight = if rational { weights[index] } else { 1.0 };
            (point.as_vec3() * weight).extend(weight)
        })
        .collect();
    let (t0, t1) = (knots[degree], knots[count]);
    if !(t1 > t0) {
        return Err(degenerate("SPLINE", "参数区间为空"));
    }
    let samples = samples.max(2);
    Ok((0..=samples)
        .map(|step| {
            let t = t0 + (t1 - t0) * step as f64 / samples as f64;
            let point = de_boor(t, degree, &knots, &homogeneous);
            Point3::from(point.truncate() / point.w)
        })
        .collect())
}

fn valid_knots(knots: &[f64], count: usize, degree: usize) -> bool {
    knots.len() == count + degree + 1
        && knots.iter().all(|knot| knot.is_finite())
        && knots.windows(2).all(|pair| pair[0] <= pair[1])
}

fn clamped_uniform_knots(count: usize, degree: usize) -> Vec<f64> {
    let spans = (count - degree) as f64;
    (0..count + degree + 1)
        .map(|index| {
            if index <= degree {
                0.0
            } else if index >= count {
                spans
            } else {
                (index - degree) as f64
            }
        })
        .collect()
}

fn de_boor(t: f64, degree: usize, knots: &[f64], homogeneous: &[DVec4]) -> DVec4 {
    let mut span = degree;
    while span + 1 < homogeneous.len() && knots[span + 1] <= t {
        span += 1;
    }
    let mut local: Vec<DVec4> = (0..=degree)
        .map(|j| homogeneous[j + span - degree])
        .collect();
    for r in 1..=degree {
        for j in (r..=degree).rev() {
            let i = j + span - degree;
            let denominator = knots[i + degree + 1 - r] - knots[i];
            let alpha = if denominator.abs() < f64::EPSILON {
                0.0
            } else {
                (t - knots[i]) / denominator
            };
            local[j] = local[j - 1] * (1.0 - alpha) + local[j] * alpha;
        }
    }
    local[degree]
}

/// 将填充边界环展开为点序列。第二项表示源数据是否显式闭合。
pub fn hatch_loop_points(
    boundary: &HatchLoop,
    elevation: f64,
    settings: &ConversionSettings,
) -> Result<(Vec<Point3>, bool), GeometryError> {
    let tolerance = &settings.tolerance;
    let mut points: Vec<Point3> = Vec::new();
    let mut explicit = false;
    for edge in &boundary.edges {
        let sampled = match edge {
            HatchEdge::Polyline { vertices, closed } => {
                explicit |= *closed;
                polyline_points(vertices, *closed, tolerance)?
            }
            HatchEdge::Line { start, end } => vec![*start, *end],
            HatchEdge::Arc {
                center,
                radius,
                start_angle,
                end_angle,
                counter_clockwise,
            } => {
                positive_radius("HATCH", *radius)?;
                let start = start_angle.to_radians();
                let sweep = ccw_sweep(start, end_angle.to_radians());
                orient(
                    arc_points(*center, *radius, start, sweep, tolerance)?,
                    *center,
                    *counter_clockwise,
                )
            }
            HatchEdge::Ellipse {
                center,
                major_axis,
                ratio,
                start_angle,
                end_angle,
                counter_clockwise,
            } => {
                let (sampled, _) = ellipse_points(
                    *center,
                    *major_axis,
                    *ratio,
                    start_angle.to_radians(),
                    end_angle.to_radians(),
                    tolerance,
                )?;
                orient(sampled, *center, *counter_clockwise)
            }
            HatchEdge::Spline {
                degree,
                knots,
                control_points,
                weights,
            } => spline_points(
                usize::try_from(*degree).unwrap_or(0),
                control_points,
                knots,
                weights,
                settings.spline_samples,
            )?,
        };
        for point in sampled {
            let point = Point3::new(point.x(), point.y(), elevation);
            if points
                .last()
                .is_none_or(|last| !last.approx_eq(point, COINCIDENT))
            {
                points.push(point);
            }
        }
    }
    if points.iter().any(|point| !point.is_finite()) {
        return Err(GeometryError::NonFinite { kind: "HATCH" });
    }
    Ok((points, explicit))
}

/// 整理为闭合环：去掉相邻重复点，未闭合时追加首点。
/// 返回值第二项表示是否发生了自动闭合。不同点少于三个时报错。
pub fn close_ring(points: &[Point3]) -> Result<(Vec<Point3>, bool), GeometryError> {
    let distinct = distinct_count(points, 3);
    if distinct < 3 {
        return Err(GeometryError::TooFewRingPoints { distinct });
    }
    let mut ring: Vec<Point3> = Vec::with_capacity(points.len() + 1);
    for point in points {
        if ring
            .last()
            .is_none_or(|last| !last.approx_eq(*point, COINCIDENT))
        {
            ring.push(*point);
        }
    }
    let first = ring[0];
    let last = ring[ring.len() - 1];
    if first.approx_eq(last, COINCIDENT) {
        close_exactly(&mut ring);
        Ok((ring, false))
    } else {
        ring.push(first);
        Ok((ring, true))
    }
}

fn distinct_count(points: &[Point3], limit: usize) -> usize {
    let mut seen: Vec<Point3> = Vec::with_capacity(limit);
    for point in points {
        if !seen.iter().any(|known| known.approx_eq(*point, COINCIDENT)) {
            seen.push(*point);
            if seen.len() >= limit {
                break;
            }
        }
    }
    seen.len()
}

fn fit_circle(points: &[Point3]) -> Option<(Point3, f64)> {
    if points.len() < 3 || !is_planar(points) {
        return None;
    }
    let sum = points
        .iter()
        .fold(DVec3::ZERO, |acc, point| acc + point.as_vec3());
    let center = Point3::from(sum / points.len() as f64);
    let radius =
        points.iter().map(|point| point.distance(center)).sum::<f64>() / points.len() as f64;
    within_fit(points, center, radius).then_some((center, radius))
}

fn fit_arc(points: &[Point3]) -> Option<EntityData> {
    if points.len() < 3 || !is_planar(points) {
        return None;
    }
    let first = points[0];
    let middle = points[points.len() / 2];
    let last = points[points.len() - 1];
    let center = circumcenter(first.xy().as_vec2(), middle.xy().as_vec2(), last.xy().as_vec2())?;
    let center = Point3::new(center.x, center.y, first.z());
    let radius = first.distance(center);
    if !within_fit(points, center, radius) {
        return None;
    }
    let a = middle.xy().as_vec2() - first.xy().as_vec2();
    let b = last.xy().as_vec2() - first.xy().as_vec2();
    let counter_clockwise = a.perp_dot(b) > 0.0;
    let angle_of = |point: Point3| {
        let radial = point.xy().as_vec2() - center.xy().as_vec2();
        radial.y.atan2(radial.x).to_degrees().rem_euclid(360.0)
    };
    let (start_angle, end_angle) = if counter_clockwise {
        (angle_of(first), angle_of(last))
    } else {
        (angle_of(last), angle_of(first))
    };
    Some(EntityData::Arc {
        center,
        radius,
        start_angle,
        end_angle,
    })
}

fn circumcenter(a: DVec2, b: DVec2, c: DVec2) -> Option<DVec2> {
    let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
    if d.abs() < COINCIDENT {
        return None;
    }
    let (a2, b2, c2) = (a.length_squared(), b.length_squared(), c.length_squared());
    Some(DVec2::new(
        (a2 * (b.y - c.y) + b2 * (c.y - a.y) + c2 * (a.y - b.y)) / d,
        (a2 * (c.x - b.x) + b2 * (a.x - c.x) + c2 * (b.x - a.x)) / d,
    ))
}

fn within_fit(points: &[Point3], center: Point3, radius: f64) -> bool {
    radius > COINCIDENT
        && points
            .iter()
            .all(|point| (point.distance(center) - radius).abs() <= FIT_TOLERANCE * radius.max(1.0))
}

fn is_planar(points: &[Point3]) -> bool {
    let z = points[0].z();
    points.iter().all(|point| (point.z() - z).abs() <= COINCIDENT)
}

fn polyline_entity(shape: &Shape) -> EntityData {
    let closed = shape.is_ring();
    let mut points = shape.points().to_vec();
    if closed {
        points.pop();
    }
    let planar = is_planar(&points);
    let vertices = points.into_iter().map(PolylineVertex::new).collect();
    if planar {
        EntityData::LwPolyline { vertices, closed }
    } else {
        EntityData::Polyline {
            vertices,
            closed,
            is_3d: true,
        }
    }
}

/// 逆时针扫掠角，落在 `(0, 2π]`。
fn ccw_sweep(start: f64, end: f64) -> f64 {
    let sweep = (end - start).rem_euclid(TAU);
    if sweep <= COINCIDENT { TAU } else { sweep }
}

/// 顺时针边界边以镜像角度存储，按圆心水平镜像还原。
fn orient(points: Vec<Point3>, center: Point3, counter_clockwise: bool) -> Vec<Point3> {
    if counter_clockwise {
        return points;
    }
    points
        .into_iter()
        .map(|point| Point3::new(point.x(), 2.0 * center.y() - point.y(), point.z()))
        .collect()
}

fn close_exactly(points: &mut [Point3]) {
    if let [first, .., last] = points {
        *last = *first;
    }
}

fn positive_radius(kind: &'static str, radius: f64) -> Result<(), GeometryError> {
    if radius.is_finite() && radius > 0.0 {
        Ok(())
    } else {
        Err(degenerate(kind, "半径必须为正"))
    }
}

fn degenerate(kind: &'static str, reason: &str) -> GeometryError {
    GeometryError::Degenerate {
        kind,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_chord_deviation(points: &[Point3], center: Point3, radius: f64) -> f64 {
        points
            .windows(2)
            .map(|pair| {
                let mid = Point3::from((pair[0].as_vec3() + pair[1].as_vec3()) * 0.5);
                (radius - mid.distance(center)).abs()
            })
            .fold(0.0, f64::max)
    }

    #[test]
    fn chord_tolerance_does_not_loosen_with_radius() {
        let tolerance = Tolerance::default();
        assert!((tolerance.chord(Some(1.0)) - 0.001).abs() < 1e-12);
        assert!((tolerance.chord(Some(10.0)) - 0.01).abs() < 1e-12);
        assert!((tolerance.chord(Some(10_000.0)) - 0.01).abs() < 1e-12);
        assert!((tolerance.chord(None) - 0.01).abs() < 1e-12);

        // 投影坐标按毫米计时半径可达千万量级
        for radius in [0.5, 10.0, 1_000.0, 50_000.0, 1.0e7] {
            let ring = circle_ring(Point3::origin(), radius, &tolerance).expect("离散失败");
            let deviation = max_chord_deviation(&ring, Point3::origin(), radius);
            assert!(
                deviation <= tolerance.chord(Some(radius)) + 1e-7,
                "r={radius}: {deviation}"
            );
        }
    }

    #[test]
    fn segment_limit_is_an_error_not_a_looser_ring() {
        let err = circle_ring(Point3::origin(), 1.0e13, &Tolerance::default())
            .expect_err("超出分段上限应当报错");
        assert!(
            matches!(err, GeometryError::TooManySegments { limit, .. } if limit == MAX_SEGMENTS),
            "{err:?}"
        );

        let err = arc_points(Point3::origin(), 5.0, 0.0, TAU, &Tolerance::new(0.0, 0.001))
            .expect_err("零容差应当报错");
        assert_eq!(err, GeometryError::InvalidTolerance(0.0));
    }

    #[test]
    fn circle_becomes_closed_ring() {
        let settings = ConversionSettings::default();
        let normalized = to_normalized(
            &EntityData::Circle {
                center: Point3::planar(5.0, 5.0),
                radius: 10.0,
            },
            &settings,
        )
        .expect("圆转换失败");
        assert_eq!(normalized.kind, PrimitiveKind::Circle);
        let Shape::Ring(points) = &normalized.shape else {
            panic!("圆应转换为闭合环");
        };
        assert_eq!(points.first(), points.last());
        assert!(points.len() > MIN_SEGMENTS);
        assert!(points.iter().all(|point| point.z() == 0.0));
    }

    #[test]
    fn bulge_of_one_is_a_semicircle() {
        let tolerance = Tolerance::default();
        let points = bulge_points(
            Point3::planar(0.0, 0.0),
            Point3::planar(2.0, 0.0),
            1.0,
            &tolerance,
        )
        .expect("离散失败");
        assert_eq!(points.last(), Some(&Point3::planar(2.0, 0.0)));
        let center = Point3::planar(1.0, 0.0);
        assert!(points.iter().all(|p| (p.distance(center) - 1.0).abs() < 1e-9));
        // 正 bulge 逆时针：由 (0,0) 到 (2,0) 经过下半圆
        assert!(points[points.len() / 2].y() < -0.9);
    }

    #[test]
    fn closed_polyline_with_bulges_stays_closed() {
        let vertices = vec![
            PolylineVertex::with_bulge(Point3::planar(0.0, 0.0), 0.5),
            PolylineVertex::new(Point3::planar(10.0, 0.0)),
            PolylineVertex::new(Point3::planar(10.0, 10.0)),
        ];
        let normalized = to_normalized(
            &EntityData::LwPolyline {
                vertices,
                closed: true,
            },
            &ConversionSettings::default(),
        )
        .expect("多段线转换失败");
        let Shape::Ring(points) = normalized.shape else {
            panic!("闭合多段线应为环");
        };
        assert_eq!(points.first(), points.last());
        assert!(points.len() > 4);
    }

    #[test]
    fn ring_closure_appends_first_point() {
        let open = [
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(10.0, 5.0),
        ];
        let (ring, auto_closed) = close_ring(&open).expect("三个点可以成环");
        assert!(auto_closed);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[3], ring[0]);

        let (again, auto_closed) = close_ring(&ring).expect("已闭合");
        assert!(!auto_closed);
        assert_eq!(again, ring);
    }

    #[test]
    fn ring_needs_three_distinct_points() {
        let a = Point3::planar(0.0, 0.0);
        let b = Point3::planar(1.0, 0.0);
        assert_eq!(
            close_ring(&[a, b, a, b]),
            Err(GeometryError::TooFewRingPoints { distinct: 2 })
        );
        assert_eq!(
            close_ring(&[]),
            Err(GeometryError::TooFewRingPoints { distinct: 0 })
        );
    }

    #[test]
    fn clamped_spline_hits_end_points() {
        let control = [
            Point3::planar(0.0, 0.0),
            Point3::planar(1.0, 2.0),
            Point3::planar(3.0, 2.0),
            Point3::planar(4.0, 0.0),
        ];
        let points = spline_points(3, &control, &[], &[], 16).expect("样条采样失败");
        assert_eq!(points.len(), 17);
        assert!(points[0].approx_eq(control[0], 1e-9));
        assert!(points[16].approx_eq(control[3], 1e-9));
        // 对称控制多边形，中点落在 x = 2
        assert!((points[8].x() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rational_quadratic_spline_traces_a_quarter_circle() {
        let control = [
            Point3::planar(1.0, 0.0),
            Point3::planar(1.0, 1.0),
            Point3::planar(0.0, 1.0),
        ];
        let weights = [1.0, std::f64::consts::FRAC_1_SQRT_2, 1.0];
        let knots = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let points = spline_points(2, &control, &knots, &weights, 32).expect("样条采样失败");
        for point in points {
            assert!((point.distance(Point3::origin()) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn circle_and_arc_are_reconstructed_exactly() {
        let settings = ConversionSettings::default();
        let circle = to_normalized(
            &EntityData::Circle {
                center: Point3::planar(3.0, -2.0),
                radius: 7.5,
            },
            &settings,
        )
        .expect("圆转换失败");
        let rebuilt = from_normalized(circle.kind, &circle.shape).expect("还原失败");
        assert!(rebuilt.exact);
        let EntityData::Circle { center, radius } = rebuilt.data else {
            panic!("应还原为圆");
        };
        assert!(center.approx_eq(Point3::planar(3.0, -2.0), 1e-9));
        assert!((radius - 7.5).abs() < 1e-9);

        let arc = to_normalized(
            &EntityData::Arc {
                center: Point3::origin(),
                radius: 4.0,
                start_angle: 300.0,
                end_angle: 45.0,
            },
            &settings,
        )
        .expect("圆弧转换失败");
        let rebuilt = from_normalized(arc.kind, &arc.shape).expect("还原失败");
        let EntityData::Arc {
            radius,
            start_angle,
            end_angle,
            ..
        } = rebuilt.data
        else {
            panic!("应还原为圆弧");
        };
        assert!((radius - 4.0).abs() < 1e-9);
        assert!((start_angle - 300.0).abs() < 1e-6);
        assert!((end_angle - 45.0).abs() < 1e-6);
    }

    #[test]
    fn ellipse_exports_as_polyline() {
        let settings = ConversionSettings::default();
        let ellipse = to_normalized(
            &EntityData::Ellipse {
                center: Point3::origin(),
                major_axis: Vector3::new(5.0, 0.0, 0.0),
                ratio: 0.5,
                start_parameter: 0.0,
                end_parameter: TAU,
            },
            &settings,
        )
        .expect("椭圆转换失败");
        assert!(ellipse.shape.is_ring());
        let rebuilt = from_normalized(ellipse.kind, &ellipse.shape).expect("还原失败");
        assert!(!rebuilt.exact);
        assert!(matches!(
            rebuilt.data,
            EntityData::LwPolyline { closed: true, .. }
        ));
    }

    #[test]
    fn non_primitives_and_degenerates_are_rejected() {
        let settings = ConversionSettings::default();
        let text = EntityData::Text {
            insert: Point3::origin(),
            alignment_point: None,
            height: 1.0,
            content: "A".to_string(),
            rotation: 0.0,
            style: None,
            horizontal: 0,
            vertical: 0,
        };
        assert_eq!(
            to_normalized(&text, &settings),
            Err(GeometryError::NotAPrimitive("TEXT"))
        );
        let circle = EntityData::Circle {
            center: Point3::origin(),
            radius: 0.0,
        };
        assert!(matches!(
            to_normalized(&circle, &settings),
            Err(GeometryError::Degenerate { kind: "CIRCLE", .. })
        ));
        assert!(from_normalized(PrimitiveKind::Polyline, &Shape::Path(Vec::new())).is_err());
    }

    #[test]
    fn clockwise_hatch_arc_is_mirrored() {
        let boundary = HatchLoop {
            flags: 0,
            edges: vec![
                HatchEdge::Line {
                    start: Point3::planar(-1.0, 0.0),
                    end: Point3::planar(1.0, 0.0),
                },
                HatchEdge::Arc {
                    center: Point3::origin(),
                    radius: 1.0,
                    start_angle: 0.0,
                    end_angle: 180.0,
                    counter_clockwise: false,
                },
            ],
        };
        let (points, explicit) =
            hatch_loop_points(&boundary, 2.0, &ConversionSettings::default()).expect("展开失败");
        assert!(!explicit);
        assert!(points.iter().all(|point| point.y() <= 1e-9 && point.z() == 2.0));
        // 边首尾相接，不需要自动闭合
        let (ring, auto_closed) = close_ring(&points).expect("成环失败");
        assert!(!auto_closed);
        assert_eq!(ring.first(), ring.last());
    }
}
