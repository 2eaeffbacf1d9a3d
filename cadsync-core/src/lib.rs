//! 交换文件入库/导出核心的基础类型：几何值、坐标参考标签、样式与记录模型。

pub mod crs;
pub mod model;
pub mod style;

pub mod geometry {
    use glam::{DVec2, DVec3};
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示，主要用于 bulge 与平面拟合计算。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        /// 提升为三维点，高程取给定值。
        #[inline]
        pub fn with_z(self, z: f64) -> Point3 {
            Point3::new(self.0.x, self.0.y, z)
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 三维点。规范化几何一律使用三分量存储，平面数据的 Z 取 `0.0`。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point3(pub DVec3);

    impl Point3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        /// 仅有两个分量的源坐标，高程补 `0.0`。
        #[inline]
        pub fn planar(x: f64, y: f64) -> Self {
            Self(DVec3::new(x, y, 0.0))
        }

        #[inline]
        pub fn origin() -> Self {
            Self(DVec3::ZERO)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        #[inline]
        pub fn xy(self) -> Point2 {
            Point2::new(self.0.x, self.0.y)
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn distance(self, other: Point3) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn translate(self, offset: Vector3) -> Self {
            Self(self.0 + offset.0)
        }

        /// 在给定容差内判断两点重合。
        #[inline]
        pub fn approx_eq(self, other: Point3, epsilon: f64) -> bool {
            self.distance(other) <= epsilon
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }
    }

    impl From<DVec3> for Point3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 三维向量，用于椭圆主轴、法向等。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector3(pub DVec3);

    impl Vector3 {
        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn scale(self, factor: f64) -> Self {
            Self(self.0 * factor)
        }

        #[inline]
        pub fn normalize(self) -> Option<Self> {
            let len = self.0.length();
            if len <= f64::EPSILON {
                None
            } else {
                Some(Self(self.0 / len))
            }
        }

        #[inline]
        pub fn cross(self, other: Vector3) -> Vector3 {
            Self(self.0.cross(other.0))
        }
    }

    impl From<DVec3> for Vector3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框，视口边界回写为中心点 + 宽高时使用。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            self.min = Point2(self.min.as_vec2().min(point.as_vec2()));
            self.max = Point2(self.max.as_vec2().max(point.as_vec2()));
        }

        pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3>) -> Self {
            let mut bounds = Self::empty();
            for point in points {
                bounds.include_point(point.xy());
            }
            bounds
        }

        #[inline]
        pub fn width(&self) -> f64 {
            self.max.x() - self.min.x()
        }

        #[inline]
        pub fn height(&self) -> f64 {
            self.max.y() - self.min.y()
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            Point2((self.min.as_vec2() + self.max.as_vec2()) * 0.5)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn planar_point_defaults_elevation_to_zero() {
            let point = Point3::planar(3.0, 4.0);
            assert_eq!(point.z(), 0.0);
            assert!(!point.z().is_nan());
        }

        #[test]
        fn bounds_center_and_extent() {
            let points = [
                Point3::planar(0.0, 0.0),
                Point3::planar(10.0, 0.0),
                Point3::planar(10.0, 5.0),
            ];
            let bounds = Bounds2D::from_points(points.iter());
            assert!((bounds.width() - 10.0).abs() < 1e-12);
            assert!((bounds.height() - 5.0).abs() < 1e-12);
            let center = bounds.center();
            assert!((center.x() - 5.0).abs() < 1e-12);
            assert!((center.y() - 2.5).abs() < 1e-12);
        }
    }
}
