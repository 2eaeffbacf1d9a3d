use std::fmt;

use serde::{Deserialize, Serialize};

/// 坐标参考标签。核心只负责打标签，不做任何投影变换。
///
/// `Local` 表示"未标注/本地坐标"，在宿主未配置参考系时使用，
/// 不会被隐式替换为任何具体的参考系。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinateReference {
    #[default]
    Local,
    Tagged {
        /// 参考系标识，例如 `EPSG:2230`。
        code: String,
        /// 人类可读名称。
        name: String,
    },
}

impl CoordinateReference {
    pub fn tagged(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Tagged {
            code: code.into(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Tagged { code, .. } => Some(code),
        }
    }
}

impl fmt::Display for CoordinateReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Tagged { code, name } => write!(f, "{code} ({name})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_local() {
        let crs = CoordinateReference::default();
        assert!(crs.is_local());
        assert_eq!(crs.code(), None);
        assert_eq!(crs.to_string(), "local");
    }

    #[test]
    fn tagged_round_trips_through_json() {
        let crs = CoordinateReference::tagged("EPSG:2230", "NAD83 / California zone 6 (ftUS)");
        let json = serde_json::to_string(&crs).expect("serialize");
        let back: CoordinateReference = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, crs);
        assert_eq!(back.code(), Some("EPSG:2230"));
    }
}
