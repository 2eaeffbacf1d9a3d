use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 支持读写的交换格式版本。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DxfVersion {
    #[default]
    R12,
    R13,
    R14,
    R2000,
    R2004,
    R2007,
    R2010,
    R2013,
    R2018,
}

impl DxfVersion {
    pub const ALL: [DxfVersion; 9] = [
        DxfVersion::R12,
        DxfVersion::R13,
        DxfVersion::R14,
        DxfVersion::R2000,
        DxfVersion::R2004,
        DxfVersion::R2007,
        DxfVersion::R2010,
        DxfVersion::R2013,
        DxfVersion::R2018,
    ];

    /// `$ACADVER` 取值。
    pub fn acad_code(self) -> &'static str {
        match self {
            DxfVersion::R12 => "AC1009",
            DxfVersion::R13 => "AC1012",
            DxfVersion::R14 => "AC1014",
            DxfVersion::R2000 => "AC1015",
            DxfVersion::R2004 => "AC1018",
            DxfVersion::R2007 => "AC1021",
            DxfVersion::R2010 => "AC1024",
            DxfVersion::R2013 => "AC1027",
            DxfVersion::R2018 => "AC1032",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            DxfVersion::R12 => "R12",
            DxfVersion::R13 => "R13",
            DxfVersion::R14 => "R14",
            DxfVersion::R2000 => "R2000",
            DxfVersion::R2004 => "R2004",
            DxfVersion::R2007 => "R2007",
            DxfVersion::R2010 => "R2010",
            DxfVersion::R2013 => "R2013",
            DxfVersion::R2018 => "R2018",
        }
    }

    pub fn from_acad_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|version| version.acad_code().eq_ignore_ascii_case(code))
    }

    /// 子类标记（组码 100）与对象句柄从 R13 开始出现。
    #[inline]
    pub fn writes_subclass_markers(self) -> bool {
        self >= DxfVersion::R13
    }

    pub fn supports(self, feature: Feature) -> bool {
        match feature {
            Feature::LwPolyline => self >= DxfVersion::R14,
            Feature::Ellipse | Feature::Spline | Feature::MText | Feature::Hatch => {
                self >= DxfVersion::R13
            }
            Feature::LineWeight | Feature::ViewportFrozenLayers | Feature::Units => {
                self >= DxfVersion::R2000
            }
            Feature::TrueColor | Feature::Transparency => self >= DxfVersion::R2004,
        }
    }
}

impl fmt::Display for DxfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DxfVersion {
    type Err = String;

    /// 接受 `R2018`、`2018` 或 `AC1032` 三种写法。
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Some(version) = Self::from_acad_code(trimmed) {
            return Ok(version);
        }
        let normalized = trimmed.trim_start_matches(['R', 'r']);
        Self::ALL
            .into_iter()
            .find(|version| version.tag()[1..] == *normalized)
            .ok_or_else(|| format!("未知的交换格式版本 {trimmed}"))
    }
}

/// 随版本变化的功能点，用于导出时的降级判断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    LwPolyline,
    Ellipse,
    Spline,
    MText,
    Hatch,
    LineWeight,
    TrueColor,
    Transparency,
    ViewportFrozenLayers,
    Units,
}

impl Feature {
    pub fn describe(self) -> &'static str {
        match self {
            Feature::LwPolyline => "LWPOLYLINE",
            Feature::Ellipse => "ELLIPSE",
            Feature::Spline => "SPLINE",
            Feature::MText => "MTEXT",
            Feature::Hatch => "HATCH",
            Feature::LineWeight => "线宽（组码 370）",
            Feature::TrueColor => "真彩色（组码 420）",
            Feature::Transparency => "透明度（组码 440）",
            Feature::ViewportFrozenLayers => "视口冻结图层（组码 331）",
            Feature::Units => "$INSUNITS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_spellings() {
        assert_eq!("R2018".parse::<DxfVersion>(), Ok(DxfVersion::R2018));
        assert_eq!("2000".parse::<DxfVersion>(), Ok(DxfVersion::R2000));
        assert_eq!("AC1009".parse::<DxfVersion>(), Ok(DxfVersion::R12));
        assert!("R9".parse::<DxfVersion>().is_err());
    }

    #[test]
    fn feature_table() {
        assert!(!DxfVersion::R12.supports(Feature::LwPolyline));
        assert!(!DxfVersion::R12.supports(Feature::Hatch));
        assert!(DxfVersion::R2000.supports(Feature::LineWeight));
        assert!(!DxfVersion::R2000.supports(Feature::Transparency));
        assert!(DxfVersion::R2004.supports(Feature::TrueColor));
        assert!(DxfVersion::R2018.supports(Feature::ViewportFrozenLayers));
    }
}
