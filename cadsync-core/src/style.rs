use serde::{Deserialize, Serialize};

/// 颜色：随层、随块、ACI 索引色或 24 位真彩色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Color {
    ByLayer,
    ByBlock,
    Index(u8),
    Rgb(u32),
}

/// ACI 1-9 的标准调色板，用于真彩色降级。
const ACI_PALETTE: [(u8, (u8, u8, u8)); 9] = [
    (1, (255, 0, 0)),
    (2, (255, 255, 0)),
    (3, (0, 255, 0)),
    (4, (0, 255, 255)),
    (5, (0, 0, 255)),
    (6, (255, 0, 255)),
    (7, (255, 255, 255)),
    (8, (65, 65, 65)),
    (9, (128, 128, 128)),
];

impl Color {
    pub const RED: Color = Color::Index(1);
    pub const WHITE: Color = Color::Index(7);

    /// 由组码 62（ACI）与 420（真彩色）组合得到颜色，真彩色优先。
    /// 图层上的负 ACI 表示图层关闭，这里只取其绝对值。
    pub fn from_dxf(aci: Option<i16>, true_color: Option<u32>) -> Option<Color> {
        if let Some(rgb) = true_color {
            return Some(Color::Rgb(rgb & 0x00FF_FFFF));
        }
        match aci? {
            256 => Some(Color::ByLayer),
            0 => Some(Color::ByBlock),
            value => {
                let index = value.unsigned_abs();
                if (1..=255).contains(&index) {
                    Some(Color::Index(index as u8))
                } else {
                    None
                }
            }
        }
    }

    /// 组码 62 的取值；真彩色退化为最接近的 ACI。
    pub fn aci(self) -> i16 {
        match self {
            Color::ByLayer => 256,
            Color::ByBlock => 0,
            Color::Index(index) => i16::from(index),
            Color::Rgb(rgb) => i16::from(nearest_aci(rgb)),
        }
    }

    #[inline]
    pub fn true_color(self) -> Option<u32> {
        match self {
            Color::Rgb(rgb) => Some(rgb),
            _ => None,
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

fn nearest_aci(rgb: u32) -> u8 {
    let r = ((rgb >> 16) & 0xFF) as i32;
    let g = ((rgb >> 8) & 0xFF) as i32;
    let b = (rgb & 0xFF) as i32;
    ACI_PALETTE
        .iter()
        .min_by_key(|(_, (pr, pg, pb))| {
            let dr = r - i32::from(*pr);
            let dg = g - i32::from(*pg);
            let db = b - i32::from(*pb);
            dr * dr + dg * dg + db * db
        })
        .map(|(index, _)| *index)
        .unwrap_or(7)
}

/// 线宽（组码 370），具体值以 0.01mm 为单位。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LineWeight {
    #[default]
    ByLayer,
    ByBlock,
    Standard,
    Hundredths(i16),
}

impl LineWeight {
    pub fn from_dxf(raw: i16) -> LineWeight {
        match raw {
            -1 => LineWeight::ByLayer,
            -2 => LineWeight::ByBlock,
            -3 => LineWeight::Standard,
            value => LineWeight::Hundredths(value.max(0)),
        }
    }

    pub fn to_dxf(self) -> i16 {
        match self {
            LineWeight::ByLayer => -1,
            LineWeight::ByBlock => -2,
            LineWeight::Standard => -3,
            LineWeight::Hundredths(value) => value,
        }
    }
}

/// 透明度（组码 440）。只保存 alpha，255 表示完全不透明。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transparency {
    pub alpha: u8,
}

impl Transparency {
    const ALPHA_FLAG: i32 = 0x0200_0000;

    /// 0x01000000 表示随块，此处不作为覆盖值保留。
    pub fn from_dxf(raw: i32) -> Option<Transparency> {
        if raw & Self::ALPHA_FLAG != 0 {
            Some(Transparency {
                alpha: (raw & 0xFF) as u8,
            })
        } else {
            None
        }
    }

    pub fn to_dxf(self) -> i32 {
        Self::ALPHA_FLAG | i32::from(self.alpha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn true_color_wins_over_aci() {
        let color = Color::from_dxf(Some(1), Some(0x00_12_34_56)).expect("color");
        assert_eq!(color, Color::Rgb(0x123456));
    }

    #[test]
    fn special_aci_values() {
        assert_eq!(Color::from_dxf(Some(256), None), Some(Color::ByLayer));
        assert_eq!(Color::from_dxf(Some(0), None), Some(Color::ByBlock));
        assert_eq!(Color::from_dxf(Some(-5), None), Some(Color::Index(5)));
        assert_eq!(Color::from_dxf(None, None), None);
    }

    #[test]
    fn rgb_degrades_to_nearest_aci() {
        assert_eq!(Color::Rgb(0xF0_10_10).aci(), 1);
        assert_eq!(Color::Rgb(0x00_00_E0).aci(), 5);
        assert_eq!(Color::Rgb(0x80_80_80).aci(), 9);
    }

    #[test]
    fn transparency_flag_is_required() {
        assert_eq!(
            Transparency::from_dxf(0x0200_0080),
            Some(Transparency { alpha: 0x80 })
        );
        assert_eq!(Transparency::from_dxf(0x0100_0000), None);
        assert_eq!(Transparency { alpha: 51 }.to_dxf(), 0x0200_0033);
    }

    #[test]
    fn line_weight_codes() {
        assert_eq!(LineWeight::from_dxf(-1), LineWeight::ByLayer);
        assert_eq!(LineWeight::from_dxf(35), LineWeight::Hundredths(35));
        assert_eq!(LineWeight::Hundredths(35).to_dxf(), 35);
    }
}
