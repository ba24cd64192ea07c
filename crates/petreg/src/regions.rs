//! Region catalog used by fallback synthesis.

/// A reporting region and its relative population weight.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub name: &'static str,
    pub size: f64,
}

/// Weight applied to regions missing from the catalog.
pub const DEFAULT_REGION_SIZE: f64 = 0.6;

/// The 22 municipalities and counties reported by the source.
/// The six special municipalities carry the largest weights.
pub const CATALOG: [Region; 22] = [
    Region { name: "臺北市", size: 1.6 },
    Region { name: "新北市", size: 2.0 },
    Region { name: "桃園市", size: 1.5 },
    Region { name: "臺中市", size: 1.7 },
    Region { name: "臺南市", size: 1.3 },
    Region { name: "高雄市", size: 1.6 },
    Region { name: "基隆市", size: 0.5 },
    Region { name: "新竹市", size: 0.6 },
    Region { name: "嘉義市", size: 0.4 },
    Region { name: "新竹縣", size: 0.7 },
    Region { name: "苗栗縣", size: 0.6 },
    Region { name: "彰化縣", size: 0.9 },
    Region { name: "南投縣", size: 0.5 },
    Region { name: "雲林縣", size: 0.6 },
    Region { name: "嘉義縣", size: 0.5 },
    Region { name: "屏東縣", size: 0.7 },
    Region { name: "宜蘭縣", size: 0.5 },
    Region { name: "花蓮縣", size: 0.4 },
    Region { name: "臺東縣", size: 0.3 },
    Region { name: "澎湖縣", size: 0.2 },
    Region { name: "金門縣", size: 0.2 },
    Region { name: "連江縣", size: 0.1 },
];

/// Size coefficient for a region name.
///
/// `台` and `臺` are treated as the same character.
pub fn size_coefficient(name: &str) -> f64 {
    let normalized = name.trim().replace('台', "臺");
    CATALOG
        .iter()
        .find(|r| r.name == normalized)
        .map(|r| r.size)
        .unwrap_or(DEFAULT_REGION_SIZE)
}

pub fn default_region_names() -> Vec<String> {
    CATALOG.iter().map(|r| r.name.to_string()).collect()
}
