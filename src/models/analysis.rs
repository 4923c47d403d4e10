use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::models::item::ClothingMetadata;

/// Minimum Jaro-Winkler similarity for snapping a free-form category onto a
/// known one.
const CATEGORY_MATCH_THRESHOLD: f64 = 0.92;

/// Garment categories the catalogue recognises. Anything else the model
/// returns is kept as an open, lower-cased string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumIter, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ClothingCategory {
    TShirt,
    Shirt,
    Blouse,
    Sweater,
    Hoodie,
    Cardigan,
    Jacket,
    Coat,
    Blazer,
    Dress,
    Skirt,
    Jeans,
    Trousers,
    Shorts,
    Leggings,
    Suit,
    Sneakers,
    Boots,
    Sandals,
    Heels,
    Hat,
    Scarf,
    Bag,
    Belt,
    Accessory,
}

/// Structured output requested from the AI client for one image.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct AnalysisResult {
    #[garde(length(min = 1, max = 64))]
    pub category: String,

    #[garde(length(min = 1, max = 16), inner(length(min = 1, max = 32)))]
    pub colors: Vec<String>,

    #[garde(length(max = 32), inner(length(min = 1, max = 48)))]
    #[serde(default)]
    pub tags: Vec<String>,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

impl AnalysisResult {
    /// JSON schema handed to the provider's structured-output mode.
    pub fn json_schema() -> serde_json::Value {
        let categories: Vec<String> = ClothingCategory::iter().map(|c| c.to_string()).collect();
        serde_json::json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": format!("Garment category, preferably one of: {}", categories.join(", "))
                },
                "colors": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" }
                },
                "confidence": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1
                }
            },
            "required": ["category", "colors", "tags", "confidence"]
        })
    }

    /// Normalise into the form persisted on the item.
    pub fn into_metadata(self) -> ClothingMetadata {
        ClothingMetadata {
            category: normalize_category(&self.category),
            colors: normalize_labels(self.colors),
            tags: normalize_labels(self.tags),
            confidence: self.confidence,
        }
    }
}

/// Map a model-provided category onto [`ClothingCategory`] when it is close
/// enough, otherwise return it trimmed and lower-cased.
pub fn normalize_category(raw: &str) -> String {
    let cleaned = raw.trim().to_lowercase();
    if let Ok(known) = cleaned.parse::<ClothingCategory>() {
        return known.to_string();
    }

    let compact = compact(&cleaned);
    let best = ClothingCategory::iter()
        .map(|c| {
            let name = c.to_string();
            let score = strsim::jaro_winkler(&compact, &compact_str(&name));
            (c, score)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((category, score)) if score >= CATEGORY_MATCH_THRESHOLD => category.to_string(),
        _ => cleaned,
    }
}

fn compact(value: &str) -> String {
    value.chars().filter(|c| c.is_alphanumeric()).collect()
}

fn compact_str(value: &str) -> String {
    compact(&value.to_lowercase())
}

/// Trim, lower-case and de-duplicate while keeping first-seen order.
fn normalize_labels(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim().to_lowercase();
        if !label.is_empty() && !out.contains(&label) {
            out.push(label);
        }
    }
    out
}
