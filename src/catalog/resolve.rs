//! Per-item identifier resolution.
//!
//! Structured hints are searched first. When they yield nothing, the item's
//! image reference is matched against the content-hash table.

use crate::catalog::{CatalogTable, extract_content_hash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Deepest nesting level inspected inside one hint structure.
pub const MAX_HINT_DEPTH: usize = 5;

/// Hint structures considered per item.
pub const MAX_HINT_NODES: usize = 50;

/// Objects visited across all hints of one item.
pub const MAX_VISITED_OBJECTS: usize = 500;

/// Field names checked before the generic walk, in order.
pub const PRIORITY_FIELDS: &[&str] = &["cardRef", "reference", "cardReference", "ref", "id"];

/// Wrapper objects whose `reference` field is checked directly.
pub const WRAPPER_FIELDS: &[&str] = &["card", "data", "item"];

pub const IDENTIFIER_PREFIX: &str = "ALT_";
pub const IDENTIFIER_MARKER: &str = "_B_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "identifier", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(String),
    /// Not resolvable yet; retry once more data is available.
    Deferred,
    /// Never resolvable by hash (unique variant); do not retry.
    Excluded,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRef {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub srcset: Option<String>,
}

impl ImageRef {
    fn combined(&self) -> String {
        format!(
            "{} {}",
            self.srcset.as_deref().unwrap_or_default(),
            self.src.as_deref().unwrap_or_default()
        )
    }
}

/// What the rendering layer knows about one displayed item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderedItem {
    #[serde(default)]
    pub hints: Vec<Value>,
    #[serde(default)]
    pub image: Option<ImageRef>,
}

pub fn resolve_identifier(item: &RenderedItem, table: &CatalogTable) -> Resolution {
    if let Some(identifier) = search_hints(&item.hints) {
        return Resolution::Resolved(identifier);
    }

    let Some(image) = &item.image else {
        return Resolution::Deferred;
    };
    let combined = image.combined();
    if is_unique_variant(&combined) {
        return Resolution::Excluded;
    }

    extract_content_hash(&combined)
        .and_then(|hash| table.lookup(&hash))
        .map(|identifier| Resolution::Resolved(identifier.to_string()))
        .unwrap_or(Resolution::Deferred)
}

pub fn search_hints(hints: &[Value]) -> Option<String> {
    let mut search = HintSearch::default();
    hints
        .iter()
        .take(MAX_HINT_NODES)
        .find_map(|hint| search.find(hint, 0))
}

fn is_unique_variant(image: &str) -> bool {
    if image.contains("/UNIQUE/") || image.to_ascii_uppercase().contains("%2FUNIQUE%2F") {
        return true;
    }
    urlencoding::decode(image)
        .map(|decoded| decoded.contains("/UNIQUE/"))
        .unwrap_or(false)
}

fn is_prefixed(value: &str) -> bool {
    value.starts_with(IDENTIFIER_PREFIX)
}

fn is_canonical(value: &str) -> bool {
    is_prefixed(value) && value.contains(IDENTIFIER_MARKER)
}

#[derive(Default)]
struct HintSearch {
    visited: usize,
}

impl HintSearch {
    fn find(&mut self, value: &Value, depth: usize) -> Option<String> {
        if depth > MAX_HINT_DEPTH || self.visited >= MAX_VISITED_OBJECTS {
            return None;
        }
        let Value::Object(map) = value else {
            return None;
        };
        self.visited += 1;

        for field in PRIORITY_FIELDS {
            if let Some(found) = map.get(*field).and_then(Value::as_str)
                && is_prefixed(found)
            {
                return Some(found.to_string());
            }
        }

        for field in WRAPPER_FIELDS {
            if let Some(found) = map
                .get(*field)
                .and_then(|wrapper| wrapper.get("reference"))
                .and_then(Value::as_str)
                && is_prefixed(found)
            {
                return Some(found.to_string());
            }
        }

        for nested in map.values() {
            match nested {
                Value::String(found) if is_canonical(found) => return Some(found.clone()),
                Value::Object(_) => {
                    if let Some(found) = self.find(nested, depth + 1) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }

        None
    }
}
