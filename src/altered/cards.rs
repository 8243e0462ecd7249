use crate::altered::client::{AlteredClient, AlteredError, ensure_success};
use serde_json::Value;

pub const PAGE_SIZE: usize = 100;

/// Rarity tiers requested from the listing endpoint.
pub const RARITIES: &[&str] = &["RARE", "COMMON"];

#[derive(Debug, Clone, Copy)]
pub struct CardPageQuery<'a> {
    pub locale: &'a str,
    pub card_set: Option<&'a str>,
    pub page: u32,
}

/// A listing entry reduced to the two fields the catalog cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardListing<'a> {
    pub reference: &'a str,
    pub image_path: &'a str,
}

impl<'a> CardListing<'a> {
    pub fn from_value(value: &'a Value) -> Option<Self> {
        let reference = value.get("reference")?.as_str().filter(|s| !s.is_empty())?;
        let image_path = value.get("imagePath")?.as_str().filter(|s| !s.is_empty())?;
        Some(Self {
            reference,
            image_path,
        })
    }
}

impl AlteredClient {
    pub async fn fetch_cards_page(&self, query: &CardPageQuery<'_>) -> Result<Value, AlteredError> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.to_string()),
            ("itemsPerPage", PAGE_SIZE.to_string()),
            ("locale", query.locale.to_string()),
        ];
        params.extend(RARITIES.iter().map(|rarity| ("rarity[]", rarity.to_string())));
        if let Some(card_set) = query.card_set {
            params.push(("cardSet[]", card_set.to_string()));
        }

        let response = self
            .http
            .get(self.api_url("cards"))
            .query(&params)
            .send()
            .await
            .map_err(|err| AlteredError::Request(err.to_string()))?;
        let response = ensure_success(response).await?;

        response
            .json::<Value>()
            .await
            .map_err(|err| AlteredError::Deserialize(err.to_string()))
    }
}

/// Extracts the item sequence from a listing page.
///
/// Accepts the hydra collection envelope, a plain `member` envelope or a bare
/// array. Anything else yields `None`.
pub fn page_members(page: &Value) -> Option<&Vec<Value>> {
    if let Some(items) = page.get("hydra:member").and_then(Value::as_array) {
        return Some(items);
    }
    if let Some(items) = page.get("member").and_then(Value::as_array) {
        return Some(items);
    }
    page.as_array()
}
