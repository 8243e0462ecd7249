pub mod build;
pub mod locale;
pub mod resolve;

pub use build::{BuildRequest, CatalogConfig};
pub use resolve::{RenderedItem, Resolution, resolve_identifier};

use crate::altered::{AlteredClient, AlteredError};
use crate::events::EventSink;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::RwLock;

static CONTENT_HASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([a-f0-9]{32})\.(?:jpg|webp|png)").expect("content hash pattern")
});

/// First 32-hex digest followed by an image extension, lowercased.
pub fn extract_content_hash(image_path: &str) -> Option<String> {
    CONTENT_HASH
        .captures(image_path)
        .map(|captures| captures[1].to_lowercase())
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog build already in progress")]
    AlreadyInProgress,
    #[error("invalid locale `{0}`, expected xx-xx")]
    InvalidLocale(String),
    #[error("listing unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("malformed listing response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AlteredError> for CatalogError {
    fn from(value: AlteredError) -> Self {
        match value {
            AlteredError::Deserialize(message) => Self::MalformedResponse(message),
            other => Self::RemoteUnavailable(other.to_string()),
        }
    }
}

/// Content hash to canonical identifier, built wholesale by one crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogTable {
    entries: BTreeMap<String, String>,
    locale: Option<String>,
    built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogMetadata {
    pub locale: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
    pub entry_count: usize,
}

impl CatalogTable {
    pub fn new(entries: BTreeMap<String, String>, locale: impl Into<String>) -> Self {
        Self {
            entries,
            locale: Some(locale.into()),
            built_at: Some(Utc::now()),
        }
    }

    pub fn lookup(&self, hash: &str) -> Option<&str> {
        self.entries.get(hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn metadata(&self) -> CatalogMetadata {
        CatalogMetadata {
            locale: self.locale.clone(),
            built_at: self.built_at,
            entry_count: self.entries.len(),
        }
    }
}

/// Owns the installed table and the single-build guard.
pub struct CatalogEngine {
    client: AlteredClient,
    store: Arc<Store>,
    sink: Arc<dyn EventSink>,
    config: CatalogConfig,
    table: RwLock<Arc<CatalogTable>>,
    building: Arc<AtomicBool>,
}

impl CatalogEngine {
    pub fn new(
        client: AlteredClient,
        store: Arc<Store>,
        sink: Arc<dyn EventSink>,
        config: CatalogConfig,
        installed: Option<CatalogTable>,
    ) -> Self {
        Self {
            client,
            store,
            sink,
            config,
            table: RwLock::new(Arc::new(installed.unwrap_or_default())),
            building: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The installed table as one consistent snapshot.
    pub async fn snapshot(&self) -> Arc<CatalogTable> {
        self.table.read().await.clone()
    }

    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::Acquire)
    }

    async fn install(&self, table: CatalogTable) {
        *self.table.write().await = Arc::new(table);
    }
}

/// Holds the build flag; dropping it releases the flag.
pub(crate) struct BuildGuard(Arc<AtomicBool>);

impl BuildGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_extracted_and_lowercased() {
        assert_eq!(
            extract_content_hash("/cards/CORE/ABCDEF0123456789ABCDEF0123456789.JPG").as_deref(),
            Some("abcdef0123456789abcdef0123456789")
        );
        assert_eq!(extract_content_hash("/cards/CORE/abc.jpg"), None);
        assert_eq!(
            extract_content_hash("/cards/0123456789abcdef0123456789abcdef.gif"),
            None
        );
    }

    #[test]
    fn build_guard_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = BuildGuard::acquire(&flag).expect("first");
        assert!(BuildGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(BuildGuard::acquire(&flag).is_some());
    }
}
