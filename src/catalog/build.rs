use crate::altered::cards::{CardListing, CardPageQuery, PAGE_SIZE, page_members};
use crate::altered::AlteredClient;
use crate::catalog::locale::{detect_locale, is_valid_locale};
use crate::catalog::{BuildGuard, CatalogEngine, CatalogError, CatalogTable, extract_content_hash};
use crate::events::EventSink;
use crate::models::{BuildPhase, JobEvent};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Safety ceiling on pages fetched per card set.
pub const MAX_PAGES: u32 = 50;

pub const DEFAULT_CARD_SETS: &[&str] = &["CORE", "COREKS", "ALIZE", "BISE", "CYCLONE"];

/// Commons and the two rare sub-tiers; everything else stays out of the table.
static QUALIFYING_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_[CR][12]?$").expect("reference tier pattern"));

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Empty crawls the listing once without a set filter.
    pub card_sets: Vec<String>,
    pub page_pause: Duration,
    pub set_pause: Duration,
    /// Front-end URL used for locale detection when a build names none.
    pub context_url: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            card_sets: DEFAULT_CARD_SETS.iter().map(|s| s.to_string()).collect(),
            page_pause: Duration::from_millis(500),
            set_pause: Duration::from_millis(300),
            context_url: None,
        }
    }
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let card_sets = std::env::var("CATALOG_CARD_SETS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.card_sets);
        Self {
            card_sets,
            page_pause: env_millis("CRAWL_PAGE_PAUSE_MS").unwrap_or(defaults.page_pause),
            set_pause: env_millis("CRAWL_SET_PAUSE_MS").unwrap_or(defaults.set_pause),
            context_url: std::env::var("ALTERED_CONTEXT_URL").ok(),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub context_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    pub locale: String,
    pub entry_count: usize,
    pub built_at: Option<DateTime<Utc>>,
}

impl CatalogEngine {
    /// Crawls the listing and installs the resulting table.
    ///
    /// The installed table is replaced only when the whole crawl succeeds.
    pub async fn build(&self, request: BuildRequest) -> Result<BuildSummary, CatalogError> {
        let (locale, guard) = self.begin(&request)?;
        self.run_build(locale, guard).await
    }

    /// Claims the build slot now and crawls in a background task.
    pub fn spawn_build(
        self: &Arc<Self>,
        request: BuildRequest,
    ) -> Result<JoinHandle<Result<BuildSummary, CatalogError>>, CatalogError> {
        let (locale, guard) = self.begin(&request)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.run_build(locale, guard).await
        }))
    }

    fn begin(&self, request: &BuildRequest) -> Result<(String, BuildGuard), CatalogError> {
        let requested = request
            .locale
            .as_deref()
            .map(str::trim)
            .filter(|locale| !locale.is_empty());
        let locale = match requested {
            Some(locale) if is_valid_locale(locale) => locale.to_lowercase(),
            Some(other) => return Err(CatalogError::InvalidLocale(other.to_string())),
            None => detect_locale(
                request
                    .context_url
                    .as_deref()
                    .or(self.config.context_url.as_deref()),
            ),
        };

        let Some(guard) = BuildGuard::acquire(&self.building) else {
            self.sink
                .emit(JobEvent::build(BuildPhase::Error, "Build already in progress"));
            return Err(CatalogError::AlreadyInProgress);
        };
        Ok((locale, guard))
    }

    async fn run_build(
        &self,
        locale: String,
        _guard: BuildGuard,
    ) -> Result<BuildSummary, CatalogError> {
        info!(target = "altered.catalog", %locale, "catalog build started");
        self.sink.emit(JobEvent::build(
            BuildPhase::Info,
            format!("Starting catalog build ({locale})..."),
        ));

        let result = match crawl(&self.client, &locale, &self.config, self.sink.as_ref()).await {
            Ok(entries) => {
                let table = CatalogTable::new(entries, locale.clone());
                match self.store.save_catalog(&table).await {
                    Ok(()) => {
                        let summary = BuildSummary {
                            locale: locale.clone(),
                            entry_count: table.len(),
                            built_at: table.metadata().built_at,
                        };
                        self.install(table).await;
                        Ok(summary)
                    }
                    Err(err) => Err(CatalogError::from(err)),
                }
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(summary) => {
                info!(target = "altered.catalog", %locale, entries = summary.entry_count, "catalog installed");
                self.sink.emit(JobEvent::build(
                    BuildPhase::Success,
                    format!("Catalog built: {} cards ({locale})", summary.entry_count),
                ));
            }
            Err(err) => {
                warn!(target = "altered.catalog", %locale, error = %err, "catalog build failed, keeping previous table");
                self.sink
                    .emit(JobEvent::build(BuildPhase::Error, format!("Error: {err}")));
            }
        }
        result
    }
}

/// Walks every configured card set page by page, one request at a time.
pub(crate) async fn crawl(
    client: &AlteredClient,
    locale: &str,
    config: &CatalogConfig,
    sink: &dyn EventSink,
) -> Result<BTreeMap<String, String>, CatalogError> {
    let sets: Vec<Option<&str>> = if config.card_sets.is_empty() {
        vec![None]
    } else {
        config.card_sets.iter().map(|s| Some(s.as_str())).collect()
    };

    let mut entries = BTreeMap::new();
    for (index, card_set) in sets.iter().enumerate() {
        let label = card_set.unwrap_or("all sets");
        let mut page = 1;
        loop {
            sink.emit(JobEvent::build(
                BuildPhase::Info,
                format!(
                    "Fetching {label} page {page}... ({} cards so far)",
                    entries.len()
                ),
            ));
            let body = client
                .fetch_cards_page(&CardPageQuery {
                    locale,
                    card_set: *card_set,
                    page,
                })
                .await?;

            let Some(items) = page_members(&body) else {
                debug!(target = "altered.catalog", card_set = label, page, "page is not a sequence, stopping");
                break;
            };
            if items.is_empty() {
                debug!(target = "altered.catalog", card_set = label, page, "empty page, stopping");
                break;
            }

            let matched = collect_entries(items, &mut entries);
            crate::metrics::crawl_page(label, page, matched);

            if items.len() < PAGE_SIZE {
                break;
            }
            if page >= MAX_PAGES {
                warn!(target = "altered.catalog", card_set = label, "page ceiling reached");
                break;
            }
            page += 1;
            sleep(config.page_pause).await;
        }

        if index + 1 < sets.len() {
            sleep(config.set_pause).await;
        }
    }
    Ok(entries)
}

fn collect_entries(items: &[serde_json::Value], entries: &mut BTreeMap<String, String>) -> usize {
    let mut matched = 0;
    for listing in items.iter().filter_map(CardListing::from_value) {
        if !QUALIFYING_REFERENCE.is_match(listing.reference) {
            continue;
        }
        if let Some(hash) = extract_content_hash(listing.image_path) {
            entries.insert(hash, listing.reference.to_string());
            matched += 1;
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::store::Store;
    use serde_json::{Value, json};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn card(n: usize, suffix: &str) -> Value {
        json!({
            "reference": format!("ALT_CORE_B_AX_{n:03}_{suffix}"),
            "imagePath": format!("https://cdn.example/CORE/{n:032x}.jpg"),
        })
    }

    /// `qualifying` commons followed by unique cards up to `len`.
    fn page(len: usize, qualifying: usize, offset: usize) -> Value {
        let members: Vec<Value> = (0..len)
            .map(|i| {
                let suffix = if i < qualifying { "C" } else { "U_123" };
                card(offset + i, suffix)
            })
            .collect();
        json!({ "hydra:member": members })
    }

    fn config() -> CatalogConfig {
        CatalogConfig {
            card_sets: vec![],
            page_pause: Duration::ZERO,
            set_pause: Duration::ZERO,
            context_url: None,
        }
    }

    fn engine(server: &MockServer, sink: Arc<RecordingSink>) -> CatalogEngine {
        CatalogEngine::new(
            AlteredClient::new(server.uri(), "https://www.altered.gg"),
            Arc::new(Store::in_memory()),
            sink,
            config(),
            None,
        )
    }

    async fn mount_page(server: &MockServer, number: u32, body: Value) {
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("page", number.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let server = MockServer::start().await;
        mount_page(&server, 1, page(100, 60, 0)).await;
        mount_page(&server, 2, page(40, 25, 100)).await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(10, 10, 200)))
            .expect(0)
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&server, sink.clone());
        let summary = engine
            .build(BuildRequest {
                locale: Some("en-us".into()),
                context_url: None,
            })
            .await
            .expect("build");

        assert_eq!(summary.entry_count, 85);
        assert_eq!(summary.locale, "en-us");
        let table = engine.snapshot().await;
        assert_eq!(table.len(), 85);
        assert_eq!(table.locale(), Some("en-us"));
        assert!(matches!(
            sink.events().last(),
            Some(JobEvent::BuildStatus { phase: BuildPhase::Success, .. })
        ));
    }

    #[tokio::test]
    async fn failed_crawl_keeps_previous_table() {
        let server = MockServer::start().await;
        mount_page(&server, 1, page(3, 3, 0)).await;

        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&server, sink.clone());
        engine.build(BuildRequest::default()).await.expect("first build");
        let before = engine.snapshot().await;
        assert_eq!(before.len(), 3);
        assert_eq!(before.locale(), Some("fr-fr"));

        server.reset().await;
        mount_page(&server, 1, page(100, 100, 0)).await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = engine
            .build(BuildRequest::default())
            .await
            .expect_err("second build fails");
        assert!(matches!(err, CatalogError::RemoteUnavailable(_)));
        assert_eq!(*engine.snapshot().await, *before);
        assert!(!engine.is_building());
    }

    #[tokio::test]
    async fn malformed_body_aborts_build() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let engine = engine(&server, Arc::new(RecordingSink::default()));
        let err = engine
            .build(BuildRequest::default())
            .await
            .expect_err("malformed");
        assert!(matches!(err, CatalogError::MalformedResponse(_)));
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn non_sequence_page_stops_without_error() {
        let server = MockServer::start().await;
        mount_page(&server, 1, json!({"detail": "no results"})).await;

        let engine = engine(&server, Arc::new(RecordingSink::default()));
        let summary = engine.build(BuildRequest::default()).await.expect("build");
        assert_eq!(summary.entry_count, 0);
    }

    #[tokio::test]
    async fn concurrent_build_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(5, 5, 0))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(engine(&server, sink.clone()));
        let running = engine
            .spawn_build(BuildRequest::default())
            .expect("first build starts");
        assert!(engine.is_building());

        let err = engine
            .build(BuildRequest::default())
            .await
            .expect_err("second build rejected");
        assert!(matches!(err, CatalogError::AlreadyInProgress));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            JobEvent::BuildStatus { phase: BuildPhase::Error, message } if message == "Build already in progress"
        )));

        let summary = running.await.expect("join").expect("first build");
        assert_eq!(summary.entry_count, 5);
        assert!(!engine.is_building());
    }

    #[tokio::test]
    async fn rebuild_with_same_data_is_identical() {
        let server = MockServer::start().await;
        mount_page(&server, 1, page(30, 20, 0)).await;

        let engine = engine(&server, Arc::new(RecordingSink::default()));
        engine.build(BuildRequest::default()).await.expect("first");
        let first = engine.snapshot().await;
        engine.build(BuildRequest::default()).await.expect("second");
        let second = engine.snapshot().await;
        assert_eq!(first.entries(), second.entries());
    }

    #[tokio::test]
    async fn crawls_each_card_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("cardSet[]", "CORE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(2, 2, 0)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("cardSet[]", "ALIZE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(3, 3, 50)))
            .expect(1)
            .mount(&server)
            .await;

        let engine = CatalogEngine::new(
            AlteredClient::new(server.uri(), "https://www.altered.gg"),
            Arc::new(Store::in_memory()),
            Arc::new(RecordingSink::default()),
            CatalogConfig {
                card_sets: vec!["CORE".into(), "ALIZE".into()],
                ..config()
            },
            None,
        );
        let summary = engine.build(BuildRequest::default()).await.expect("build");
        assert_eq!(summary.entry_count, 5);
    }

    #[tokio::test]
    async fn invalid_locale_is_rejected_before_crawling() {
        let server = MockServer::start().await;
        let engine = engine(&server, Arc::new(RecordingSink::default()));
        let err = engine
            .build(BuildRequest {
                locale: Some("english".into()),
                context_url: None,
            })
            .await
            .expect_err("invalid");
        assert!(matches!(err, CatalogError::InvalidLocale(_)));
        assert!(!engine.is_building());
    }

    #[tokio::test]
    async fn blank_locale_falls_back_to_detection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("locale", "de-de"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(2, 2, 0)))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine(&server, Arc::new(RecordingSink::default()));
        let summary = engine
            .build(BuildRequest {
                locale: Some("  ".into()),
                context_url: Some("https://www.altered.gg/de-de/cards".into()),
            })
            .await
            .expect("build");
        assert_eq!(summary.locale, "de-de");
        assert_eq!(summary.entry_count, 2);
    }

    #[tokio::test]
    async fn page_ceiling_bounds_each_set() {
        let server = MockServer::start().await;
        for number in 1..=MAX_PAGES {
            Mock::given(method("GET"))
                .and(path("/cards"))
                .and(query_param("page", number.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(page(
                    PAGE_SIZE,
                    PAGE_SIZE,
                    (number as usize - 1) * PAGE_SIZE,
                )))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/cards"))
            .and(query_param("page", (MAX_PAGES + 1).to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(PAGE_SIZE, PAGE_SIZE, 0)))
            .expect(0)
            .mount(&server)
            .await;

        let engine = engine(&server, Arc::new(RecordingSink::default()));
        let summary = engine.build(BuildRequest::default()).await.expect("build");
        assert_eq!(summary.entry_count, MAX_PAGES as usize * PAGE_SIZE);
        assert_eq!(server.received_requests().await.map(|r| r.len()), Some(MAX_PAGES as usize));
    }

    #[test]
    fn only_common_and_rare_tiers_qualify() {
        let items = vec![
            card(1, "C"),
            card(2, "R1"),
            card(3, "R2"),
            card(4, "U_77"),
            card(5, "R3"),
            json!({"reference": "ALT_CORE_B_AX_006_C"}),
        ];
        let mut entries = BTreeMap::new();
        assert_eq!(collect_entries(&items, &mut entries), 3);
        assert_eq!(entries.get(&format!("{:032x}", 2)).map(String::as_str), Some("ALT_CORE_B_AX_002_R1"));
    }
}
