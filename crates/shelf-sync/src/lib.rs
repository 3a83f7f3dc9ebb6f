//! Harvest orchestration: configuration, per-site crawl, catalog merge and reporting.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shelf_core::ProductRecord;
use shelf_extract::{find_next_page, CategoryLink, ExtractContext, ExtractionRules, ProductExtractor};
use shelf_storage::{uniform_delay, BackoffPolicy, CatalogStore, FetchConfig, MergeOutcome, PageSource};
use tracing::{info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub rules_path: PathBuf,
    pub retry_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_categories: usize,
    pub max_products_per_category: usize,
    pub max_pages_per_category: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        Self {
            data_dir: lookup("SHELF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            rules_path: lookup("SHELF_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./harvest.yaml")),
            retry_attempts: number("SHELF_RETRY_ATTEMPTS", 3) as usize,
            min_delay: Duration::from_millis(number("SHELF_MIN_DELAY_MS", 1000)),
            max_delay: Duration::from_millis(number("SHELF_MAX_DELAY_MS", 3000)),
            max_categories: number("SHELF_MAX_CATEGORIES", 10) as usize,
            max_products_per_category: number("SHELF_MAX_PRODUCTS_PER_CATEGORY", 100) as usize,
            max_pages_per_category: number("SHELF_MAX_PAGES_PER_CATEGORY", 3) as usize,
            user_agent: lookup("SHELF_USER_AGENT").unwrap_or_else(|| "shelf-harvester/0.1".to_string()),
            http_timeout_secs: number("SHELF_HTTP_TIMEOUT_SECS", 20),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.retry_attempts.max(1),
                min_delay: self.min_delay,
                max_delay: self.max_delay,
            },
        }
    }
}

/// Selector tiers, keyword tables and site profiles; built-in defaults when the file is absent.
pub fn load_extraction_rules(path: &Path) -> Result<ExtractionRules> {
    if !path.exists() {
        info!(path = %path.display(), "no rules file; using built-in extraction rules");
        return Ok(ExtractionRules::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(ExtractionRules::default());
    }
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SiteSummary {
    pub run_id: Uuid,
    pub site: String,
    pub brand: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub categories: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub cards_seen: usize,
    pub cards_dropped: usize,
    pub records_extracted: usize,
    pub interrupted: bool,
    pub raw_snapshot: Option<PathBuf>,
    pub merge: Option<MergeOutcome>,
}

enum Fetched {
    Page(String),
    Failed,
    Interrupted,
}

struct CrawlState {
    summary: SiteSummary,
    records: Vec<ProductRecord>,
    throttle: Throttle,
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    rules: ExtractionRules,
    store: CatalogStore,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig, rules: ExtractionRules) -> Self {
        let store = CatalogStore::new(config.data_dir.clone());
        Self { config, rules, store }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub async fn harvest_site(&self, source: &dyn PageSource, site: &str) -> Result<SiteSummary> {
        self.harvest_site_until(source, site, std::future::pending()).await
    }

    /// Crawl one site and merge what it yields into the catalog.
    ///
    /// A failed seed fetch aborts the site. When `shutdown` resolves, the page
    /// in flight is abandoned and the records gathered so far are persisted.
    pub async fn harvest_site_until<F>(&self, source: &dyn PageSource, site: &str, shutdown: F) -> Result<SiteSummary>
    where
        F: Future<Output = ()>,
    {
        let seed = Url::parse(site).with_context(|| format!("parsing site url {site}"))?;
        let extractor = ProductExtractor::for_site(&self.rules, seed.as_str())
            .with_context(|| format!("building extractor for {site}"))?;
        let span = info_span!("harvest", site = %seed, brand = extractor.brand());
        self.crawl(source, &extractor, seed, shutdown).instrument(span).await
    }

    async fn crawl<F>(
        &self,
        source: &dyn PageSource,
        extractor: &ProductExtractor,
        seed: Url,
        shutdown: F,
    ) -> Result<SiteSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut state = CrawlState {
            summary: SiteSummary {
                run_id: Uuid::new_v4(),
                site: seed.to_string(),
                brand: extractor.brand().to_string(),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            records: Vec::new(),
            throttle: Throttle::new(self.config.min_delay, self.config.max_delay),
        };

        let seed_markup = match race(&mut shutdown, source.fetch(seed.as_str())).await {
            None => {
                state.summary.interrupted = true;
                return self.finish(state).await;
            }
            Some(result) => result.with_context(|| format!("fetching seed page {seed}"))?,
        };
        state.summary.pages_fetched += 1;

        let mut categories = extractor.discover_categories(&seed_markup, &seed);
        categories.truncate(self.config.max_categories);
        state.summary.categories = categories.len();

        if categories.is_empty() {
            info!("no category links found; treating the seed page as a listing");
            let interrupted = self
                .walk_listing(source, extractor, &mut shutdown, &mut state, seed.clone(), None, Some(seed_markup))
                .await;
            state.summary.interrupted = interrupted;
        }

        for link in &categories {
            let start = match Url::parse(&link.url) {
                Ok(url) => url,
                Err(err) => {
                    warn!(url = %link.url, error = %err, "skipping unparsable category url");
                    continue;
                }
            };
            if self
                .walk_listing(source, extractor, &mut shutdown, &mut state, start, Some(link), None)
                .await
            {
                state.summary.interrupted = true;
                break;
            }
        }

        self.finish(state).await
    }

    /// Extract a listing and follow its pagination within the page and product caps.
    /// Returns whether shutdown fired.
    #[allow(clippy::too_many_arguments)]
    async fn walk_listing<F>(
        &self,
        source: &dyn PageSource,
        extractor: &ProductExtractor,
        shutdown: &mut Pin<&mut F>,
        state: &mut CrawlState,
        start: Url,
        link: Option<&CategoryLink>,
        mut prefetched: Option<String>,
    ) -> bool
    where
        F: Future<Output = ()>,
    {
        let mut page_url = start;
        let mut visited = HashSet::new();
        let mut taken = 0usize;

        for _ in 0..self.config.max_pages_per_category.max(1) {
            if !visited.insert(page_url.clone()) {
                break;
            }
            let markup = match prefetched.take() {
                Some(markup) => markup,
                None => match self.fetch_page(source, &mut state.throttle, shutdown, &page_url).await {
                    Fetched::Page(markup) => {
                        state.summary.pages_fetched += 1;
                        markup
                    }
                    Fetched::Failed => {
                        state.summary.pages_failed += 1;
                        break;
                    }
                    Fetched::Interrupted => return true,
                },
            };

            let ctx = match link {
                Some(link) => ExtractContext::for_category(page_url.clone(), link),
                None => ExtractContext::new(page_url.clone()),
            };
            let report = info_span!("page", url = %page_url).in_scope(|| extractor.extract(&markup, &ctx));
            state.summary.cards_seen += report.cards_seen;
            state.summary.cards_dropped += report.dropped.total();
            let room = self.config.max_products_per_category.saturating_sub(taken);
            let page_records = report.records.into_iter().take(room).collect::<Vec<_>>();
            taken += page_records.len();
            state.records.extend(page_records);

            if taken >= self.config.max_products_per_category {
                break;
            }
            match find_next_page(&markup, &page_url) {
                Some(next) => page_url = next,
                None => break,
            }
        }
        false
    }

    async fn fetch_page<F>(
        &self,
        source: &dyn PageSource,
        throttle: &mut Throttle,
        shutdown: &mut Pin<&mut F>,
        url: &Url,
    ) -> Fetched
    where
        F: Future<Output = ()>,
    {
        if race(shutdown, throttle.wait()).await.is_none() {
            return Fetched::Interrupted;
        }
        match race(shutdown, source.fetch(url.as_str())).await {
            None => Fetched::Interrupted,
            Some(Ok(markup)) => Fetched::Page(markup),
            Some(Err(err)) => {
                warn!(url = %url, error = %err, "skipping page");
                Fetched::Failed
            }
        }
    }

    async fn finish(&self, state: CrawlState) -> Result<SiteSummary> {
        let CrawlState {
            mut summary, records, ..
        } = state;
        summary.records_extracted = records.len();
        if records.is_empty() {
            info!(interrupted = summary.interrupted, "no products extracted; catalog left untouched");
        } else {
            let raw = self
                .store
                .append_raw(&records, &summary.brand)
                .await
                .context("writing raw snapshot")?;
            let merge = self
                .store
                .merge_and_persist(&records, &summary.brand)
                .await
                .context("merging into catalog")?;
            if merge.recovered_from_corruption() {
                warn!(quarantined = ?merge.quarantined_path, "previous catalog was unreadable and has been set aside");
            }
            summary.raw_snapshot = Some(raw);
            summary.merge = Some(merge);
        }
        summary.finished_at = Some(Utc::now());
        info!(
            pages = summary.pages_fetched,
            failed_pages = summary.pages_failed,
            cards = summary.cards_seen,
            dropped_cards = summary.cards_dropped,
            records = summary.records_extracted,
            interrupted = summary.interrupted,
            "site harvest finished"
        );
        Ok(summary)
    }
}

/// Resolve `work` unless `shutdown` fires first.
async fn race<T, F>(shutdown: &mut Pin<&mut F>, work: impl Future<Output = T>) -> Option<T>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = shutdown.as_mut() => None,
        out = work => Some(out),
    }
}

/// Randomized pause taken before every fetch that follows the seed page.
struct Throttle {
    min: Duration,
    max: Duration,
}

impl Throttle {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    async fn wait(&mut self) {
        let delay = uniform_delay(self.min, self.max, &mut rand::thread_rng());
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl PriceStats {
    pub fn from_prices(prices: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for price in prices {
            count += 1;
            sum += price;
            min = min.min(price);
            max = max.max(price);
        }
        (count > 0).then(|| Self {
            count,
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

pub fn price_stats_by<K: Ord>(
    records: &[ProductRecord],
    key: impl Fn(&ProductRecord) -> K,
) -> BTreeMap<K, PriceStats> {
    let mut groups: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for record in records {
        if let Some(price) = record.price {
            groups.entry(key(record)).or_default().push(price);
        }
    }
    groups
        .into_iter()
        .filter_map(|(k, prices)| PriceStats::from_prices(prices).map(|stats| (k, stats)))
        .collect()
}

/// Markdown price summary of the catalog, per brand and per brand/category.
pub fn catalog_report_markdown(records: &[ProductRecord]) -> String {
    let by_brand = price_stats_by(records, |r| r.brand.clone());
    let by_category = price_stats_by(records, |r| (r.brand.clone(), r.category.clone()));

    let mut lines = vec![
        "# Catalog Price Report".to_string(),
        String::new(),
        format!("- Products: {}", records.len()),
        format!("- Brands: {}", by_brand.len()),
        String::new(),
        "## By Brand".to_string(),
        String::new(),
        "| brand | count | min | max | mean |".to_string(),
        "|---|---:|---:|---:|---:|".to_string(),
    ];
    for (brand, s) in &by_brand {
        lines.push(format!("| {brand} | {} | {:.2} | {:.2} | {:.2} |", s.count, s.min, s.max, s.mean));
    }
    lines.extend([
        String::new(),
        "## By Brand and Category".to_string(),
        String::new(),
        "| brand | category | count | min | max | mean |".to_string(),
        "|---|---|---:|---:|---:|---:|".to_string(),
    ]);
    for ((brand, category), s) in &by_category {
        lines.push(format!(
            "| {brand} | {category} | {} | {:.2} | {:.2} | {:.2} |",
            s.count, s.min, s.max, s.mean
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shelf_storage::FetchError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    const SITE: &str = "https://www.modademo.example/";

    #[derive(Default)]
    struct MemorySource {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
        interrupt_after: Option<(String, Arc<Notify>)>,
    }

    impl MemorySource {
        fn with_page(mut self, url: &str, markup: impl Into<String>) -> Self {
            self.pages.insert(url.to_string(), markup.into());
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for MemorySource {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            if let Some((trigger, notify)) = &self.interrupt_after {
                if trigger == url {
                    notify.notify_one();
                }
            }
            self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/modademo")
            .join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
    }

    fn demo_site() -> MemorySource {
        MemorySource::default()
            .with_page(SITE, fixture("landing.html"))
            .with_page("https://www.modademo.example/es/mujer/camisetas", fixture("camisetas_page1.html"))
            .with_page(
                "https://www.modademo.example/es/mujer/camisetas?page=2",
                fixture("camisetas_page2.html"),
            )
    }

    fn config(dir: &Path) -> HarvestConfig {
        HarvestConfig {
            data_dir: dir.to_path_buf(),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..HarvestConfig::default()
        }
    }

    #[tokio::test]
    async fn harvest_walks_categories_and_pages_then_merges() {
        let dir = tempdir().expect("tempdir");
        let pipeline = HarvestPipeline::new(config(dir.path()), ExtractionRules::default());
        let source = demo_site();

        let summary = pipeline.harvest_site(&source, SITE).await.unwrap();

        assert_eq!(summary.brand, "MODADEMO");
        assert_eq!(summary.categories, 3);
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.pages_failed, 2);
        assert_eq!(summary.records_extracted, 11);
        assert_eq!(summary.cards_dropped, 1);
        assert!(!summary.interrupted);

        let merge = summary.merge.expect("merged");
        assert_eq!(merge.accepted_incoming, 10);
        assert_eq!(merge.final_count, 10);
        assert!(summary.raw_snapshot.unwrap().starts_with(pipeline.store().raw_dir()));

        let catalog = pipeline.store().load().await.unwrap();
        assert!(catalog.iter().all(|r| r.gender == "Mujer" && r.category == "Camisetas"));
        assert_eq!(
            source.requested(),
            vec![
                SITE.to_string(),
                "https://www.modademo.example/es/mujer/camisetas".to_string(),
                "https://www.modademo.example/es/mujer/camisetas?page=2".to_string(),
                "https://www.modademo.example/es/mujer/vestidos".to_string(),
                "https://www.modademo.example/es/hombre/pantalones".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn caps_bound_categories_and_products() {
        let dir = tempdir().expect("tempdir");
        let cfg = HarvestConfig {
            max_categories: 1,
            max_products_per_category: 4,
            ..config(dir.path())
        };
        let pipeline = HarvestPipeline::new(cfg, ExtractionRules::default());
        let source = demo_site();

        let summary = pipeline.harvest_site(&source, SITE).await.unwrap();

        assert_eq!(summary.categories, 1);
        assert_eq!(summary.records_extracted, 4);
        // cap reached on page one; page two never requested
        assert_eq!(source.requested().len(), 2);
    }

    #[tokio::test]
    async fn seed_failure_aborts_the_site() {
        let dir = tempdir().expect("tempdir");
        let pipeline = HarvestPipeline::new(config(dir.path()), ExtractionRules::default());
        let err = pipeline.harvest_site(&MemorySource::default(), SITE).await.unwrap_err();
        assert!(format!("{err:#}").contains("fetching seed page"));
        assert!(!pipeline.store().canonical_path().exists());
    }

    #[tokio::test]
    async fn interrupt_persists_records_from_finished_pages() {
        let dir = tempdir().expect("tempdir");
        let pipeline = HarvestPipeline::new(config(dir.path()), ExtractionRules::default());
        let notify = Arc::new(Notify::new());
        let source = MemorySource {
            interrupt_after: Some((
                "https://www.modademo.example/es/mujer/camisetas".to_string(),
                notify.clone(),
            )),
            ..demo_site()
        };

        let summary = pipeline
            .harvest_site_until(&source, SITE, async move { notify.notified().await })
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.records_extracted, 6);
        assert_eq!(pipeline.store().load().await.unwrap().len(), 6);
        assert_eq!(source.requested().len(), 2);
    }

    #[tokio::test]
    async fn landing_without_categories_is_extracted_directly() {
        let dir = tempdir().expect("tempdir");
        let pipeline = HarvestPipeline::new(config(dir.path()), ExtractionRules::default());
        let cards = ["Sudadera capucha hombre", "Vestido midi mujer", "Gorra lona", "Falda plisada", "Jersey punto", "Chaqueta vaquera"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                format!(r#"<div class="product-card"><h3>{name}</h3><span class="price">{}0 €</span><a href="/item/{i}">ver</a></div>"#, i + 1)
            })
            .collect::<String>();
        let source = MemorySource::default().with_page("https://shop.example/", format!("<main>{cards}</main>"));

        let summary = pipeline.harvest_site(&source, "https://shop.example/").await.unwrap();
        assert_eq!(summary.categories, 0);
        assert_eq!(summary.records_extracted, 6);

        let catalog = pipeline.store().load().await.unwrap();
        assert_eq!(catalog[0].gender, "Hombre");
        assert_eq!(catalog[0].category, "Sudaderas");
        assert_eq!(catalog[1].gender, "Mujer");
        assert_eq!(catalog[2].gender, shelf_core::UNCLASSIFIED_GENDER);
        assert_eq!(catalog[2].category, shelf_core::GENERAL_CATEGORY);
    }

    fn book_page(titles: &[&str], next: Option<&str>) -> String {
        let cards = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                let slug = title.to_lowercase().replace(' ', "-");
                format!(
                    r#"<li><article class="product_pod"><div class="image_container"><a href="{slug}_{i}/index.html"><img src="/media/{i}.jpg" alt="{title}"></a></div><h3><a href="{slug}_{i}/index.html" title="{title}">{title}</a></h3><div class="product_price"><p class="price_color">£5{i}.77</p></div></article></li>"#
                )
            })
            .collect::<String>();
        let pager = next
            .map(|href| format!(r#"<ul class="pager"><li class="next"><a href="{href}">next</a></li></ul>"#))
            .unwrap_or_default();
        format!("<html><body><ol class=\"row\">{cards}</ol>{pager}</body></html>")
    }

    #[tokio::test]
    async fn profiled_seed_listing_follows_pagination_up_to_the_page_cap() {
        let dir = tempdir().expect("tempdir");
        let rules_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../harvest.yaml");
        let rules = load_extraction_rules(&rules_path).unwrap();
        let cfg = HarvestConfig {
            max_pages_per_category: 2,
            ..config(dir.path())
        };
        let pipeline = HarvestPipeline::new(cfg, rules);
        let first = ["Tipping the Velvet", "Soumission", "Sharp Objects", "Sapiens", "The Requiem Red", "Olio"];
        let second = ["In Her Wake", "How Music Works", "Foolproof", "Chase Me", "Starving Hearts", "Set Me Free"];
        let source = MemorySource::default()
            .with_page("https://books.toscrape.com/", book_page(&first, Some("catalogue/page-2.html")))
            .with_page(
                "https://books.toscrape.com/catalogue/page-2.html",
                book_page(&second, Some("page-3.html")),
            );

        let summary = pipeline.harvest_site(&source, "https://books.toscrape.com/").await.unwrap();

        assert_eq!(summary.brand, "Books to Scrape");
        assert_eq!(summary.categories, 0);
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.records_extracted, 12);
        assert_eq!(
            source.requested(),
            vec![
                "https://books.toscrape.com/".to_string(),
                "https://books.toscrape.com/catalogue/page-2.html".to_string(),
            ]
        );

        let catalog = pipeline.store().load().await.unwrap();
        assert_eq!(catalog[0].name, "Tipping the Velvet");
        assert_eq!(catalog[0].price, Some(50.77));
        assert_eq!(catalog[0].url, "https://books.toscrape.com/tipping-the-velvet_0/index.html");
        assert_eq!(catalog[6].url, "https://books.toscrape.com/catalogue/in-her-wake_0/index.html");
        assert_eq!(catalog[0].image_url.as_deref(), Some("https://books.toscrape.com/media/0.jpg"));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let vars = HashMap::from([
            ("SHELF_DATA_DIR", "/tmp/shelf"),
            ("SHELF_RETRY_ATTEMPTS", "5"),
            ("SHELF_MIN_DELAY_MS", "250"),
            ("SHELF_MAX_CATEGORIES", "many"),
        ]);
        let cfg = HarvestConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/shelf"));
        assert_eq!(cfg.retry_attempts, 5);
        assert_eq!(cfg.min_delay, Duration::from_millis(250));
        assert_eq!(cfg.max_delay, Duration::from_millis(3000));
        assert_eq!(cfg.max_categories, 10);
        assert_eq!(cfg.rules_path, PathBuf::from("./harvest.yaml"));
        assert_eq!(cfg.fetch_config().backoff.max_attempts, 5);
    }

    #[test]
    fn shipped_rules_file_parses() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../harvest.yaml");
        let rules = load_extraction_rules(&path).unwrap();
        let defaults = ExtractionRules::default();
        assert_eq!(rules.selectors, defaults.selectors);
        assert_eq!(rules.gender, defaults.gender);
        assert_eq!(rules.category, defaults.category);
        let profile = rules.profile_for("books.toscrape.com").expect("books profile");
        assert_eq!(profile.display_name.as_deref(), Some("Books to Scrape"));
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let rules = load_extraction_rules(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(rules, ExtractionRules::default());
    }

    #[test]
    fn partial_rules_file_keeps_defaults_for_omitted_sections() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "category:\n  - tag: Bolsos\n    contains_any: [bolso, bag]\n",
        )
        .unwrap();
        let rules = load_extraction_rules(&path).unwrap();
        assert_eq!(rules.category.0.len(), 1);
        assert_eq!(rules.gender, ExtractionRules::default().gender);
        assert_eq!(rules.selectors, ExtractionRules::default().selectors);
    }

    #[test]
    fn report_groups_prices_by_brand_and_category() {
        let rec = |brand: &str, category: &str, price: Option<f64>, n: u32| {
            ProductRecord::new("Prenda", format!("https://x/{n}"), brand)
                .unwrap()
                .with_price(price)
                .with_tags(None, Some(category))
        };
        let records = vec![
            rec("ZARA", "Camisetas", Some(10.0), 1),
            rec("ZARA", "Camisetas", Some(20.0), 2),
            rec("ZARA", "Vestidos", Some(45.0), 3),
            rec("MANGO", "Vestidos", Some(30.0), 4),
            rec("MANGO", "Vestidos", None, 5),
        ];

        let by_brand = price_stats_by(&records, |r| r.brand.clone());
        assert_eq!(by_brand["ZARA"].count, 3);
        assert_eq!(by_brand["ZARA"].mean, 25.0);
        assert_eq!(by_brand["MANGO"].count, 1);

        let md = catalog_report_markdown(&records);
        assert!(md.contains("| ZARA | Camisetas | 2 | 10.00 | 20.00 | 15.00 |"));
        assert!(md.contains("| MANGO | 1 | 30.00 | 30.00 | 30.00 |"));
        assert!(md.contains("- Products: 5"));
    }

    #[test]
    fn empty_catalog_report_has_headers_only() {
        let md = catalog_report_markdown(&[]);
        assert!(md.contains("- Brands: 0"));
        assert!(md.contains("## By Brand and Category"));
    }
}
