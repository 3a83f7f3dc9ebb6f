//! Adaptive product extraction: selector cascades, keyword classification and
//! landing-page discovery (category links, next page).

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use shelf_core::{parse_price, ProductRecord};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "shelf-extract";

/// A card selector must match strictly more elements than this to be adopted.
pub const MIN_CARD_MATCHES: usize = 5;
/// Upper bound on cards produced by the text-density fallback.
pub const MAX_FALLBACK_CARDS: usize = 50;
/// Fallback containers with more visible text than this are page wrappers, not cards.
pub const MAX_FALLBACK_CARD_TEXT: usize = 400;
/// Names shorter than this are icon labels or badges.
pub const MIN_NAME_CHARS: usize = 4;

/// Image attributes in preference order: lazy-load holders before eager `src`.
const IMAGE_ATTRS: [&str; 6] = ["data-src", "data-lazy-src", "data-original", "data-srcset", "srcset", "src"];

static CURRENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:[$€£¥]\s*\d+(?:[.,]\d+)?)|(?:\d+(?:[.,]\d+)?\s*(?:[$€£¥]|eur\b|usd\b|gbp\b))")
        .expect("valid currency regex")
});
static FALLBACK_CONTAINERS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("article, li, div, section").expect("valid container selector"));
static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

const NEXT_PAGE_SELECTORS: [&str; 5] = [
    "a[rel='next']",
    "link[rel='next']",
    "a.next",
    "a.pagination-next",
    "li.next a",
];
/// Compared against the whole lowercased anchor text or `aria-label`.
const NEXT_PAGE_LABELS: [&str; 4] = ["siguiente", "next", "›", "»"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid {field} selector {selector:?}: {message}")]
    InvalidSelector {
        field: &'static str,
        selector: String,
        message: String,
    },
    #[error("invalid site url {0:?}")]
    InvalidSiteUrl(String),
}

/// Ordered candidate selectors for one field; earlier entries win.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorTier(pub Vec<String>);

impl SelectorTier {
    pub fn new(selectors: &[&str]) -> Self {
        Self(selectors.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorTiers {
    pub card: SelectorTier,
    pub name: SelectorTier,
    pub price: SelectorTier,
    pub link: SelectorTier,
    pub image: SelectorTier,
}

impl Default for SelectorTiers {
    fn default() -> Self {
        Self {
            card: SelectorTier::new(&[
                "[data-product-id]",
                "[data-testid*='product-card']",
                ".product-card",
                ".product-item",
                ".product-tile",
                "li.product",
                "article.product",
                "[class*='product-card']",
                "[class*='ProductCard']",
                "[class*='product-item']",
                ".product",
                "article",
            ]),
            name: SelectorTier::new(&[
                "[data-testid*='product-name']",
                ".product-name",
                ".product-title",
                ".product-card__title",
                "[itemprop='name']",
                "[class*='name']",
                "[class*='title']",
                "h2",
                "h3",
                "h4",
                "a[title]",
                "a[href]",
            ]),
            price: SelectorTier::new(&[
                "[data-testid*='price']",
                "[itemprop='price']",
                ".price .current",
                ".price-current",
                ".sale-price",
                ".price",
                "[class*='price']",
                "[class*='Price']",
                "span.money",
            ]),
            link: SelectorTier::new(&[
                "a.product-link",
                "a[href*='/p/']",
                "a[href*='product']",
                "a[href]",
            ]),
            image: SelectorTier::new(&[
                "img[data-src]",
                "img[data-lazy-src]",
                "picture img",
                "img[src]",
                "img",
            ]),
        }
    }
}

/// Per-site tier replacements; a present field replaces the generic tier wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOverrides {
    pub card: Option<SelectorTier>,
    pub name: Option<SelectorTier>,
    pub price: Option<SelectorTier>,
    pub link: Option<SelectorTier>,
    pub image: Option<SelectorTier>,
}

impl SelectorTiers {
    pub fn overridden_by(&self, overrides: &SelectorOverrides) -> Self {
        let pick = |own: &SelectorTier, over: &Option<SelectorTier>| over.clone().unwrap_or_else(|| own.clone());
        Self {
            card: pick(&self.card, &overrides.card),
            name: pick(&self.name, &overrides.name),
            price: pick(&self.price, &overrides.price),
            link: pick(&self.link, &overrides.link),
            image: pick(&self.image, &overrides.image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub contains_any: Vec<String>,
}

impl TagRule {
    fn new(tag: &str, contains_any: &[&str]) -> Self {
        Self {
            tag: tag.to_string(),
            contains_any: contains_any.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Keyword table; rule order is match priority.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassificationTable(pub Vec<TagRule>);

impl ClassificationTable {
    pub fn default_gender() -> Self {
        Self(vec![
            TagRule::new("Mujer", &["mujer", "señora", "femenino", "women", "woman", "ladies"]),
            TagRule::new("Hombre", &["hombre", "caballero", "masculino", "/men", "men's", "mens"]),
            TagRule::new("Niños", &["niño", "niña", "infantil", "bebé", "kids", "baby", "junior"]),
        ])
    }

    pub fn default_category() -> Self {
        Self(vec![
            TagRule::new("Sudaderas", &["sudadera", "hoodie", "sweatshirt"]),
            TagRule::new("Camisetas", &["camiseta", "t-shirt", "tshirt"]),
            TagRule::new("Camisas", &["camisa", "blusa", "shirt", "blouse"]),
            TagRule::new("Pantalones", &["pantal", "vaquero", "jeans", "pants", "trousers", "chino"]),
            TagRule::new("Vestidos", &["vestido", "dress"]),
            TagRule::new("Faldas", &["falda", "skirt"]),
            TagRule::new("Chaquetas", &["chaqueta", "abrigo", "cazadora", "jacket", "coat", "blazer"]),
            TagRule::new("Jerseys", &["jersey", "cardigan", "sweater", "knitwear"]),
            TagRule::new("Zapatos", &["zapat", "calzado", "sandalia", "shoes", "sneaker"]),
            TagRule::new("Accesorios", &["accesorio", "complemento", "bolso", "cinturón", "accessor", "bags"]),
        ])
    }

    /// First rule with any keyword contained in the lowercased `text` + `url`.
    pub fn classify(&self, text: &str, url: &str) -> Option<&str> {
        let haystack = format!("{text} {url}").to_lowercase();
        self.0
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.tag.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    pub gender: ClassificationTable,
    pub category: ClassificationTable,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            gender: ClassificationTable::default_gender(),
            category: ClassificationTable::default_category(),
        }
    }
}

impl Classifier {
    pub fn classify_gender(&self, text: &str, url: &str) -> Option<&str> {
        self.gender.classify(text, url)
    }

    pub fn classify_category(&self, text: &str, url: &str) -> Option<&str> {
        self.category.classify(text, url)
    }
}

/// Landing-page link classified on both axes; one worklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLink {
    pub url: String,
    pub gender: String,
    pub category: String,
    #[serde(default)]
    pub text: String,
}

/// Brand-specific override keyed by a substring of the site host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub domain_contains: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub selectors: SelectorOverrides,
    /// Explicit category entry points; replaces link discovery when non-empty.
    #[serde(default)]
    pub categories: Vec<CategoryLink>,
}

/// Everything the extractor is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub selectors: SelectorTiers,
    pub gender: ClassificationTable,
    pub category: ClassificationTable,
    pub profiles: Vec<SiteProfile>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            selectors: SelectorTiers::default(),
            gender: ClassificationTable::default_gender(),
            category: ClassificationTable::default_category(),
            profiles: Vec::new(),
        }
    }
}

impl ExtractionRules {
    pub fn profile_for(&self, host: &str) -> Option<&SiteProfile> {
        let host = host.to_ascii_lowercase();
        self.profiles
            .iter()
            .find(|p| !p.domain_contains.is_empty() && host.contains(&p.domain_contains.to_ascii_lowercase()))
    }

    pub fn classifier(&self) -> Classifier {
        Classifier {
            gender: self.gender.clone(),
            category: self.category.clone(),
        }
    }
}

/// A value together with the selector that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub selector: String,
}

/// Compiled selector tier for one field.
#[derive(Debug, Clone)]
pub struct SelectorResolver {
    field: &'static str,
    entries: Vec<(String, Selector)>,
}

impl SelectorResolver {
    pub fn compile(field: &'static str, tier: &SelectorTier) -> Result<Self, ExtractError> {
        let entries = tier
            .0
            .iter()
            .map(|raw| {
                Selector::parse(raw)
                    .map(|sel| (raw.clone(), sel))
                    .map_err(|e| ExtractError::InvalidSelector {
                        field,
                        selector: raw.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { field, entries })
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    /// First selector, in tier order, whose matches under `node` include one
    /// that `accept` validates.
    pub fn resolve<'a, T>(
        &self,
        node: ElementRef<'a>,
        mut accept: impl FnMut(ElementRef<'a>) -> Option<T>,
    ) -> Option<Resolved<T>> {
        for (raw, sel) in &self.entries {
            if let Some(value) = node.select(sel).find_map(&mut accept) {
                return Some(Resolved {
                    value,
                    selector: raw.clone(),
                });
            }
        }
        None
    }

    /// First selector matching more than `min_matches` elements in the document.
    pub fn resolve_cards<'a>(
        &self,
        document: &'a Html,
        min_matches: usize,
    ) -> Option<Resolved<Vec<ElementRef<'a>>>> {
        for (raw, sel) in &self.entries {
            let matches = document.select(sel).collect::<Vec<_>>();
            debug!(selector = %raw, matches = matches.len(), "card candidate");
            if matches.len() > min_matches {
                return Some(Resolved {
                    value: matches,
                    selector: raw.clone(),
                });
            }
        }
        None
    }
}

/// How the cards of a page were located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CardStrategy {
    Selector(String),
    TextDensity,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub missing_name: usize,
    pub missing_price: usize,
    pub missing_link: usize,
    pub invalid_record: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.missing_name + self.missing_price + self.missing_link + self.invalid_record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractReport {
    pub records: Vec<ProductRecord>,
    pub strategy: CardStrategy,
    pub cards_seen: usize,
    pub dropped: DropCounts,
}

/// Page being extracted, plus the tags of the category link that led to it.
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub base_url: Url,
    pub gender: Option<String>,
    pub category: Option<String>,
}

impl ExtractContext {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            gender: None,
            category: None,
        }
    }

    pub fn for_category(base_url: Url, link: &CategoryLink) -> Self {
        Self {
            base_url,
            gender: Some(link.gender.clone()),
            category: Some(link.category.clone()),
        }
    }
}

#[derive(Debug)]
enum CardDrop {
    MissingName,
    MissingPrice,
    MissingLink,
    Invalid(shelf_core::RecordError),
}

/// Extractor bound to one site: compiled tiers, classifier, brand and profile.
#[derive(Debug, Clone)]
pub struct ProductExtractor {
    cards: SelectorResolver,
    names: SelectorResolver,
    prices: SelectorResolver,
    links: SelectorResolver,
    images: SelectorResolver,
    classifier: Classifier,
    brand: String,
    profile: Option<SiteProfile>,
}

impl ProductExtractor {
    pub fn new(tiers: &SelectorTiers, classifier: Classifier, brand: impl Into<String>) -> Result<Self, ExtractError> {
        Ok(Self {
            cards: SelectorResolver::compile("card", &tiers.card)?,
            names: SelectorResolver::compile("name", &tiers.name)?,
            prices: SelectorResolver::compile("price", &tiers.price)?,
            links: SelectorResolver::compile("link", &tiers.link)?,
            images: SelectorResolver::compile("image", &tiers.image)?,
            classifier,
            brand: brand.into(),
            profile: None,
        })
    }

    /// Build the extractor for the site behind `site_url`, applying the
    /// matching profile's selector overrides and display name.
    pub fn for_site(rules: &ExtractionRules, site_url: &str) -> Result<Self, ExtractError> {
        let url = Url::parse(site_url).map_err(|_| ExtractError::InvalidSiteUrl(site_url.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ExtractError::InvalidSiteUrl(site_url.to_string()))?;
        let profile = rules.profile_for(host).cloned();
        let tiers = match &profile {
            Some(p) => rules.selectors.overridden_by(&p.selectors),
            None => rules.selectors.clone(),
        };
        let brand = profile
            .as_ref()
            .and_then(|p| p.display_name.clone())
            .unwrap_or_else(|| brand_from_host(host));
        let mut extractor = Self::new(&tiers, rules.classifier(), brand)?;
        extractor.profile = profile;
        Ok(extractor)
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn extract(&self, markup: &str, ctx: &ExtractContext) -> ExtractReport {
        let document = Html::parse_document(markup);
        let (strategy, cards) = match self.cards.resolve_cards(&document, MIN_CARD_MATCHES) {
            Some(found) => (CardStrategy::Selector(found.selector), found.value),
            None => {
                let cards = text_density_cards(&document);
                if cards.is_empty() {
                    (CardStrategy::None, cards)
                } else {
                    (CardStrategy::TextDensity, cards)
                }
            }
        };
        debug!(url = %ctx.base_url, strategy = ?strategy, cards = cards.len(), "card strategy resolved");

        let mut records = Vec::with_capacity(cards.len());
        let mut dropped = DropCounts::default();
        for card in &cards {
            match self.extract_card(*card, ctx) {
                Ok(record) => records.push(record),
                Err(CardDrop::MissingName) => dropped.missing_name += 1,
                Err(CardDrop::MissingPrice) => dropped.missing_price += 1,
                Err(CardDrop::MissingLink) => dropped.missing_link += 1,
                Err(CardDrop::Invalid(err)) => {
                    debug!(error = %err, "card produced an invalid record");
                    dropped.invalid_record += 1;
                }
            }
        }

        ExtractReport {
            records,
            strategy,
            cards_seen: cards.len(),
            dropped,
        }
    }

    fn extract_card(&self, card: ElementRef<'_>, ctx: &ExtractContext) -> Result<ProductRecord, CardDrop> {
        let name = self
            .names
            .resolve(card, element_name)
            .map(|r| r.value)
            .ok_or(CardDrop::MissingName)?;
        let price = self
            .prices
            .resolve(card, element_price)
            .map(|r| r.value)
            .or_else(|| parse_price(&collapsed_text(card)))
            .ok_or(CardDrop::MissingPrice)?;
        let url = self
            .links
            .resolve(card, |el| element_link(el, &ctx.base_url))
            .map(|r| r.value)
            .or_else(|| (card.value().name() == "a").then(|| element_link(card, &ctx.base_url)).flatten())
            .ok_or(CardDrop::MissingLink)?;
        let image = self
            .images
            .resolve(card, |el| element_image(el, &ctx.base_url))
            .map(|r| r.value);

        let gender = ctx
            .gender
            .as_deref()
            .or_else(|| self.classifier.classify_gender(&name, url.as_str()));
        let category = ctx
            .category
            .as_deref()
            .or_else(|| self.classifier.classify_category(&name, url.as_str()));

        ProductRecord::new(&name, url.as_str(), self.brand.clone())
            .map(|record| {
                record
                    .with_price(Some(price))
                    .with_image(image.map(String::from))
                    .with_tags(gender, category)
            })
            .map_err(CardDrop::Invalid)
    }

    /// Category entry points of a landing page: links classified on both axes
    /// that stay on the landing page's domain, deduplicated by absolute url.
    /// A profile with an explicit category map short-circuits discovery.
    pub fn discover_categories(&self, markup: &str, base_url: &Url) -> Vec<CategoryLink> {
        if let Some(profile) = self.profile.as_ref().filter(|p| !p.categories.is_empty()) {
            return profile
                .categories
                .iter()
                .filter_map(|entry| {
                    let absolute = base_url.join(&entry.url).ok()?;
                    Some(CategoryLink {
                        url: absolute.to_string(),
                        ..entry.clone()
                    })
                })
                .collect();
        }

        let document = Html::parse_document(markup);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for anchor in document.select(&ANCHOR_SELECTOR) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if is_pseudo_href(href) {
                continue;
            }
            let Ok(mut absolute) = base_url.join(href) else {
                continue;
            };
            absolute.set_fragment(None);
            if !same_site(&absolute, base_url) {
                continue;
            }
            let text = collapsed_text(anchor);
            let (Some(gender), Some(category)) = (
                self.classifier.classify_gender(&text, href),
                self.classifier.classify_category(&text, href),
            ) else {
                continue;
            };
            if !seen.insert(absolute.to_string()) {
                continue;
            }
            out.push(CategoryLink {
                url: absolute.to_string(),
                gender: gender.to_string(),
                category: category.to_string(),
                text,
            });
        }
        debug!(base = %base_url, categories = out.len(), "category links discovered");
        out
    }
}

/// Brand label from a host: leading `www.`/`www2.` removed, first label uppercased.
pub fn brand_from_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("www2."))
        .unwrap_or(&host);
    host.split('.').next().unwrap_or_default().to_uppercase()
}

/// Pagination link of a listing page, if any.
pub fn find_next_page(markup: &str, current: &Url) -> Option<Url> {
    let document = Html::parse_document(markup);
    let usable = |href: &str| -> Option<Url> {
        let href = href.trim();
        if is_pseudo_href(href) {
            return None;
        }
        let mut next = current.join(href).ok()?;
        next.set_fragment(None);
        (same_site(&next, current) && next != *current).then_some(next)
    };

    for raw in NEXT_PAGE_SELECTORS {
        let Ok(sel) = Selector::parse(raw) else {
            continue;
        };
        if let Some(next) = document
            .select(&sel)
            .filter_map(|el| el.value().attr("href"))
            .find_map(usable)
        {
            return Some(next);
        }
    }

    document
        .select(&ANCHOR_SELECTOR)
        .filter(|a| {
            let label = collapsed_text(*a).to_lowercase();
            NEXT_PAGE_LABELS.contains(&label.as_str())
                || a.value().attr("aria-label").is_some_and(|l| NEXT_PAGE_LABELS.contains(&l.trim().to_lowercase().as_str()))
        })
        .filter_map(|a| a.value().attr("href"))
        .find_map(usable)
}

/// Innermost containers holding both a link and a currency amount; any container
/// that wraps another candidate is a grid or section, not a card.
fn text_density_cards(document: &Html) -> Vec<ElementRef<'_>> {
    let candidates = document
        .select(&FALLBACK_CONTAINERS)
        .filter(|el| el.select(&ANCHOR_SELECTOR).next().is_some())
        .filter(|el| {
            let text = collapsed_text(*el);
            text.chars().count() <= MAX_FALLBACK_CARD_TEXT && CURRENCY_PATTERN.is_match(&text)
        })
        .collect::<Vec<_>>();
    let wrappers = candidates
        .iter()
        .flat_map(|el| el.ancestors().map(|a| a.id()))
        .collect::<HashSet<_>>();
    candidates
        .into_iter()
        .filter(|el| !wrappers.contains(&el.id()))
        .take(MAX_FALLBACK_CARDS)
        .collect()
}

fn collapsed_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_name(el: ElementRef<'_>) -> Option<String> {
    let long_enough = |s: &String| s.chars().count() >= MIN_NAME_CHARS;
    text_or_none(&collapsed_text(el))
        .filter(long_enough)
        .or_else(|| el.value().attr("title").and_then(text_or_none).filter(long_enough))
}

fn element_price(el: ElementRef<'_>) -> Option<f64> {
    parse_price(&collapsed_text(el)).or_else(|| el.value().attr("content").and_then(parse_price))
}

fn element_link(el: ElementRef<'_>, base: &Url) -> Option<Url> {
    let href = el.value().attr("href")?.trim();
    if href.is_empty() || is_pseudo_href(href) {
        return None;
    }
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn element_image(el: ElementRef<'_>, base: &Url) -> Option<Url> {
    IMAGE_ATTRS.iter().find_map(|attr| {
        let raw = el.value().attr(attr)?;
        // srcset: first candidate, descriptor dropped
        let candidate = raw.split(',').next()?.split_whitespace().next()?;
        if candidate.starts_with("data:") {
            return None;
        }
        base.join(candidate).ok()
    })
}

fn is_pseudo_href(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    href.starts_with('#') || lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:")
}

fn same_site(a: &Url, b: &Url) -> bool {
    fn bare(u: &Url) -> Option<String> {
        let host = u.host_str()?.to_ascii_lowercase();
        Some(
            host.strip_prefix("www.")
                .or_else(|| host.strip_prefix("www2."))
                .map(str::to_string)
                .unwrap_or(host),
        )
    }
    matches!((bare(a), bare(b)), (Some(x), Some(y)) if x == y)
}
