//! Core product model and price normalization for Shelf.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "shelf-core";

/// Gender tag used when no keyword table entry matches.
pub const UNCLASSIFIED_GENDER: &str = "Unclassified";

/// Category tag used when no keyword table entry matches.
pub const GENERAL_CATEGORY: &str = "General";

/// Column order of every persisted catalog file.
pub const CANONICAL_COLUMNS: [&str; 7] = ["brand", "gender", "category", "name", "price", "url", "image"];

static PRICE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("valid price token regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("product name is empty")]
    EmptyName,
    #[error("product url is not absolute: {0}")]
    RelativeUrl(String),
}

/// One scraped listing.
///
/// Field declaration order is the canonical column order; serializers rely on it.
/// Price is optional so raw snapshots can hold cards whose price did not resolve;
/// only [`ProductRecord::is_catalogable`] records reach the canonical catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(default)]
    pub brand: String,
    #[serde(default = "default_gender")]
    pub gender: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub name: String,
    #[serde(default, with = "price_column")]
    pub price: Option<f64>,
    pub url: String,
    #[serde(default, rename = "image")]
    pub image_url: Option<String>,
}

fn default_gender() -> String {
    UNCLASSIFIED_GENDER.to_string()
}

fn default_category() -> String {
    GENERAL_CATEGORY.to_string()
}

impl ProductRecord {
    /// Build a record with sentinel tags, rejecting an empty name or a relative url.
    pub fn new(
        name: impl AsRef<str>,
        url: impl AsRef<str>,
        brand: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(RecordError::EmptyName);
        }
        let url = url.as_ref().trim();
        if Url::parse(url).is_err() {
            return Err(RecordError::RelativeUrl(url.to_string()));
        }
        Ok(Self {
            brand: brand.into(),
            gender: default_gender(),
            category: default_category(),
            name: name.to_string(),
            price: None,
            url: url.to_string(),
            image_url: None,
        })
    }

    pub fn with_price(mut self, price: Option<f64>) -> Self {
        self.price = price;
        self
    }

    pub fn with_image(mut self, image_url: Option<String>) -> Self {
        self.image_url = image_url;
        self
    }

    /// Attach tags; `None` maps to the unclassified/general sentinels.
    pub fn with_tags(mut self, gender: Option<&str>, category: Option<&str>) -> Self {
        self.gender = gender.unwrap_or(UNCLASSIFIED_GENDER).to_string();
        self.category = category.unwrap_or(GENERAL_CATEGORY).to_string();
        self
    }

    /// Whether this record may be retained in the canonical catalog.
    pub fn is_catalogable(&self) -> bool {
        !self.name.trim().is_empty()
            && self.price.is_some_and(|p| p.is_finite() && p > 0.0)
    }
}

/// Parse a locale-ambiguous price string.
///
/// Everything but digits, commas and dots is removed, then the first
/// `digits[(,|.)digits]` run is read with the separator taken as the decimal
/// point. "1.234,56" therefore reads as 1.234: the first run wins.
pub fn parse_price(text: &str) -> Option<f64> {
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let token = PRICE_TOKEN.find(&kept)?;
    token
        .as_str()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Canonical price text: plain decimal, dot separator, no currency, no exponent.
pub fn format_price(value: f64) -> String {
    format!("{value}")
}

mod price_column {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(price: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match price {
            Some(value) => serializer.serialize_str(&super::format_price(*value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => text
                .parse::<f64>()
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid price {text:?}: {e}"))),
        }
    }
}
