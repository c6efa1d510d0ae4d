//! Page view models handed to the template renderer.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::domain::{CategoryName, CustomerWithRentals, FilmDetail, FilmWithActors};

/// Site-wide template values (site title, navigation labels, ...) loaded once
/// at startup and merged into every page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteMetadata(Arc<Map<String, Value>>);

impl SiteMetadata {
    pub fn new(values: Map<String, Value>) -> Self {
        Self(Arc::new(values))
    }

    /// Parses a JSON object. Anything other than an object is rejected.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let values: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self::new(values))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SiteMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

// `site` is flattened first so page keys override metadata keys of the same
// name once the page is turned into a `serde_json::Value`.

#[derive(Debug, Clone, Serialize)]
pub struct LandingPage {
    #[serde(flatten)]
    pub site: SiteMetadata,
    pub page_title: String,
    pub movies: Vec<FilmWithActors>,
    pub categories: Vec<CategoryName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MovieListingPage {
    #[serde(flatten)]
    pub site: SiteMetadata,
    pub page_title: String,
    pub movies: Vec<FilmDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerListingPage {
    #[serde(flatten)]
    pub site: SiteMetadata,
    pub page_title: String,
    pub customers: Vec<CustomerWithRentals>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_metadata_that_is_not_an_object() {
        assert!(SiteMetadata::from_json("[1, 2]").is_err());
    }

    #[test]
    fn page_keys_override_metadata_keys() {
        let site = SiteMetadata::from_json(r#"{"site_title": "Catalog", "page_title": "stale"}"#)
            .expect("metadata");
        let page = MovieListingPage {
            site,
            page_title: "Movies".into(),
            movies: Vec::new(),
        };

        let value = serde_json::to_value(&page).expect("serialize");
        assert_eq!(value["site_title"], json!("Catalog"));
        assert_eq!(value["page_title"], json!("Movies"));
        assert_eq!(value["movies"], json!([]));
    }
}
