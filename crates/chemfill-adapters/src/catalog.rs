//! Vendor catalogue product pages (`{base}/products/{key}.html`) scraped for
//! their specification table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chemfill_core::{FieldName, SourceResult};
use chemfill_storage::HttpFetcher;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{text_or_none, FetchFailure, LookupMode, SourceClient};

pub struct CatalogPageClient {
    source_id: String,
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl CatalogPageClient {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            http,
        }
    }

    fn product_url(&self, key: &str) -> Result<String, FetchFailure> {
        let page = format!("{key}.html");
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| FetchFailure::Malformed(format!("invalid base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| FetchFailure::Malformed(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["products", page.as_str()]);
        Ok(url.into())
    }
}

#[async_trait]
impl SourceClient for CatalogPageClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn lookup_mode(&self) -> LookupMode {
        LookupMode::IdentifierOnly
    }

    async fn fetch(&self, key: &str, _hint_name: Option<&str>) -> Result<SourceResult, FetchFailure> {
        let url = self.product_url(key)?;
        let response = self.http.fetch_bytes(&self.source_id, &url).await?;
        let html = String::from_utf8_lossy(&response.body);
        let fields = parse_product_page(&html)?;

        if fields.is_empty() {
            return Ok(SourceResult::empty(&self.source_id));
        }
        if let Some(listed) = fields.get(&FieldName::CasNo).and_then(|v| v.as_deref()) {
            if !same_registry_number(listed, key) {
                debug!(source_id = %self.source_id, key, listed, "product page is for a different registry number");
                return Ok(SourceResult::empty(&self.source_id));
            }
        }
        Ok(SourceResult::found(&self.source_id, fields))
    }
}

fn same_registry_number(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>();
    norm(a) == norm(b)
}

fn field_for_label(label: &str) -> Option<FieldName> {
    let label = label.trim().trim_end_matches(':').trim().to_ascii_lowercase();
    let field = match label.as_str() {
        "product name" | "chemical name" | "name" => FieldName::ChemicalName,
        "cas" | "cas no" | "cas no." | "cas number" | "cas #" => FieldName::CasNo,
        "synonyms" | "synonym" => FieldName::Synonyms,
        "formula" | "molecular formula" | "mf" => FieldName::MolecularFormula,
        "mw" | "m.w." | "molecular weight" => FieldName::MolecularWeight,
        "appearance" | "form" => FieldName::Appearance,
        "storage" | "storage condition" | "storage conditions" => FieldName::Storage,
        "shipping" | "shipping condition" | "shipping conditions" => FieldName::ShippingConditions,
        "application" | "applications" | "use" => FieldName::Applications,
        _ => return None,
    };
    Some(field)
}

fn selector(css: &str) -> Result<Selector, FetchFailure> {
    Selector::parse(css).map_err(|e| FetchFailure::Malformed(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

/// Label/value pairs from every two-cell table row, plus the page heading as
/// a name fallback. An empty map means the page carries no specification.
pub(crate) fn parse_product_page(html: &str) -> Result<BTreeMap<FieldName, Option<String>>, FetchFailure> {
    let document = Html::parse_document(html);
    let rows = selector("tr")?;
    let cells = selector("th, td")?;
    let heading = selector("h1")?;

    let mut fields = BTreeMap::new();
    for row in document.select(&rows) {
        let mut row_cells = row.select(&cells);
        let (Some(label), Some(value)) = (row_cells.next(), row_cells.next()) else {
            continue;
        };
        let Some(field) = element_text(label).as_deref().and_then(field_for_label) else {
            continue;
        };
        if let Some(value) = element_text(value) {
            fields.entry(field).or_insert(Some(value));
        }
    }

    if !fields.is_empty() && !fields.contains_key(&FieldName::ChemicalName) {
        if let Some(title) = document.select(&heading).next().and_then(element_text) {
            fields.insert(FieldName::ChemicalName, Some(title));
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <h1>Formaldehyde solution</h1>
          <table class="spec">
            <tr><th>CAS No.</th><td>50-00-0</td></tr>
            <tr><th>Formula:</th><td>CH2O</td></tr>
            <tr><th>MW</th><td> 30.03 </td></tr>
            <tr><th>Appearance</th><td>Colourless
                liquid</td></tr>
            <tr><th>Storage</th><td>Store at room temperature</td></tr>
            <tr><th>Shipping</th><td>Normal</td></tr>
            <tr><th>Purity</th><td>37%</td></tr>
            <tr><td colspan="2">footnote</td></tr>
          </table>
        </body></html>"#;

    #[test]
    fn specification_rows_become_fields() {
        let fields = parse_product_page(PAGE).unwrap();
        assert_eq!(fields[&FieldName::CasNo].as_deref(), Some("50-00-0"));
        assert_eq!(fields[&FieldName::MolecularFormula].as_deref(), Some("CH2O"));
        assert_eq!(fields[&FieldName::MolecularWeight].as_deref(), Some("30.03"));
        assert_eq!(fields[&FieldName::Appearance].as_deref(), Some("Colourless liquid"));
        assert_eq!(fields[&FieldName::Storage].as_deref(), Some("Store at room temperature"));
        assert_eq!(fields[&FieldName::ShippingConditions].as_deref(), Some("Normal"));
        assert_eq!(
            fields[&FieldName::ChemicalName].as_deref(),
            Some("Formaldehyde solution")
        );
        assert!(!fields.contains_key(&FieldName::Applications));
    }

    #[test]
    fn page_without_specification_is_empty() {
        let fields = parse_product_page("<html><h1>Search results</h1><p>none</p></html>").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn registry_numbers_compare_on_digits() {
        assert!(same_registry_number("50-00-0", "50000"));
        assert!(!same_registry_number("50-00-0", "64-17-5"));
    }

    #[test]
    fn product_url_appends_html_page() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let client = CatalogPageClient::new("catalog", "https://vendor.example/", http);
        assert_eq!(
            client.product_url("50-00-0").unwrap(),
            "https://vendor.example/products/50-00-0.html"
        );
    }
}
