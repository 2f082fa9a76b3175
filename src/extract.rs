use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::ExtractDiagnostic;

const ITEM_MODULE: &str = "ItemModule";

/// Raw item records keyed by item id, in page order.
pub type RawItems = Map<String, Value>;

#[derive(Debug, Default)]
pub struct Extraction {
    pub items: RawItems,
    pub diagnostic: Option<ExtractDiagnostic>,
}

impl Extraction {
    fn degraded(diagnostic: ExtractDiagnostic) -> Self {
        error!(%diagnostic, "State extraction failed");
        Self {
            items: Map::new(),
            diagnostic: Some(diagnostic),
        }
    }
}

/// Reads the JSON state blob embedded in the account page.
pub struct StateExtractor {
    script_id: String,
}

impl StateExtractor {
    pub fn new(script_id: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
        }
    }

    /// Never fails: a missing or unreadable blob yields no items plus a diagnostic.
    pub fn extract(&self, markup: &str) -> Extraction {
        let Some(blob) = self.state_blob(markup) else {
            return Extraction::degraded(ExtractDiagnostic::LayoutChanged {
                script_id: self.script_id.clone(),
            });
        };

        let state: Value = match serde_json::from_str(blob.trim()) {
            Ok(state) => state,
            Err(e) => return Extraction::degraded(ExtractDiagnostic::MalformedState(e.to_string())),
        };

        match state.get(ITEM_MODULE) {
            Some(Value::Object(items)) => {
                debug!(count = items.len(), "Extracted raw items");
                Extraction {
                    items: items.clone(),
                    diagnostic: None,
                }
            }
            Some(other) => Extraction::degraded(ExtractDiagnostic::MalformedState(format!(
                "{} is not an object: {}",
                ITEM_MODULE,
                type_name(other)
            ))),
            None => Extraction::degraded(ExtractDiagnostic::LayoutChanged {
                script_id: format!("{}.{}", self.script_id, ITEM_MODULE),
            }),
        }
    }

    fn state_blob(&self, markup: &str) -> Option<String> {
        let document = Html::parse_document(markup);
        // attribute form keeps ids that are not valid CSS identifiers selectable
        let selector = Selector::parse(&format!("script[id=\"{}\"]", self.script_id.replace('"', ""))).ok()?;
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(script: &str) -> String {
        format!(
            "<html><head><title>impulse</title></head><body><div id=\"app\"></div>{}</body></html>",
            script
        )
    }

    #[test]
    fn extracts_items_in_page_order() {
        let markup = page(
            r#"<script id="SIGI_STATE" type="application/json">{"ItemModule":{"900":{"id":"900","desc":"b"},"100":{"id":"100","desc":"a"}},"UserModule":{}}</script>"#,
        );

        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);

        assert!(extraction.diagnostic.is_none());
        let keys: Vec<&String> = extraction.items.keys().collect();
        assert_eq!(keys, vec!["900", "100"]);
        assert_eq!(extraction.items["100"]["desc"], "a");
    }

    #[test]
    fn missing_script_signals_layout_change() {
        let markup = page(r#"<script id="__NEXT_DATA__">{}</script>"#);

        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);

        assert!(extraction.items.is_empty());
        assert_eq!(
            extraction.diagnostic,
            Some(ExtractDiagnostic::LayoutChanged {
                script_id: "SIGI_STATE".to_string()
            })
        );
    }

    #[test]
    fn broken_json_signals_malformed_state() {
        let markup = page(r#"<script id="SIGI_STATE">{"ItemModule": {"1": </script>"#);

        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);

        assert!(extraction.items.is_empty());
        assert!(matches!(
            extraction.diagnostic,
            Some(ExtractDiagnostic::MalformedState(_))
        ));
    }

    #[test]
    fn empty_script_is_malformed() {
        let markup = page(r#"<script id="SIGI_STATE"></script>"#);
        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);
        assert!(matches!(
            extraction.diagnostic,
            Some(ExtractDiagnostic::MalformedState(_))
        ));
    }

    #[test]
    fn state_without_item_module_is_layout_change() {
        let markup = page(r#"<script id="SIGI_STATE">{"UserModule":{}}</script>"#);
        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);
        assert!(extraction.items.is_empty());
        assert!(matches!(
            extraction.diagnostic,
            Some(ExtractDiagnostic::LayoutChanged { .. })
        ));
    }

    #[test]
    fn empty_item_module_is_not_a_diagnostic() {
        let markup = page(r#"<script id="SIGI_STATE">{"ItemModule":{}}</script>"#);
        let extraction = StateExtractor::new("SIGI_STATE").extract(&markup);
        assert!(extraction.items.is_empty());
        assert!(extraction.diagnostic.is_none());
    }

    #[test]
    fn plain_text_markup_degrades() {
        let extraction = StateExtractor::new("SIGI_STATE").extract("Access denied");
        assert!(extraction.items.is_empty());
        assert!(extraction.diagnostic.is_some());
    }
}
