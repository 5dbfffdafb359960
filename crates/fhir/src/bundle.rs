//! FHIR `Bundle` search sets.
//!
//! Search endpoints answer with a `searchset` bundle carrying the total match count (before
//! paging), the page of matching resources and optional `self`/`next`/`previous` links.

use serde::Serialize;
use serde_json::Value;

// ============================================================================
// Public domain-level types
// ============================================================================

/// One resource in a search set.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleEntry {
    /// Absolute or server-relative URL of the resource.
    pub full_url: String,
    /// The resource document.
    pub resource: Value,
}

/// Domain-level carrier for a page of search results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchSet {
    /// Total number of matches before paging.
    pub total: usize,
    pub entries: Vec<BundleEntry>,
    pub self_link: Option<String>,
    pub next_link: Option<String>,
    pub previous_link: Option<String>,
}

// ============================================================================
// Public Bundle operations
// ============================================================================

/// Bundle operations.
///
/// This is a zero-sized type used for namespacing bundle-related operations.
pub struct Bundle;

impl Bundle {
    /// Render a search set as a FHIR `Bundle` document.
    pub fn searchset(set: &SearchSet) -> Value {
        let mut link = Vec::new();
        for (relation, url) in [
            ("self", &set.self_link),
            ("next", &set.next_link),
            ("previous", &set.previous_link),
        ] {
            if let Some(url) = url {
                link.push(BundleLinkWire {
                    relation,
                    url: url.clone(),
                });
            }
        }

        let wire = BundleWire {
            resource_type: "Bundle",
            bundle_type: "searchset",
            total: set.total,
            link,
            entry: set
                .entries
                .iter()
                .map(|e| BundleEntryWire {
                    full_url: e.full_url.clone(),
                    resource: e.resource.clone(),
                    search: SearchWire { mode: "match" },
                })
                .collect(),
        };

        // Serialising this wire struct cannot fail: every field is a string, number or JSON value.
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Serialize)]
struct BundleWire {
    #[serde(rename = "resourceType")]
    resource_type: &'static str,
    #[serde(rename = "type")]
    bundle_type: &'static str,
    total: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    link: Vec<BundleLinkWire>,
    entry: Vec<BundleEntryWire>,
}

#[derive(Serialize)]
struct BundleLinkWire {
    relation: &'static str,
    url: String,
}

#[derive(Serialize)]
struct BundleEntryWire {
    #[serde(rename = "fullUrl")]
    full_url: String,
    resource: Value,
    search: SearchWire,
}

#[derive(Serialize)]
struct SearchWire {
    mode: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_searchset_has_total_and_no_entries() {
        let bundle = Bundle::searchset(&SearchSet::default());

        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "searchset");
        assert_eq!(bundle["total"], 0);
        assert_eq!(bundle["entry"], json!([]));
        assert!(bundle.get("link").is_none());
    }

    #[test]
    fn searchset_carries_entries_and_links() {
        let set = SearchSet {
            total: 3,
            entries: vec![BundleEntry {
                full_url: "/fhir/Substance/abc".into(),
                resource: json!({"resourceType": "Substance"}),
            }],
            self_link: Some("/fhir/Substance?_count=1&_offset=0".into()),
            next_link: Some("/fhir/Substance?_count=1&_offset=1".into()),
            previous_link: None,
        };
        let bundle = Bundle::searchset(&set);

        assert_eq!(bundle["total"], 3);
        assert_eq!(bundle["entry"][0]["fullUrl"], "/fhir/Substance/abc");
        assert_eq!(bundle["entry"][0]["resource"]["resourceType"], "Substance");
        assert_eq!(bundle["entry"][0]["search"]["mode"], "match");
        assert_eq!(bundle["link"][1]["relation"], "next");
        assert_eq!(bundle["link"].as_array().map(Vec::len), Some(2));
    }
}
