//! Correlate the final page URL with a recorded document response

use crate::recorder::{ResponseRecord, ResponseTable};

/// Find the record for `final_url`, tolerating one trailing slash either way
///
/// No other normalization happens: scheme, host case and query strings must
/// match exactly.
pub fn resolve<'a>(table: &'a ResponseTable, final_url: &str) -> Option<&'a ResponseRecord> {
    if let Some(record) = table.get(final_url) {
        return Some(record);
    }

    match final_url.strip_suffix('/') {
        Some(without_slash) => table.get(without_slash),
        None => table.get(&format!("{}/", final_url)),
    }
}

/// Like [`resolve`], but synthesizes a placeholder when nothing matches
pub fn match_response(table: &ResponseTable, final_url: &str) -> ResponseRecord {
    match resolve(table, final_url) {
        Some(record) => record.clone(),
        None => {
            log::warn!(
                "Could not find network response for final URL: {}. Creating a placeholder.",
                final_url
            );
            ResponseRecord::placeholder(final_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ResponseEvent;
    use chromiumoxide::cdp::browser_protocol::network::ResourceType;
    use std::collections::BTreeMap;

    fn table_with(entries: &[(&str, i64)]) -> ResponseTable {
        let mut table = ResponseTable::new();
        for (url, status) in entries {
            table.observe(ResponseEvent {
                url: url.to_string(),
                status: *status,
                headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
                resource_type: ResourceType::Document,
            });
        }
        table
    }

    #[test]
    fn test_exact_match() {
        let table = table_with(&[("https://example.com/", 200)]);
        let record = match_response(&table, "https://example.com/");

        assert_eq!(record.status_code, 200);
        assert_eq!(record.headers["content-type"], "text/html");
    }

    #[test]
    fn test_exact_match_preferred_over_fallback() {
        let table = table_with(&[("https://a.com/x", 301), ("https://a.com/x/", 200)]);

        assert_eq!(match_response(&table, "https://a.com/x").status_code, 301);
        assert_eq!(match_response(&table, "https://a.com/x/").status_code, 200);
    }

    #[test]
    fn test_appends_slash_when_final_url_has_none() {
        let table = table_with(&[("https://a.com/x/", 200)]);
        let record = match_response(&table, "https://a.com/x");

        assert_eq!(record.url, "https://a.com/x/");
        assert_eq!(record.status_code, 200);
    }

    #[test]
    fn test_strips_slash_when_final_url_has_one() {
        let table = table_with(&[("https://example.com", 200)]);
        let record = match_response(&table, "https://example.com/");

        assert_eq!(record.url, "https://example.com");
        assert_eq!(record.status_code, 200);
    }

    #[test]
    fn test_strips_only_one_slash() {
        let table = table_with(&[("https://a.com/x", 200)]);
        assert!(resolve(&table, "https://a.com/x//").is_none());
    }

    #[test]
    fn test_no_other_normalization() {
        let table = table_with(&[("https://a.com/x?b=1", 200), ("https://a.com/Y", 200)]);

        assert!(resolve(&table, "https://a.com/x").is_none());
        assert!(resolve(&table, "https://a.com/y").is_none());
        assert!(resolve(&table, "HTTPS://a.com/Y").is_none());
    }

    #[test]
    fn test_placeholder_on_miss() {
        let table = table_with(&[("https://a.com/", 200)]);
        let record = match_response(&table, "https://b.com/");

        assert_eq!(record.url, "https://b.com/");
        assert_eq!(record.status_code, 0);
        assert!(record.headers.is_empty());
    }

    #[test]
    fn test_placeholder_on_empty_table() {
        let record = match_response(&ResponseTable::new(), "");

        assert_eq!(record.url, "");
        assert!(record.is_placeholder());
    }
}
