//! The tab workspace state that gets captured, encrypted, and synced.

use serde::{Deserialize, Serialize};

/// One open browser tab at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabRecord {
    /// The tab's current URL.
    pub url: String,
    /// The tab's title at capture time.
    pub title: String,
    /// Favicon reference, if the browser exposed one.
    pub favicon_url: Option<String>,
    /// Window the tab belongs to.
    pub window_id: u32,
    /// Position of the tab within its window.
    pub index: u32,
    /// Whether the tab was the active one in its window.
    pub active: bool,
    /// Whether the tab was pinned.
    pub pinned: bool,
}

impl TabRecord {
    /// Sort a captured tab list into canonical order.
    ///
    /// The codec serializes tabs in (window, position, url) order so that
    /// two captures of the same workspace always produce identical bytes,
    /// regardless of the order the platform enumerated them in.
    pub fn canonicalize(tabs: &mut [TabRecord]) {
        tabs.sort_by(|a, b| {
            (a.window_id, a.index, a.url.as_str()).cmp(&(b.window_id, b.index, b.url.as_str()))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(window_id: u32, index: u32, url: &str) -> TabRecord {
        TabRecord {
            url: url.to_string(),
            title: format!("title for {url}"),
            favicon_url: None,
            window_id,
            index,
            active: false,
            pinned: false,
        }
    }

    #[test]
    fn canonicalize_orders_by_window_then_index() {
        let mut tabs = vec![tab(2, 0, "https://c"), tab(1, 1, "https://b"), tab(1, 0, "https://a")];
        TabRecord::canonicalize(&mut tabs);

        let urls: Vec<&str> = tabs.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://b", "https://c"]);
    }

    #[test]
    fn canonicalize_is_stable_across_input_order() {
        let mut a = vec![tab(1, 0, "https://x"), tab(1, 1, "https://y")];
        let mut b = vec![tab(1, 1, "https://y"), tab(1, 0, "https://x")];
        TabRecord::canonicalize(&mut a);
        TabRecord::canonicalize(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn tab_record_serde_roundtrip() {
        let record = TabRecord {
            url: "https://example.com/page".into(),
            title: "Example".into(),
            favicon_url: Some("https://example.com/favicon.ico".into()),
            window_id: 3,
            index: 7,
            active: true,
            pinned: false,
        };

        let bytes = rmp_serde::to_vec(&record).unwrap();
        let restored: TabRecord = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(record, restored);
    }
}
