//! Merge per-page transcripts into the document output.
//!
//! Pure function of the page array: re-running it over cached page results
//! reproduces the stored output byte for byte. The `--- Page N ---` marker
//! lines and the section layout are consumed downstream and must not
//! change.

use super::types::PageText;

/// Concatenate page transcripts in page order.
///
/// Every page contributes a marker, failed pages included; a failed
/// page's body is simply empty.
pub fn merge_pages(pages: &[PageText]) -> (String, String) {
    let raw = merge_field(pages, |page| &page.raw);
    let boosted = merge_field(pages, |page| &page.boosted);
    (raw, boosted)
}

fn merge_field<'a, F>(pages: &'a [PageText], field: F) -> String
where
    F: Fn(&'a PageText) -> &'a str,
{
    let mut out = String::new();
    for (index, page) in pages.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        out.push_str(&format!("--- Page {} ---", index + 1));
        let body = field(page).trim_end();
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(raw: &str, boosted: &str) -> PageText {
        PageText {
            raw: raw.to_string(),
            boosted: boosted.to_string(),
        }
    }

    #[test]
    fn test_pages_in_order_with_markers() {
        let pages = vec![
            page("A | Vente | 2001-02-03 | 111 | null | null", "A!"),
            page("B | Vente | 2002-03-04 | 222 | null | null", "B!"),
        ];
        let (raw, boosted) = merge_pages(&pages);
        assert_eq!(
            raw,
            "--- Page 1 ---\nA | Vente | 2001-02-03 | 111 | null | null\n\
             --- Page 2 ---\nB | Vente | 2002-03-04 | 222 | null | null"
        );
        assert_eq!(boosted, "--- Page 1 ---\nA!\n--- Page 2 ---\nB!");
    }

    #[test]
    fn test_marker_order_matches_page_numbers() {
        let pages: Vec<PageText> = (0..12).map(|i| page(&format!("row{}", i), "x")).collect();
        let (raw, _) = merge_pages(&pages);

        let positions: Vec<usize> = (1..=12)
            .map(|n| raw.find(&format!("--- Page {} ---", n)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_failed_page_keeps_marker_with_empty_body() {
        let pages = vec![page("one", "one"), page("", ""), page("three", "three")];
        let (raw, _) = merge_pages(&pages);
        assert_eq!(
            raw,
            "--- Page 1 ---\none\n--- Page 2 ---\n--- Page 3 ---\nthree"
        );
    }

    #[test]
    fn test_merge_is_pure() {
        let pages = vec![page("a", "b"), page("c", "d")];
        assert_eq!(merge_pages(&pages), merge_pages(&pages));
    }

    #[test]
    fn test_empty_document() {
        let (raw, boosted) = merge_pages(&[]);
        assert!(raw.is_empty());
        assert!(boosted.is_empty());
    }

    #[test]
    fn test_trailing_whitespace_stripped_from_body() {
        let pages = vec![page("row\n\n", "row\n")];
        let (raw, boosted) = merge_pages(&pages);
        assert_eq!(raw, "--- Page 1 ---\nrow");
        assert_eq!(boosted, "--- Page 1 ---\nrow");
    }
}
