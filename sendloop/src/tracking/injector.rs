//! Tracking injection: wraps outbound links with click redirects and appends
//! an open-tracking pixel to rendered HTML.
//!
//! Anchors are enumerated with a real HTML parser, but the rewrite itself is
//! done by exact attribute-text substitution so every untouched byte of the
//! document survives verbatim. Anything the rewriter cannot locate textually
//! is left alone rather than risk dropping a destination (fail-open).

use std::collections::HashSet;

use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::model::TrackingId;

/// Rewrite `html` so every `http`/`https` (and resolvable scheme-less)
/// anchor points at the click redirect and a 1x1 open pixel sits before the
/// closing body tag.
///
/// `mailto:`, `tel:`, and unknown schemes pass through untouched. Hrefs that
/// already start with `base_tracking_url` are skipped, which makes the
/// transformation idempotent.
pub fn inject(
    html: &str,
    tracking_id: &TrackingId,
    base_tracking_url: &str,
    site_base_url: Option<&str>,
) -> String {
    let base = base_tracking_url.trim_end_matches('/');
    let mut out = html.to_string();

    for href in collect_hrefs(html) {
        let target = match classify(&href, base, site_base_url) {
            LinkAction::Wrap(absolute) => absolute,
            LinkAction::Leave => continue,
        };

        let wrapped = click_url(base, tracking_id, &target);
        let before = out.len();
        out = rewrite_href(&out, &href, &wrapped);

        if out.len() == before {
            // The parsed attribute value never appeared literally in the
            // source (entity edge case); the original link stays intact.
            warn!(
                href = %truncate(&href),
                "tracking_href_not_rewritten"
            );
        }
    }

    append_pixel(&out, tracking_id, base)
}

enum LinkAction {
    Wrap(String),
    Leave,
}

/// Collect the distinct anchor href values in document order.
fn collect_hrefs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("Invalid selector");

    let mut seen = HashSet::new();
    let mut hrefs = Vec::new();

    for anchor in document.select(&selector) {
        if let Some(href) = anchor.value().attr("href") {
            if seen.insert(href.to_string()) {
                hrefs.push(href.to_string());
            }
        }
    }

    debug!(count = hrefs.len(), "anchor_hrefs_collected");
    hrefs
}

/// Decide what to do with one href value.
fn classify(href: &str, base_tracking_url: &str, site_base_url: Option<&str>) -> LinkAction {
    let trimmed = href.trim();
    if trimmed.is_empty() {
        return LinkAction::Leave;
    }
    // Already wrapped by a previous pass.
    if trimmed.starts_with(base_tracking_url) {
        return LinkAction::Leave;
    }

    match scheme_of(trimmed) {
        Some(scheme) => {
            let scheme = scheme.to_ascii_lowercase();
            if scheme == "http" || scheme == "https" {
                LinkAction::Wrap(trimmed.to_string())
            } else {
                // mailto:, tel:, and anything else pass through unchanged.
                LinkAction::Leave
            }
        }
        None => match site_base_url {
            // Scheme-less hrefs become absolute against the configured site
            // base before wrapping.
            Some(site) => match url::Url::parse(site).and_then(|s| s.join(trimmed)) {
                Ok(absolute) => LinkAction::Wrap(absolute.to_string()),
                Err(e) => {
                    warn!(href = %truncate(trimmed), error = %e, "relative_href_unresolvable");
                    LinkAction::Leave
                }
            },
            None => LinkAction::Leave,
        },
    }
}

/// Extract the URI scheme, if the href has one before any path/query/fragment
/// delimiter.
fn scheme_of(href: &str) -> Option<&str> {
    let colon = href.find(':')?;
    let candidate = &href[..colon];
    if candidate.is_empty() {
        return None;
    }
    if href[..colon].contains(['/', '?', '#']) {
        return None;
    }
    let mut chars = candidate.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        Some(candidate)
    } else {
        None
    }
}

/// Build the click redirect URL for one target.
fn click_url(base: &str, tracking_id: &TrackingId, target: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("{base}/click?tracking_id={tracking_id}&target={encoded}")
}

/// Replace `href="original"` occurrences with the wrapped URL, covering both
/// quote styles and the entity-encoded ampersand form the parser decodes.
fn rewrite_href(html: &str, original: &str, wrapped: &str) -> String {
    let mut out = html.to_string();
    let escaped_original = original.replace('&', "&amp;");
    let escaped_wrapped = wrapped.replace('&', "&amp;");

    for quote in ['"', '\''] {
        out = out.replace(
            &format!("href={quote}{original}{quote}"),
            &format!("href={quote}{wrapped}{quote}"),
        );
        if escaped_original != *original {
            out = out.replace(
                &format!("href={quote}{escaped_original}{quote}"),
                &format!("href={quote}{escaped_wrapped}{quote}"),
            );
        }
    }
    out
}

/// Append the invisible open pixel immediately before the closing body tag,
/// or at document end when no body tag exists. Skipped when the document
/// already carries a pixel for this tracking base.
fn append_pixel(html: &str, tracking_id: &TrackingId, base: &str) -> String {
    if html.contains(&format!("{base}/open?tracking_id=")) {
        return html.to_string();
    }

    let pixel = format!(
        r#"<img src="{base}/open?tracking_id={tracking_id}" width="1" height="1" alt="" style="display:none;max-height:1px;" />"#
    );

    match html.to_ascii_lowercase().rfind("</body>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..pos]);
            out.push_str(&pixel);
            out.push_str(&html[pos..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(&pixel);
            out
        }
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(100) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://track.example.com/t";

    fn id() -> TrackingId {
        TrackingId::from("cafe0000cafe0000cafe0000cafe0000")
    }

    fn wrapped_count(html: &str) -> usize {
        html.matches(&format!("{BASE}/click?tracking_id=")).count()
    }

    fn pixel_count(html: &str) -> usize {
        html.matches(&format!("{BASE}/open?tracking_id=")).count()
    }

    #[test]
    fn test_wraps_every_http_anchor_and_adds_one_pixel() {
        let html = r#"
            <html><body>
                <a href="https://example.com/offer">Offer</a>
                <a href="http://example.com/news?id=7">News</a>
                <a href="https://other.com/page">Other</a>
            </body></html>
        "#;

        let out = inject(html, &id(), BASE, None);
        assert_eq!(wrapped_count(&out), 3);
        assert_eq!(pixel_count(&out), 1);
        assert!(out.contains("target=https%3A%2F%2Fexample.com%2Foffer"));
    }

    #[test]
    fn test_mailto_and_tel_are_byte_identical() {
        let html = r#"<body><a href="mailto:help@example.com">mail</a> <a href="tel:+15551234">call</a> <a href="https://example.com">x</a></body>"#;

        let out = inject(html, &id(), BASE, None);
        assert!(out.contains(r#"href="mailto:help@example.com""#));
        assert!(out.contains(r#"href="tel:+15551234""#));
        assert_eq!(wrapped_count(&out), 1);
    }

    #[test]
    fn test_unknown_scheme_passes_through() {
        let html = r#"<body><a href="ftp://files.example.com/a">f</a></body>"#;
        let out = inject(html, &id(), BASE, None);
        assert!(out.contains(r#"href="ftp://files.example.com/a""#));
        assert_eq!(wrapped_count(&out), 0);
    }

    #[test]
    fn test_scheme_less_href_resolved_against_site_base() {
        let html = r#"<body><a href="/pricing?plan=pro">Pricing</a></body>"#;
        let out = inject(html, &id(), BASE, Some("https://www.example.com"));
        assert_eq!(wrapped_count(&out), 1);
        assert!(out.contains("target=https%3A%2F%2Fwww.example.com%2Fpricing%3Fplan%3Dpro"));
    }

    #[test]
    fn test_scheme_less_without_site_base_untouched() {
        let html = r#"<body><a href="/pricing">Pricing</a></body>"#;
        let out = inject(html, &id(), BASE, None);
        assert!(out.contains(r#"href="/pricing""#));
        assert_eq!(wrapped_count(&out), 0);
    }

    #[test]
    fn test_inject_is_idempotent() {
        let html = r#"
            <html><body>
                <p>Hi {{first_name}}</p>
                <a href="https://example.com/a?x=1&amp;y=2">A</a>
                <a href="mailto:x@example.com">B</a>
            </body></html>
        "#;

        let once = inject(html, &id(), BASE, None);
        let twice = inject(&once, &id(), BASE, None);
        assert_eq!(once, twice);
        assert_eq!(pixel_count(&twice), 1);
    }

    #[test]
    fn test_entity_encoded_ampersand_href_rewritten() {
        let html = r#"<body><a href="https://example.com/a?x=1&amp;y=2">A</a></body>"#;
        let out = inject(html, &id(), BASE, None);
        assert_eq!(wrapped_count(&out), 1);
        // Query separator survives inside the percent-encoded target.
        assert!(out.contains("x%3D1%26y%3D2"));
    }

    #[test]
    fn test_duplicate_hrefs_all_wrapped() {
        let html = r#"<body><a href="https://example.com/p">one</a><a href="https://example.com/p">two</a></body>"#;
        let out = inject(html, &id(), BASE, None);
        assert_eq!(wrapped_count(&out), 2);
    }

    #[test]
    fn test_pixel_before_closing_body_tag() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject(html, &id(), BASE, None);
        let pixel_pos = out.find("/open?tracking_id=").unwrap();
        let body_pos = out.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[test]
    fn test_pixel_appended_when_no_body_tag() {
        let html = "<p>fragment</p>";
        let out = inject(html, &id(), BASE, None);
        assert!(out.starts_with("<p>fragment</p><img "));
        assert_eq!(pixel_count(&out), 1);
    }

    #[test]
    fn test_single_quoted_href_rewritten() {
        let html = "<body><a href='https://example.com/q'>q</a></body>";
        let out = inject(html, &id(), BASE, None);
        assert_eq!(wrapped_count(&out), 1);
    }
}
