// =============================================================================
// Save-path sanitization — cleans article fields before they reach the store
// =============================================================================
//
// Validation failures never reject an article outright; fields are cleaned in
// place and the save proceeds (log-and-continue belongs to the caller).
// =============================================================================

use chrono::{DateTime, Datelike, Utc};

use crate::types::Article;

/// Maximum stored headline length (chars).
pub const MAX_HEADLINE_LEN: usize = 500;
/// Maximum stored summary length (chars).
pub const MAX_SUMMARY_LEN: usize = 2_000;
/// Maximum stored URL length (chars).
pub const MAX_URL_LEN: usize = 2_048;

/// Remove null bytes and control characters (tab/newline/CR survive), then
/// collapse whitespace runs and cap the length.
pub fn sanitize_text(input: &str, max_len: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();

    let normalized: String = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.chars().take(max_len).collect()
}

/// Coerce NaN/±Inf to 0.0 and clip to ±1e10.
pub fn sanitize_float(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(-1e10, 1e10)
}

/// Keep only printable, non-whitespace URL characters and cap the length.
pub fn sanitize_url(url: &str) -> String {
    url.chars()
        .filter(|c| c.is_ascii_graphic())
        .take(MAX_URL_LEN)
        .collect()
}

/// Publish times outside [1900, 2100] are replaced with `now` (feed clock
/// bugs produce epoch-zero and far-future dates).
pub fn sanitize_publish_time(published_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let year = published_at.year();
    if (1900..=2100).contains(&year) {
        published_at
    } else {
        now
    }
}

/// Apply the full sanitization pass to an article before persistence.
pub fn sanitize_article(mut article: Article) -> Article {
    let now = Utc::now();
    article.headline = sanitize_text(&article.headline, MAX_HEADLINE_LEN);
    article.summary = sanitize_text(&article.summary, MAX_SUMMARY_LEN);
    article.url = sanitize_url(&article.url);
    article.published_at = sanitize_publish_time(article.published_at, now);
    article.sentiment = article.sentiment.map(sanitize_float);
    article.impact = article.impact.map(sanitize_float);
    article.weighted_contribution = article.weighted_contribution.map(sanitize_float);
    article
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn strips_null_bytes_and_control_chars() {
        let s = sanitize_text("head\0line\u{1}\u{7f} text", 100);
        assert!(!s.contains('\0'));
        assert!(!s.contains('\u{1}'));
        assert_eq!(s, "headline text");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(sanitize_text("a  b\t\tc\n\nd", 100), "a b c d");
    }

    #[test]
    fn caps_length() {
        let s = sanitize_text(&"x".repeat(600), 500);
        assert_eq!(s.chars().count(), 500);
    }

    #[test]
    fn float_coercion() {
        assert_eq!(sanitize_float(f64::NAN), 0.0);
        assert_eq!(sanitize_float(f64::INFINITY), 0.0);
        assert_eq!(sanitize_float(f64::NEG_INFINITY), 0.0);
        assert_eq!(sanitize_float(5e12), 1e10);
        assert_eq!(sanitize_float(-5e12), -1e10);
        assert_eq!(sanitize_float(0.75), 0.75);
    }

    #[test]
    fn url_keeps_printable_only() {
        let url = sanitize_url("https://example.com/a b\u{0}c\n");
        assert_eq!(url, "https://example.com/abc");
    }

    #[test]
    fn publish_time_out_of_range_becomes_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let ancient = Utc.with_ymd_and_hms(1850, 1, 1, 0, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2200, 1, 1, 0, 0, 0).unwrap();
        let fine = Utc.with_ymd_and_hms(2024, 5, 31, 9, 0, 0).unwrap();
        assert_eq!(sanitize_publish_time(ancient, now), now);
        assert_eq!(sanitize_publish_time(future, now), now);
        assert_eq!(sanitize_publish_time(fine, now), fine);
    }
}
