use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

pub const DEFAULT_LOCALE: &str = "fr-fr";

static LOCALE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z]{2}-[a-z]{2}$").expect("locale pattern"));

pub fn is_valid_locale(value: &str) -> bool {
    LOCALE.is_match(value)
}

/// Locale from the first path segment of a front-end URL, e.g.
/// `https://www.altered.gg/en-us/cards` gives `en-us`.
pub fn locale_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let first = parsed.path_segments()?.next()?;
    is_valid_locale(first).then(|| first.to_lowercase())
}

/// Explicit hint when it parses, otherwise [`DEFAULT_LOCALE`].
pub fn detect_locale(context_url: Option<&str>) -> String {
    context_url
        .and_then(locale_from_url)
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
}

pub fn locale_warning(page_url: &str, table_locale: Option<&str>) -> Option<String> {
    let page = locale_from_url(page_url)?;
    let table = table_locale?;
    (page != table).then(|| format!("Page locale ({page}) ≠ Dictionary ({table})"))
}
