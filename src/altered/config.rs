use once_cell::sync::Lazy;
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ALTERED_API_ROOT")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.altered.gg".to_string())
});

pub static WEB_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ALTERED_WEB_ROOT")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://www.altered.gg".to_string())
});

pub static BEARER_TOKEN: Lazy<Option<String>> = Lazy::new(|| non_empty("ALTERED_BEARER_TOKEN"));

pub static SESSION_COOKIE: Lazy<Option<String>> =
    Lazy::new(|| non_empty("ALTERED_SESSION_COOKIE"));

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
