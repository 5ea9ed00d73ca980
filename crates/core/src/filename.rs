use std::borrow::Cow;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

pub const DEFAULT_FILENAME_PREFIX: &str = "thesisflow-backup";

static UTF8_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)filename\*\s*=\s*UTF-8''([^;]+)").expect("utf-8 filename pattern")
});

static PLAIN_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\s*=\s*"?([^";]+)"?"#).expect("plain filename pattern")
});

/// Extracts a file name from a `Content-Disposition` header value.
///
/// The RFC 5987 `filename*=UTF-8''...` form wins over a plain `filename=`.
/// Path separators are flattened so the result is always a bare file name.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let encoded = UTF8_FILENAME
        .captures(header)
        .and_then(|c| {
            urlencoding::decode(c[1].trim().trim_matches('"'))
                .ok()
                .map(Cow::into_owned)
        });

    let name = encoded.or_else(|| {
        PLAIN_FILENAME
            .captures(header)
            .map(|c| c[1].trim().to_string())
    })?;

    let name = sanitize_file_name(&name);
    if name.is_empty() { None } else { Some(name) }
}

/// `<prefix>-<YYYY-MM-DD_HH-mm-ss>.json`
pub fn default_backup_filename(prefix: &str, at: NaiveDateTime) -> String {
    format!("{prefix}-{}.json", at.format("%Y-%m-%d_%H-%M-%S"))
}

pub fn resolve_backup_filename(
    content_disposition: Option<&str>,
    prefix: &str,
    at: NaiveDateTime,
) -> String {
    content_disposition
        .and_then(filename_from_content_disposition)
        .unwrap_or_else(|| default_backup_filename(prefix, at))
}

fn sanitize_file_name(name: &str) -> String {
    let name = name.trim();
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "." | ".." => String::new(),
        _ => cleaned,
    }
}
