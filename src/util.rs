//! Common utility functions used across the codebase.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Current UTC time as an RFC3339 string with second precision.
///
/// All timestamps in the database are TEXT in this format so lexicographic
/// ordering matches chronological ordering.
pub fn utc_now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        .to_string()
}

/// Truncates a string to at most `max_chars` characters, adding "..." if truncated.
///
/// UTF-8 safe: respects character boundaries, so multi-byte content never panics.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    truncate_impl(s, max_chars, "...")
}

/// Truncates with a visible "\n... (truncated)" marker, suitable for persisted
/// prompt/response text where the cut must be obvious to a later reader.
pub fn truncate_with_note(s: &str, max_chars: usize) -> String {
    truncate_impl(s, max_chars, "\n... (truncated)")
}

fn truncate_impl(s: &str, max_chars: usize, suffix: &str) -> String {
    // Byte length is a cheap lower bound on char count.
    if s.len() <= max_chars {
        return s.to_string();
    }
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }

    let suffix_len = suffix.chars().count();
    if max_chars <= suffix_len {
        return suffix.chars().take(max_chars).collect();
    }
    let truncated: String = s.chars().take(max_chars - suffix_len).collect();
    format!("{}{}", truncated, suffix)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_text(text: &str) -> String {
    sha256_bytes(text.as_bytes())
}

pub async fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let data = tokio::fs::read(path).await?;
    Ok(sha256_bytes(&data))
}

/// Canonical JSON: sorted keys, compact separators. Used wherever a stable
/// hash or stable stored form of a JSON value is needed.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Read a text file, capping at `max_chars` with a visible truncation marker.
pub async fn safe_read_text(path: &Path, max_chars: usize) -> anyhow::Result<String> {
    let data = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&data).into_owned();
    if text.chars().count() <= max_chars {
        return Ok(text);
    }
    let capped: String = text.chars().take(max_chars).collect();
    Ok(format!("{}\n\n[TRUNCATED]\n", capped))
}

/// Sanitize arbitrary text into a filesystem-safe slug.
pub fn safe_slug(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_len));
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else if ch.is_whitespace() || ch == '/' || ch == '\\' {
            out.push('_');
        }
        // Everything else is dropped.
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_' || c == '-');
    let slug: String = trimmed.chars().take(max_len).collect();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

pub fn is_iso8601(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return false;
    }
    chrono::DateTime::parse_from_rfc3339(&v.replace('Z', "+00:00")).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_noop_when_short() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("", 10), "");
    }

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("abcdefghij", 6), "abc...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_str("日本語テスト", 5), "日本...");
        let result = truncate_with_note("é".repeat(100).as_str(), 40);
        assert!(result.ends_with("\n... (truncated)"));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let v: serde_json::Value = serde_json::json!({"b": 1, "a": {"z": 2, "y": [3, 4]}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":[3,4],"z":2},"b":1}"#);
    }

    #[test]
    fn test_safe_slug() {
        assert_eq!(safe_slug("Write the 2048 game", 60), "Write_the_2048_game");
        assert_eq!(safe_slug("///", 60), "item");
        assert_eq!(safe_slug("a/b\\c d", 60), "a_b_c_d");
    }

    #[test]
    fn test_uuid_and_iso_checks() {
        assert!(is_uuid("6f1e7a77-13f4-4c93-8a4b-7d9a6b1f0c2d"));
        assert!(!is_uuid("START"));
        assert!(is_iso8601("2025-05-01T10:00:00Z"));
        assert!(!is_iso8601("yesterday"));
    }

    mod proptest_truncate {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn truncate_result_within_limit(s in "\\PC{0,300}", n in 0usize..400) {
                let result = truncate_str(&s, n);
                prop_assert!(result.chars().count() <= n.max(1));
            }

            #[test]
            fn slug_is_filesystem_safe(s in "\\PC{0,120}") {
                let slug = safe_slug(&s, 60);
                prop_assert!(!slug.contains('/'));
                prop_assert!(!slug.contains('\\'));
                prop_assert!(!slug.is_empty());
            }
        }
    }
}
