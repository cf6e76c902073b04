//! Secret redaction for anything written to the ledger or the logs.
//!
//! Passes, in order:
//!
//! 1. Literal values of secrets read through [`secret_env`].
//! 2. Bot tokens (three dot-separated base64url segments starting with `MT`).
//! 3. Inside URLs, path segments and query values of 20+ token characters
//!    that mix letters and digits (webhook tokens, signed query strings).
//! 4. Any other run of 20+ ASCII alphanumerics that does not sit inside a
//!    file path. Path fragments are left alone so exporter output that
//!    mentions archive locations stays readable.

use regex::Regex;
use std::sync::{OnceLock, RwLock};

pub const TOKEN_MASK: &str = "***DISCORD_TOKEN_MASKED***";
pub const KEY_MASK: &str = "***API_KEY_MASKED***";

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"MT[A-Za-z0-9_-]{20,}\.[A-Za-z0-9_-]{6}\.[A-Za-z0-9_-]{27}")
            .expect("static regex")
    })
}

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9]{20,}").expect("static regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("static regex"))
}

fn url_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_-]{20,}").expect("static regex"))
}

/// Shorter values are too likely to collide with ordinary words.
const MIN_SECRET_LEN: usize = 8;

fn secrets() -> &'static RwLock<Vec<String>> {
    static SECRETS: OnceLock<RwLock<Vec<String>>> = OnceLock::new();
    SECRETS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Remember a configured secret so every later mask redacts it verbatim.
pub fn register_secret(value: &str) {
    let value = value.trim();
    if value.len() < MIN_SECRET_LEN {
        return;
    }
    if let Ok(mut known) = secrets().write() {
        if !known.iter().any(|k| k == value) {
            known.push(value.to_string());
            // longest first so a secret containing another is masked whole
            known.sort_by_key(|k| std::cmp::Reverse(k.len()));
        }
    }
}

/// Read a secret from the environment and register it for masking.
/// Empty values count as unset.
pub fn secret_env(name: &str) -> Option<String> {
    let value = std::env::var(name).ok().filter(|v| !v.trim().is_empty())?;
    register_secret(&value);
    Some(value)
}

fn mask_registered(text: &str) -> String {
    let Ok(known) = secrets().read() else {
        return text.to_string();
    };
    known
        .iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), KEY_MASK))
}

fn mask_urls(text: &str) -> String {
    url_re()
        .replace_all(text, |caps: &regex::Captures| {
            let url = caps.get(0).map_or("", |m| m.as_str());
            url_segment_re()
                .replace_all(url, |seg: &regex::Captures| {
                    let s = seg.get(0).map_or("", |m| m.as_str());
                    let letters = s.bytes().any(|b| b.is_ascii_alphabetic());
                    let digits = s.bytes().any(|b| b.is_ascii_digit());
                    if letters && digits {
                        KEY_MASK.to_string()
                    } else {
                        s.to_string()
                    }
                })
                .into_owned()
        })
        .into_owned()
}

/// Redact credentials and long opaque tokens from `text`.
pub fn mask_sensitive(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let literal = mask_registered(text);
    let tokens = token_re().replace_all(&literal, TOKEN_MASK);
    let masked = mask_urls(&tokens);
    let source: &str = &masked;

    key_re()
        .replace_all(source, |caps: &regex::Captures| {
            let m = caps.get(0).expect("group 0 always present");
            if near_path(source, m.start()) {
                m.as_str().to_string()
            } else {
                KEY_MASK.to_string()
            }
        })
        .into_owned()
}

/// True when a `/` appears within the 40-byte window centred on `offset`.
fn near_path(text: &str, offset: usize) -> bool {
    let bytes = text.as_bytes();
    let start = offset.saturating_sub(20);
    let end = (start + 40).min(bytes.len());
    bytes[start..end].contains(&b'/')
}

/// Mask and collapse to a single line so a detail never splits a ledger entry.
pub fn mask_single_line(text: &str) -> String {
    mask_sensitive(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_bot_token() {
        let token = format!(
            "MT{}.{}.{}",
            "A".repeat(22),
            "abcdef",
            "b".repeat(27)
        );
        let out = mask_sensitive(&format!("export -t {} -c 123", token));
        assert!(out.contains(TOKEN_MASK));
        assert!(!out.contains(&token));
    }

    #[test]
    fn masks_long_opaque_keys() {
        let out = mask_sensitive("secret=DO00ABCDEFGHIJKLMNOPQRSTUV done");
        assert_eq!(out, format!("secret={} done", KEY_MASK));
    }

    #[test]
    fn leaves_paths_alone() {
        let text = "wrote /data/archives/raw/1234567890123456789012345.json";
        assert_eq!(mask_sensitive(text), text);
    }

    #[test]
    fn short_words_untouched() {
        let text = "Exported 42 messages from general";
        assert_eq!(mask_sensitive(text), text);
    }

    #[test]
    fn single_line_collapses_newlines() {
        assert_eq!(mask_single_line("line one\nline  two\r\n"), "line one line two");
    }

    #[test]
    fn masks_webhook_token_in_url() {
        let text = "error sending request for url \
            (https://hooks.example.com/api/webhooks/123456789012345678/aB3dEf9hIj_kLmN0pQrStU-vWxYz)";
        let out = mask_sensitive(text);
        assert!(!out.contains("aB3dEf9hIj"), "{}", out);
        assert!(out.contains("https://hooks.example.com/api/webhooks/123456789012345678/"));
        assert!(out.contains(KEY_MASK));
    }

    #[test]
    fn url_with_plain_words_is_untouched() {
        let text = "uploaded https://cdn.example.com/announcements-and-news.html";
        assert_eq!(mask_sensitive(text), text);
    }

    #[test]
    fn masks_registered_secret_verbatim() {
        // short, path-adjacent and not token-shaped: only the literal pass catches it
        register_secret("pw/hunter2-x");
        let out = mask_sensitive("auth failed for pw/hunter2-x at /srv/data");
        assert_eq!(out, format!("auth failed for {} at /srv/data", KEY_MASK));
    }

    #[test]
    fn short_values_are_not_registered() {
        register_secret("abc");
        assert_eq!(mask_sensitive("abc def"), "abc def");
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(mask_sensitive(""), "");
    }
}
