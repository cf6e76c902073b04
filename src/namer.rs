//! Collision resolution for artifact keys and archived channel names.

use rand::Rng;
use regex::Regex;
use tracing::warn;

use crate::storage::ObjectStore;

/// Lowercase `[a-z0-9-]` token; any other character becomes `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Pick the storage key for `base` given the keys already under that prefix.
///
/// `base.html` when free, else `base-<N+1>.html` where `N` is the largest
/// numeric suffix present. Gaps are not reused and keys that do not match
/// `base-<digits>.html` do not count.
pub fn next_available_key(base: &str, existing: &[String]) -> String {
    let base_key = format!("{}.html", base);
    if !existing.iter().any(|k| k == &base_key) {
        return base_key;
    }

    let pattern = format!(r"^{}-(\d+)\.html$", regex::escape(base));
    let counter_re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return random_key(base),
    };

    let max = existing
        .iter()
        .filter_map(|k| counter_re.captures(k))
        .filter_map(|c| c.get(1).and_then(|n| n.as_str().parse::<u64>().ok()))
        .max()
        .unwrap_or(0);

    format!("{}-{}.html", base, max + 1)
}

fn random_key(base: &str) -> String {
    let n: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{}-{}.html", base, n)
}

/// Resolve a unique key for a channel's artifact against live storage.
///
/// A listing failure does not fail the upload: the key falls back to a
/// random numeric suffix.
pub async fn resolve_unique_key(channel_name: &str, store: &dyn ObjectStore) -> String {
    let base = sanitize_name(channel_name);
    match store.list_keys(&base).await {
        Ok(keys) => {
            let html: Vec<String> = keys.into_iter().filter(|k| k.ends_with(".html")).collect();
            next_available_key(&base, &html)
        }
        Err(e) => {
            warn!(prefix = %base, error = %e, "listing existing keys failed, using random suffix");
            random_key(&base)
        }
    }
}

/// `desired` if no sibling uses it, else the first free `desired-<n>`.
pub fn resolve_unique_channel_name<S: AsRef<str>>(desired: &str, siblings: &[S]) -> String {
    let taken = |name: &str| siblings.iter().any(|s| s.as_ref() == name);
    if !taken(desired) {
        return desired.to_string();
    }
    let mut counter = 1u32;
    loop {
        let candidate = format!("{}-{}", desired, counter);
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
