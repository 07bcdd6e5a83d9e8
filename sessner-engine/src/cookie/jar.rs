use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{domain_lookup_keys, path_matches, Cookie};

/// Per-session cookie store: `domain → path → name → Cookie`.
///
/// Domain keys are stored verbatim as received, with or without a leading
/// dot. `BTreeMap` keeps snapshots deterministic so an export/import
/// round-trip is byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SessionCookieJar {
    entries: BTreeMap<String, BTreeMap<String, BTreeMap<String, Cookie>>>,
}

impl SessionCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by equivalence key. Returns the replaced cookie, if any.
    ///
    /// An already-expired cookie is never stored. Replacement keeps the
    /// prior creation time so header ordering stays stable, and replacing
    /// a cookie with an identical one is a no-op.
    pub fn store(&mut self, mut cookie: Cookie, now: i64) -> Option<Cookie> {
        if cookie.is_expired(now) {
            return None;
        }
        let slot = self
            .entries
            .entry(cookie.domain.clone())
            .or_default()
            .entry(cookie.path.clone())
            .or_default();
        if let Some(prior) = slot.get(&cookie.name) {
            cookie.created_at = prior.created_at;
        }
        slot.insert(cookie.name.clone(), cookie)
    }

    /// Matching cookies for a request at `(host, path)`, ordered by
    /// (path length desc, creation time asc) per RFC 6265 §5.4 so the
    /// most specific path wins for duplicate names.
    pub fn cookies_for(&self, host: &str, path: &str, now: i64) -> Vec<Cookie> {
        let mut out = Vec::new();
        for key in domain_lookup_keys(host) {
            let Some(paths) = self.entries.get(&key) else {
                continue;
            };
            for (cookie_path, names) in paths {
                if !path_matches(cookie_path, path) {
                    continue;
                }
                out.extend(names.values().filter(|c| !c.is_expired(now)).cloned());
            }
        }
        out.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });
        out
    }

    pub fn remove(&mut self, domain: &str, path: &str, name: &str) -> Option<Cookie> {
        let paths = self.entries.get_mut(domain)?;
        let names = paths.get_mut(path)?;
        let removed = names.remove(name);
        if names.is_empty() {
            paths.remove(path);
        }
        if paths.is_empty() {
            self.entries.remove(domain);
        }
        removed
    }

    pub fn get(&self, domain: &str, path: &str, name: &str) -> Option<&Cookie> {
        self.entries.get(domain)?.get(path)?.get(name)
    }

    /// Drop every expired cookie. Returns how many were removed.
    pub fn purge_expired(&mut self, now: i64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, paths| {
            paths.retain(|_, names| {
                names.retain(|_, c| {
                    let keep = !c.is_expired(now);
                    if !keep {
                        removed += 1;
                    }
                    keep
                });
                !names.is_empty()
            });
            !paths.is_empty()
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.entries
            .values()
            .flat_map(|paths| paths.values())
            .flat_map(|names| names.values())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
