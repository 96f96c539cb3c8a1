//! Origin allowlist matching.
//!
//! Entries are either exact hosts (`app.example.com`) or wildcard
//! subdomain patterns (`*.example.com`). A wildcard entry also admits its
//! root domain. Wildcard comparison only looks at the trailing two labels
//! of the queried origin, so `*.a.example.com` never matches a subdomain.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static ROOT_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^.]+\.[^.]+)$").unwrap());

const WILDCARD_PREFIX: &str = "*.";

#[derive(Debug, Clone, Default)]
pub struct OriginMatcher {
    exact: HashSet<String>,
    suffixes: HashSet<String>,
}

impl OriginMatcher {
    pub fn new<I, S>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for entry in allowlist {
            let entry = entry.as_ref();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix(WILDCARD_PREFIX) {
                Some(root) => {
                    matcher.exact.insert(root.to_string());
                    matcher.suffixes.insert(root.to_string());
                }
                None => {
                    matcher.exact.insert(entry.to_string());
                }
            }
        }
        matcher
    }

    /// Membership test on the literal origin. Callers normalize first.
    pub fn matches(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return false;
        }
        if self.exact.contains(origin) {
            return true;
        }
        root_domain(origin).is_some_and(|root| self.suffixes.contains(root))
    }

    pub fn matches_opt(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|o| self.matches(o))
    }
}

fn root_domain(origin: &str) -> Option<&str> {
    ROOT_DOMAIN_RE
        .captures(origin)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Lower-cases and strips a leading `http://` or `https://`.
pub fn normalize_origin(origin: &str) -> String {
    let lowered = origin.trim().to_lowercase();
    lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered)
        .to_string()
}
