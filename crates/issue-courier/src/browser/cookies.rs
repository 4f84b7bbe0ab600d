//! Minimal cookie jar scoped to the portal domain.
//!
//! Only cookies set by the portal host (or its subdomains) are kept, and
//! they are only sent back to those hosts. Download mirrors on other hosts
//! never see the session.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    domain: String,
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    /// Jar for the registrable host of `base` (a leading `www.` is dropped).
    pub fn for_base(base: &Url) -> Self {
        let host = base.host_str().unwrap_or_default();
        let domain = host.strip_prefix("www.").unwrap_or(host).to_ascii_lowercase();
        Self {
            domain,
            cookies: BTreeMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn replace(&mut self, cookies: BTreeMap<String, String>) {
        self.cookies = cookies;
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn applies_to(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    /// Value for the `Cookie` request header, if anything applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        if self.cookies.is_empty() || !self.applies_to(url) {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        Some(pairs.join("; "))
    }

    /// Take in every `Set-Cookie` header of a response from `url`.
    pub fn absorb(&mut self, url: &Url, headers: &HeaderMap) {
        if !self.applies_to(url) {
            return;
        }
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                self.apply_set_cookie(raw);
            }
        }
    }

    fn apply_set_cookie(&mut self, raw: &str) {
        let mut parts = raw.split(';');
        let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let value = value.trim().trim_matches('"');

        let mut max_age = None;
        let mut expires = None;
        for attr in parts {
            let Some((key, val)) = attr.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "max-age" => max_age = val.trim().parse::<i64>().ok(),
                "expires" => expires = parse_expires(val.trim()),
                _ => {}
            }
        }
        // Max-Age wins over Expires when both are present.
        let expired = match max_age {
            Some(seconds) => seconds <= 0,
            None => expires.is_some_and(|at| at <= Utc::now()),
        };

        if expired || value.is_empty() {
            self.cookies.remove(name);
        } else {
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }
}

/// `Expires` date in the RFC 1123 form, or the older dashed form
/// (`Wed, 21-Oct-2015 07:28:00 GMT`).
fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|at| at.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
                .ok()
                .map(|at| Utc.from_utc_datetime(&at))
        })
}
