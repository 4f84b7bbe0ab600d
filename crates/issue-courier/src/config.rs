//! Configuration loading and resolution.
//!
//! Everything is sourced from the process environment (the scheduler
//! injects it) and threaded through the pipeline as one [`Config`] value.
//! Variable names match the earlier shell-driven tool so existing
//! deployments keep working.

use crate::error::{CourierError, CourierResult};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default portal origin.
pub const DEFAULT_PORTAL_BASE: &str = "https://gihyo.jp";

const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_WORKDIR: &str = "./work";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const MAIL_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest download accepted before unpacking (100 MiB).
pub const DEFAULT_DOWNLOAD_LIMIT: u64 = 100 * 1024 * 1024;

/// Largest attachment handed to the relay (25 MiB).
pub const DEFAULT_ATTACHMENT_LIMIT: u64 = 25 * 1024 * 1024;

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Portal login credentials. Held in memory only.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: Secret,
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub timeout: Duration,
}

/// Size ceilings for downloads and attachments.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub download_limit: u64,
    pub attachment_limit: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            download_limit: DEFAULT_DOWNLOAD_LIMIT,
            attachment_limit: DEFAULT_ATTACHMENT_LIMIT,
        }
    }
}

/// On-disk locations owned by the courier.
#[derive(Debug, Clone)]
pub struct Paths {
    pub workdir: PathBuf,
    pub session_file: PathBuf,
}

impl Paths {
    /// Resolve paths from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let workdir = non_empty(&lookup, "WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
        let session_file = non_empty(&lookup, "STORAGE_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| workdir.join("storage.json"));
        Self {
            workdir,
            session_file,
        }
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.workdir.join("sent.jsonl")
    }

    /// Single-line marker written by the previous generation of the tool.
    pub fn legacy_marker(&self) -> PathBuf {
        self.workdir.join("last_sent.txt")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.workdir.join("downloads")
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.workdir.join("debug")
    }
}

/// Full run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub smtp: SmtpConfig,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub portal_base: Url,
    pub paths: Paths,
    pub debug: bool,
    pub request_timeout: Duration,
    pub limits: Limits,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> CourierResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup.
    ///
    /// All missing required variables are reported together.
    pub fn from_lookup<F>(lookup: F) -> CourierResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut require = |key: &'static str| match non_empty(&lookup, key) {
            Some(v) => v,
            None => {
                missing.push(key);
                String::new()
            }
        };

        let identity = require("GIHYO_EMAIL");
        let secret = require("GIHYO_PASSWORD");
        let smtp_host = require("SMTP_HOST");
        let smtp_user = require("SMTP_USER");
        let smtp_pass = require("SMTP_PASS");
        let sender = require("SENDER_EMAIL");
        let recipient = require("KINDLE_EMAIL");

        if !missing.is_empty() {
            return Err(CourierError::Configuration(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let smtp_port = match non_empty(&lookup, "SMTP_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                CourierError::Configuration(format!("SMTP_PORT is not a valid port: '{raw}'"))
            })?,
            None => DEFAULT_SMTP_PORT,
        };

        let timeout_secs = match non_empty(&lookup, "COURIER_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                CourierError::Configuration(format!(
                    "COURIER_TIMEOUT_SECS must be a positive integer, got '{raw}'"
                ))
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let base_raw =
            non_empty(&lookup, "PORTAL_BASE_URL").unwrap_or_else(|| DEFAULT_PORTAL_BASE.into());
        let portal_base = Url::parse(&base_raw).map_err(|e| {
            CourierError::Configuration(format!("PORTAL_BASE_URL '{base_raw}' is invalid: {e}"))
        })?;

        for (key, address) in [("SENDER_EMAIL", &sender), ("KINDLE_EMAIL", &recipient)] {
            address
                .parse::<lettre::message::Mailbox>()
                .map_err(|e| CourierError::Configuration(format!("{key} '{address}': {e}")))?;
        }

        let debug = non_empty(&lookup, "DEBUG")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            credentials: Credentials {
                identity,
                secret: Secret::new(secret),
            },
            smtp: SmtpConfig {
                host: smtp_host,
                port: smtp_port,
                user: smtp_user,
                password: Secret::new(smtp_pass),
                timeout: MAIL_TIMEOUT,
            },
            sender,
            recipient,
            subject: lookup("MAIL_SUBJECT").unwrap_or_default(),
            portal_base,
            paths: Paths::from_lookup(&lookup),
            debug,
            request_timeout: Duration::from_secs(timeout_secs),
            limits: Limits::default(),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_env() -> HashMap<String, String> {
        env(&[
            ("GIHYO_EMAIL", "reader@example.com"),
            ("GIHYO_PASSWORD", "hunter2"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USER", "relay"),
            ("SMTP_PASS", "relay-pass"),
            ("SENDER_EMAIL", "me@example.com"),
            ("KINDLE_EMAIL", "me_kindle@kindle.com"),
        ])
    }

    #[test]
    fn test_defaults_applied() {
        let vars = full_env();
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.portal_base.as_str(), "https://gihyo.jp/");
        assert_eq!(config.paths.workdir, PathBuf::from("./work"));
        assert_eq!(config.paths.session_file, PathBuf::from("./work/storage.json"));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.subject, "");
        assert!(!config.debug);
    }

    #[test]
    fn test_all_missing_reported_together() {
        let vars = env(&[("GIHYO_EMAIL", "reader@example.com"), ("SMTP_HOST", "  ")]);
        let err = Config::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, CourierError::Configuration(_)));
        assert!(msg.contains("GIHYO_PASSWORD"));
        assert!(msg.contains("SMTP_HOST"));
        assert!(msg.contains("KINDLE_EMAIL"));
        assert!(!msg.contains("GIHYO_EMAIL"));
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut vars = full_env();
        vars.insert("SMTP_PORT".into(), "smtp".into());
        let err = Config::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("SMTP_PORT"));
    }

    #[test]
    fn test_debug_and_overrides() {
        let mut vars = full_env();
        vars.insert("DEBUG".into(), "1".into());
        vars.insert("WORKDIR".into(), "/var/lib/courier".into());
        vars.insert("PORTAL_BASE_URL".into(), "http://127.0.0.1:8080".into());
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(config.debug);
        assert_eq!(
            config.paths.ledger_file(),
            PathBuf::from("/var/lib/courier/sent.jsonl")
        );
        assert_eq!(config.portal_base.port(), Some(8080));
    }

    #[test]
    fn test_secrets_redacted_in_debug() {
        let vars = full_env();
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let dump = format!("{config:?}");
        assert!(!dump.contains("hunter2"));
        assert!(!dump.contains("relay-pass"));
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let mut vars = full_env();
        vars.insert("KINDLE_EMAIL".into(), "not an address".into());
        let err = Config::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("KINDLE_EMAIL"));
    }
}
