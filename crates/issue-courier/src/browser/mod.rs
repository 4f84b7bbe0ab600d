//! Browser capability used by the pipeline.
//!
//! Defines the `PortalBrowser` trait that abstracts over the automation
//! engine. The shipped engine is [`http::HttpBrowser`], which drives the
//! portal with plain HTTP requests, a cookie jar, and HTML parsing.

pub mod cookies;
pub mod forms;
pub mod http;

use crate::session::SessionState;
use anyhow::Result;
use async_trait::async_trait;

/// A loaded page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code of the final response.
    pub status: u16,
    /// Full page HTML.
    pub html: String,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP method of a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMethod {
    Get,
    Post,
}

impl FormMethod {
    pub fn from_attr(attr: Option<&str>) -> Self {
        match attr.map(|m| m.trim().to_ascii_lowercase()) {
            Some(m) if m == "post" => FormMethod::Post,
            _ => FormMethod::Get,
        }
    }
}

/// A filled-in form ready to be submitted.
#[derive(Debug, Clone)]
pub struct FormSubmission {
    /// Absolute action URL.
    pub action: String,
    pub method: FormMethod,
    pub fields: Vec<(String, String)>,
}

/// Binary body retrieved from a download link.
#[derive(Debug, Clone)]
pub struct Download {
    /// Requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    /// Name suggested by the server or derived from the URL.
    pub suggested_name: Option<String>,
    pub bytes: Vec<u8>,
}

/// A single browser context bound to the portal.
#[async_trait]
pub trait PortalBrowser: Send {
    /// Load a page, following redirects.
    async fn navigate(&mut self, url: &str) -> Result<Page>;
    /// Submit a filled form and load the resulting page.
    async fn submit(&mut self, form: &FormSubmission) -> Result<Page>;
    /// Retrieve a binary resource, failing once it exceeds `max_bytes`.
    async fn download(&mut self, url: &str, max_bytes: u64) -> Result<Download>;
    /// Snapshot the persisted state (cookies).
    fn export_state(&self) -> SessionState;
    /// Replace the persisted state with a saved snapshot.
    fn restore_state(&mut self, state: &SessionState);
    /// Drop all persisted state, as a fresh context would have.
    fn clear_state(&mut self);
    /// Release the context. Further calls fail.
    async fn close(&mut self) -> Result<()>;
}
