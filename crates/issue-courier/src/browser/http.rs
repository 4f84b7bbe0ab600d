//! HTTP engine for [`PortalBrowser`].
//!
//! Not a real browser: plain requests through reqwest, redirects followed by
//! hand so every hop's `Set-Cookie` lands in the jar, and HTML handed back to
//! the caller for parsing. Enough for a server-rendered portal.

use super::cookies::CookieJar;
use super::{Download, FormMethod, FormSubmission, Page, PortalBrowser};
use crate::session::SessionState;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, ACCEPT_LANGUAGE, CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE, LOCATION,
};
use reqwest::{Method, Response};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/129.0.0.0 Safari/537.36";

/// Cookie-carrying HTTP client bound to one portal.
pub struct HttpBrowser {
    client: reqwest::Client,
    jar: CookieJar,
    timeout: Duration,
    closed: bool,
}

impl HttpBrowser {
    /// Create a browser for the portal at `base`. Each request is bounded by `timeout`.
    pub fn new(base: &Url, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, "ja-JP,ja;q=0.9,en;q=0.8".parse()?);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            jar: CookieJar::for_base(base),
            timeout,
            closed: false,
        })
    }

    /// Send a request and follow redirects, collecting cookies on every hop.
    ///
    /// 301/302/303 after a POST turn into a bodiless GET, as browsers do.
    async fn send(
        &mut self,
        method: Method,
        url: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<(Url, Response)> {
        if self.closed {
            bail!("browser context already closed");
        }

        let mut current = Url::parse(url).with_context(|| format!("invalid URL '{url}'"))?;
        let mut method = method;
        let mut form = form;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .request(method.clone(), current.clone())
                .timeout(self.timeout);
            if let Some(cookie) = self.jar.header_for(&current) {
                request = request.header(COOKIE, cookie);
            }
            if let Some(fields) = form {
                request = request.form(fields);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("{method} {current} timed out after {:?}", self.timeout)
                } else {
                    anyhow::Error::new(e).context(format!("{method} {current} failed"))
                }
            })?;

            self.jar.absorb(&current, response.headers());
            debug!(
                status = response.status().as_u16(),
                method = %method,
                url = %current,
                "document response"
            );

            if response.status().is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = current
                        .join(location)
                        .with_context(|| format!("bad redirect target '{location}'"))?;
                    if matches!(response.status().as_u16(), 301..=303) {
                        method = Method::GET;
                        form = None;
                    }
                    current = next;
                    continue;
                }
            }

            return Ok((current, response));
        }

        bail!("too many redirects starting at {url}")
    }

    async fn load(
        &mut self,
        method: Method,
        url: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Page> {
        let (final_url, response) = self.send(method, url, form).await?;
        let status = response.status().as_u16();
        let html = response
            .text()
            .await
            .with_context(|| format!("failed to read body of {final_url}"))?;
        Ok(Page {
            url: final_url.to_string(),
            status,
            html,
        })
    }
}

#[async_trait]
impl PortalBrowser for HttpBrowser {
    async fn navigate(&mut self, url: &str) -> Result<Page> {
        self.load(Method::GET, url, None).await
    }

    async fn submit(&mut self, form: &FormSubmission) -> Result<Page> {
        match form.method {
            FormMethod::Post => {
                self.load(Method::POST, &form.action, Some(form.fields.as_slice()))
                    .await
            }
            FormMethod::Get => {
                let mut url = Url::parse(&form.action)
                    .with_context(|| format!("invalid form action '{}'", form.action))?;
                url.query_pairs_mut().extend_pairs(form.fields.iter());
                self.load(Method::GET, url.as_str(), None).await
            }
        }
    }

    async fn download(&mut self, url: &str, max_bytes: u64) -> Result<Download> {
        let (final_url, mut response) = self.send(Method::GET, url, None).await?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {final_url} returned HTTP {}", status.as_u16());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        {
            bail!("{final_url} returned an HTML page instead of a file (session expired?)");
        }

        if let Some(len) = response.content_length() {
            if len > max_bytes {
                bail!("{final_url} announces {len} bytes, above the {max_bytes}-byte limit");
            }
        }

        let suggested_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(&final_url));

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("transfer from {final_url} interrupted"))?
        {
            if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
                bail!("{final_url} exceeded the {max_bytes}-byte limit mid-transfer");
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(url = %final_url, bytes = bytes.len(), "download complete");

        Ok(Download {
            url: url.to_string(),
            final_url: final_url.to_string(),
            content_type,
            suggested_name,
            bytes,
        })
    }

    fn export_state(&self) -> SessionState {
        SessionState::new(self.jar.domain(), self.jar.cookies().clone())
    }

    fn restore_state(&mut self, state: &SessionState) {
        if state.domain != self.jar.domain() {
            warn!(
                saved = %state.domain,
                portal = %self.jar.domain(),
                "saved session belongs to another domain, not restoring"
            );
            return;
        }
        self.jar.replace(state.cookies.clone());
    }

    fn clear_state(&mut self) {
        self.jar.clear();
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.jar.clear();
        Ok(())
    }
}

/// File name from a `Content-Disposition` header, preferring `filename*`.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // RFC 5987: charset'lang'percent-encoded
                let encoded = value.rsplit('\'').next().unwrap_or(value);
                if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                    if !decoded.is_empty() {
                        return Some(decoded.into_owned());
                    }
                }
            }
            "filename" => {
                let v = value.trim().trim_matches('"');
                if !v.is_empty() {
                    plain = Some(v.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    urlencoding::decode(last).ok().map(|s| s.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_plain() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"SD202405.epub\"").as_deref(),
            Some("SD202405.epub")
        );
    }

    #[test]
    fn test_disposition_extended_wins() {
        let header = "attachment; filename=\"sd.epub\"; filename*=UTF-8''Software%20Design%202024%E5%B9%B45%E6%9C%88%E5%8F%B7.epub";
        assert_eq!(
            filename_from_disposition(header).as_deref(),
            Some("Software Design 2024年5月号.epub")
        );
    }

    #[test]
    fn test_filename_from_url() {
        let url = Url::parse("https://gihyo.jp/dp/download/978-4-297/SD%202024-05.epub?sig=1").unwrap();
        assert_eq!(filename_from_url(&url).as_deref(), Some("SD 2024-05.epub"));
        let root = Url::parse("https://gihyo.jp/").unwrap();
        assert!(filename_from_url(&root).is_none());
    }

    #[tokio::test]
    async fn test_closed_browser_refuses_requests() {
        let base = Url::parse("https://gihyo.jp").unwrap();
        let mut browser = HttpBrowser::new(&base, Duration::from_secs(5)).unwrap();
        browser.close().await.unwrap();
        let err = browser.navigate("https://gihyo.jp/dp").await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
