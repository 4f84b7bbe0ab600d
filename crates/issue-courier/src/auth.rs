//! Portal authentication.
//!
//! A saved session is tried first with a cheap probe of the account page.
//! Only when that fails are the credentials submitted through the login
//! form. Either way the resulting cookies are handed to the session store.

use crate::browser::forms::{find_login_form, has_password_input, login_frame_src};
use crate::browser::{Page, PortalBrowser};
use crate::capture::PageCapture;
use crate::config::Credentials;
use crate::error::{CourierError, CourierResult};
use crate::portal::{join, PortalLayout};
use crate::session::{SessionState, SessionStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

/// How the session was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Saved cookies passed the probe; no credentials were sent.
    Restored,
    /// Credentials were submitted through the login form.
    Login,
}

/// Proof that the browser is signed in to the portal.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub method: AuthMethod,
    /// Page that confirmed the signed-in state.
    pub landing_url: String,
    pub established_at: DateTime<Utc>,
}

pub struct Authenticator<'a> {
    base: &'a Url,
    layout: &'a PortalLayout,
    store: &'a SessionStore,
    capture: &'a PageCapture,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        base: &'a Url,
        layout: &'a PortalLayout,
        store: &'a SessionStore,
        capture: &'a PageCapture,
    ) -> Self {
        Self {
            base,
            layout,
            store,
            capture,
        }
    }

    /// Establish a signed-in session, reusing `saved` when the portal still accepts it.
    pub async fn authenticate<B>(
        &self,
        browser: &mut B,
        credentials: &Credentials,
        saved: Option<SessionState>,
    ) -> CourierResult<AuthenticatedSession>
    where
        B: PortalBrowser + ?Sized,
    {
        if let Some(state) = saved {
            browser.restore_state(&state);
            match self.probe(browser).await {
                Ok(Some(page)) => {
                    info!(saved_at = %state.saved_at, "saved session still valid");
                    self.persist(browser);
                    return Ok(self.session(AuthMethod::Restored, page));
                }
                Ok(None) => info!("saved session no longer accepted, logging in"),
                Err(e) => warn!(error = %format!("{e:#}"), "session probe failed, logging in"),
            }
            browser.clear_state();
        }

        let page = self.login(browser, credentials).await?;
        info!(landing = %page.url, "login succeeded");
        self.persist(browser);
        Ok(self.session(AuthMethod::Login, page))
    }

    /// Load the account page; `Some` when it shows a signed-in state.
    async fn probe<B>(&self, browser: &mut B) -> anyhow::Result<Option<Page>>
    where
        B: PortalBrowser + ?Sized,
    {
        let page = browser
            .navigate(&self.layout.account_url(self.base))
            .await
            .context("account page probe")?;
        self.capture.page("session_probe", &page);
        Ok(is_signed_in(&page, self.layout).then_some(page))
    }

    async fn login<B>(&self, browser: &mut B, credentials: &Credentials) -> CourierResult<Page>
    where
        B: PortalBrowser + ?Sized,
    {
        let entry = browser
            .navigate(&self.layout.entry_url(self.base))
            .await
            .context("failed to open portal entry page")
            .map_err(CourierError::authentication)?;
        self.capture.page("login_entry", &entry);

        let login_page = if has_password_input(&entry.html, self.layout) {
            entry
        } else {
            let entry_url = parse_page_url(&entry)?;
            let link = find_login_link(&entry.html, &entry_url, self.layout).ok_or_else(|| {
                CourierError::Authentication(format!("no login link on {}", entry.url))
            })?;
            debug!(link = %link, "following login link");
            browser
                .navigate(&link)
                .await
                .context("failed to open login page")
                .map_err(CourierError::authentication)?
        };
        self.capture.page("login_form", &login_page);

        let login_url = parse_page_url(&login_page)?;
        let mut form = find_login_form(&login_page.html, &login_url, self.layout);
        if form.is_none() {
            if let Some(src) = login_frame_src(&login_page.html, &login_url, self.layout) {
                debug!(frame = %src, "login form not in page, trying embedded frame");
                let frame = browser
                    .navigate(&src)
                    .await
                    .context("failed to open login frame")
                    .map_err(CourierError::authentication)?;
                self.capture.page("login_frame", &frame);
                form = find_login_form(&frame.html, &parse_page_url(&frame)?, self.layout);
            }
        }
        let form = form.ok_or_else(|| {
            CourierError::Authentication(format!(
                "login form not found on {} (login flow changed?)",
                login_page.url
            ))
        })?;

        debug!(action = %form.action, "submitting login form");
        let result = browser
            .submit(&form.fill(credentials))
            .await
            .context("login form submission failed")
            .map_err(CourierError::authentication)?;
        self.capture.page("after_login", &result);

        if has_password_input(&result.html, self.layout) {
            let rejected = contains_any(&page_text(&result.html), self.layout.rejection_texts);
            return Err(CourierError::Authentication(if rejected {
                "portal rejected the email address or password".to_string()
            } else {
                format!("still on a login form after submitting ({})", result.url)
            }));
        }
        if is_signed_in(&result, self.layout) {
            return Ok(result);
        }

        // Some flows land on an interstitial page; check the account page once.
        let recheck = browser
            .navigate(&self.layout.account_url(self.base))
            .await
            .context("account page re-check failed")
            .map_err(CourierError::authentication)?;
        self.capture.page("login_recheck", &recheck);
        if is_signed_in(&recheck, self.layout) {
            return Ok(recheck);
        }

        Err(CourierError::Authentication(
            "signed-in marker never appeared after login".to_string(),
        ))
    }

    fn persist<B>(&self, browser: &B)
    where
        B: PortalBrowser + ?Sized,
    {
        if let Err(e) = self.store.save(&browser.export_state()) {
            warn!(error = %format!("{e:#}"), "could not save session state");
        }
    }

    fn session(&self, method: AuthMethod, page: Page) -> AuthenticatedSession {
        AuthenticatedSession {
            method,
            landing_url: page.url,
            established_at: Utc::now(),
        }
    }
}

/// Whether `page` shows a signed-in state.
pub fn is_signed_in(page: &Page, layout: &PortalLayout) -> bool {
    if !page.is_success() || layout.is_login_url(&page.url) {
        return false;
    }
    let document = Html::parse_document(&page.html);
    if document.select(&layout.password_input).next().is_some() {
        return false;
    }
    document.select(&layout.signed_in_link).next().is_some()
        || contains_any(&text_of(&document), layout.signed_in_texts)
}

/// First login link on the page, by href pattern, then by link text.
pub fn find_login_link(html: &str, page_url: &Url, layout: &PortalLayout) -> Option<String> {
    let document = Html::parse_document(html);
    let by_href = document
        .select(&layout.login_link)
        .find_map(|a| a.value().attr("href"));
    let href = by_href.or_else(|| {
        document.select(&layout.anchor).find_map(|a| {
            let text: String = a.text().collect();
            contains_any(&text, layout.login_link_texts)
                .then(|| a.value().attr("href"))
                .flatten()
        })
    })?;
    Some(join(page_url, href))
}

fn parse_page_url(page: &Page) -> CourierResult<Url> {
    Url::parse(&page.url)
        .map_err(|e| CourierError::Authentication(format!("bad page URL '{}': {e}", page.url)))
}

fn page_text(html: &str) -> String {
    text_of(&Html::parse_document(html))
}

fn text_of(document: &Html) -> String {
    document.root_element().text().collect()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
