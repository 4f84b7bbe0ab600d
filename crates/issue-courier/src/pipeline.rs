//! The courier run: authenticate, locate, check, fetch, send, record.
//!
//! Strictly sequential. The first error ends the run, and so does finding
//! the issue in the ledger. Whatever happens, the browser is closed and the
//! staged artifact removed before [`Orchestrator::run`] returns.

use crate::auth::Authenticator;
use crate::browser::PortalBrowser;
use crate::capture::PageCapture;
use crate::config::{Config, Credentials};
use crate::error::{CourierResult, ErrorKind};
use crate::fetcher::{Artifact, ArtifactFetcher};
use crate::ledger::DispatchLedger;
use crate::locator::IssueLocator;
use crate::mailer::{DeliveryReceipt, Envelope, Mailer};
use crate::portal::PortalLayout;
use crate::session::SessionStore;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use url::Url;

/// Where a run is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Authenticated,
    IssueFound,
    AlreadySent,
    Fetched,
    Sent,
    Recorded,
    Failed(ErrorKind),
}

/// How a successful run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The latest issue was mailed on an earlier run.
    AlreadySent { issue: String },
    Delivered {
        issue: String,
        receipt: DeliveryReceipt,
    },
}

pub struct Orchestrator<B, M> {
    browser: B,
    mailer: M,
    credentials: Credentials,
    envelope: Envelope,
    base: Url,
    layout: PortalLayout,
    store: SessionStore,
    ledger: DispatchLedger,
    fetcher: ArtifactFetcher,
    capture: PageCapture,
    transitions: Vec<RunState>,
}

impl<B, M> Orchestrator<B, M>
where
    B: PortalBrowser,
    M: Mailer,
{
    pub fn new(config: &Config, browser: B, mailer: M) -> Self {
        let paths = &config.paths;
        let capture = if config.debug {
            PageCapture::new(paths.capture_dir())
        } else {
            PageCapture::disabled()
        };
        Self {
            browser,
            mailer,
            credentials: config.credentials.clone(),
            envelope: Envelope {
                sender: config.sender.clone(),
                recipient: config.recipient.clone(),
                subject: config.subject.clone(),
            },
            base: config.portal_base.clone(),
            layout: PortalLayout::default(),
            store: SessionStore::new(paths.session_file.clone()),
            ledger: DispatchLedger::new(paths.ledger_file(), paths.legacy_marker()),
            fetcher: ArtifactFetcher::new(paths.downloads_dir(), config.limits.download_limit),
            capture,
            transitions: Vec::new(),
        }
    }

    /// States visited by the last run, in order.
    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn mailer(&self) -> &M {
        &self.mailer
    }

    /// Execute one run.
    pub async fn run(&mut self) -> CourierResult<RunOutcome> {
        self.transitions.clear();
        self.advance(RunState::Init);

        let mut staged = None;
        let result = self.execute(&mut staged).await;

        if let Some(artifact) = staged {
            artifact.discard();
        }
        if let Err(e) = self.browser.close().await {
            warn!(error = %format!("{e:#}"), "browser did not close cleanly");
        }

        match &result {
            Ok(RunOutcome::AlreadySent { issue }) => info!(issue = %issue, "nothing to do"),
            Ok(RunOutcome::Delivered { issue, receipt }) => {
                info!(issue = %issue, code = %receipt.code, "issue delivered")
            }
            Err(e) => {
                let reached = self.transitions.last().copied().unwrap_or(RunState::Init);
                self.advance(RunState::Failed(e.kind()));
                error!(kind = %e.kind(), reached = ?reached, error = %e, "run failed");
            }
        }
        result
    }

    async fn execute(&mut self, staged: &mut Option<Artifact>) -> CourierResult<RunOutcome> {
        let saved = self.store.load();
        let session = Authenticator::new(&self.base, &self.layout, &self.store, &self.capture)
            .authenticate(&mut self.browser, &self.credentials, saved)
            .await?;
        self.advance(RunState::Authenticated);

        let issue = IssueLocator::new(&self.base, &self.layout, &self.capture)
            .find_latest_issue(&mut self.browser, &session)
            .await?;
        self.advance(RunState::IssueFound);
        self.save_session();

        if self.ledger.already_sent(&issue.identifier)? {
            info!(issue = %issue.identifier, "already delivered, skipping");
            self.advance(RunState::AlreadySent);
            return Ok(RunOutcome::AlreadySent {
                issue: issue.identifier,
            });
        }

        let artifact = self
            .fetcher
            .fetch(
                &mut self.browser,
                &issue.identifier,
                &issue.reference,
                &session,
            )
            .await?;
        let artifact = staged.insert(artifact);
        self.advance(RunState::Fetched);

        let receipt = self.mailer.send(&self.envelope, artifact).await?;
        self.advance(RunState::Sent);

        self.ledger
            .record_sent(&issue.identifier, receipt.accepted_at)?;
        self.advance(RunState::Recorded);

        Ok(RunOutcome::Delivered {
            issue: issue.identifier,
            receipt,
        })
    }

    fn save_session(&self) {
        if let Err(e) = self.store.save(&self.browser.export_state()) {
            warn!(error = %format!("{e:#}"), "could not save session state");
        }
    }

    fn advance(&mut self, state: RunState) {
        debug!(state = ?state, "run state");
        self.transitions.push(state);
    }
}
