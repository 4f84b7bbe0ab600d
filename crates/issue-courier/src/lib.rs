// Copyright 2026 Issue Courier Contributors
// SPDX-License-Identifier: Apache-2.0

//! Issue Courier: mails the newest subscribed magazine issue to an e-reader.
//!
//! One run signs in to the publisher's portal (reusing a saved session when
//! it is still accepted), finds the latest purchased issue, skips it if the
//! dispatch ledger already has it, and otherwise downloads the EPUB, mails
//! it over SMTP and records the delivery.

pub mod auth;
pub mod browser;
pub mod capture;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod locator;
pub mod mailer;
pub mod pipeline;
pub mod portal;
pub mod session;

pub use config::Config;
pub use error::{CourierError, CourierResult, ErrorKind};
pub use pipeline::{Orchestrator, RunOutcome, RunState};
