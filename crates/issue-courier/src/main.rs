// Copyright 2026 Issue Courier Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use issue_courier::browser::http::HttpBrowser;
use issue_courier::config::{Config, Paths};
use issue_courier::ledger::DispatchLedger;
use issue_courier::mailer::SmtpMailer;
use issue_courier::session::SessionStore;
use issue_courier::{Orchestrator, RunOutcome};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "issue-courier",
    about = "Mail the latest Software Design issue to your Kindle, once per issue",
    version
)]
struct Cli {
    /// Verbose logging and HTML captures of every visited page
    #[arg(long, global = true)]
    debug: bool,

    /// Output results and logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in, find the latest issue and deliver it if new (default)
    Run,
    /// Show delivered issues and whether a saved session exists
    Status,
    /// Delete the saved portal session
    ForgetSession,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug = cli.debug || env_flag("DEBUG");
    init_tracing(debug, cli.json)?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(debug, cli.json).await,
        Commands::Status => status(cli.json),
        Commands::ForgetSession => forget_session(cli.json),
    };

    // 0 on delivery or nothing to do, 1 on any error
    if let Err(e) = &result {
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "error": true, "message": format!("{e:#}") })
            );
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}

fn init_tracing(debug: bool, json: bool) -> Result<()> {
    let level = if debug { "issue_courier=debug" } else { "issue_courier=info" };
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

async fn run(debug: bool, json: bool) -> Result<()> {
    let mut config = Config::from_env()?;
    config.debug |= debug;
    info!(
        portal = %config.portal_base,
        workdir = %config.paths.workdir.display(),
        "starting issue-courier v{}",
        env!("CARGO_PKG_VERSION")
    );

    let browser = HttpBrowser::new(&config.portal_base, config.request_timeout)?;
    let mailer = SmtpMailer::new(config.smtp.clone(), config.limits.attachment_limit);
    let mut orchestrator = Orchestrator::new(&config, browser, mailer);
    let outcome = orchestrator.run().await?;

    if json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        match &outcome {
            RunOutcome::AlreadySent { issue } => println!("{issue}: already sent, nothing to do"),
            RunOutcome::Delivered { issue, receipt } => println!(
                "{issue}: delivered ({} bytes, relay answered {})",
                receipt.attachment_bytes, receipt.code
            ),
        }
    }
    Ok(())
}

fn status(json: bool) -> Result<()> {
    let paths = Paths::from_env();
    let ledger = DispatchLedger::new(paths.ledger_file(), paths.legacy_marker());
    let records = ledger.records()?;
    let session = SessionStore::new(paths.session_file.clone()).load();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ledger": ledger.path(),
                "delivered": records,
                "session_saved_at": session.as_ref().map(|s| s.saved_at),
            })
        );
        return Ok(());
    }

    println!("ledger: {}", ledger.path().display());
    if records.is_empty() {
        println!("  no deliveries recorded");
    }
    for record in &records {
        println!("  {}  {}", record.sent_at.format("%Y-%m-%d %H:%M:%S UTC"), record.issue);
    }
    match session {
        Some(state) => println!(
            "session: saved {} ({} cookies)",
            state.saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
            state.cookies.len()
        ),
        None => println!("session: none"),
    }
    Ok(())
}

fn forget_session(json: bool) -> Result<()> {
    let paths = Paths::from_env();
    let store = SessionStore::new(paths.session_file.clone());
    let removed = store.clear()?;
    if json {
        println!(
            "{}",
            serde_json::json!({ "session_file": store.path(), "removed": removed })
        );
    } else if removed {
        println!("removed {}", store.path().display());
    } else {
        println!("no saved session at {}", store.path().display());
    }
    Ok(())
}
