//! refgate: operator CLI for the referral engine.
//!
//! Runs engine operations against the configured SQLite database and prints
//! results as JSON. The subscription gate answers from the last status
//! recorded for each user, since this binary has no platform connection.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;

use refgate::config::{Cli, Command, EngineConfig};
use refgate::gate::StoredStatusChecker;
use refgate::ledger::TransitionOutcome;
use refgate::orchestrator::Orchestrator;
use refgate::replay::replay_lines;
use refgate::rlog;
use refgate::storage::{ReferralStore, SqliteStorage};
use refgate::sweep::run_sweep_loop;

type Engine = Orchestrator<StoredStatusChecker>;

#[tokio::main]
async fn main() {
    refgate::logging::init();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn transition_json(outcome: &TransitionOutcome) -> serde_json::Value {
    match outcome {
        TransitionOutcome::Ok { from, to, .. } => {
            json!({ "outcome": "ok", "from": from, "to": to })
        }
        TransitionOutcome::NotFound => json!({ "outcome": "not_found" }),
        TransitionOutcome::InvalidTransition { current } => {
            json!({ "outcome": "invalid_transition", "current": current })
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::layered(&cli)?;

    // Pure codec operations need only the secret.
    if matches!(cli.command, Command::Code { .. } | Command::Decode { .. }) {
        config.validate_codec()?;
    } else {
        config.validate()?;
    }
    match &cli.command {
        Command::Code { user } => {
            return print_json(&json!({ "user": user, "code": config.codec().encode(*user) }));
        }
        Command::Decode { code } => {
            let value = match config.codec().decode(code) {
                Ok(user) => json!({ "valid": true, "user": user }),
                Err(e) => json!({ "valid": false, "reason": e.to_string() }),
            };
            return print_json(&value);
        }
        _ => {}
    }

    let store: Arc<dyn ReferralStore> = Arc::new(SqliteStorage::open(&config.database)?);
    let gate = config.gate(StoredStatusChecker::new(store.clone()));
    let engine = Arc::new(Orchestrator::new(
        store,
        config.codec(),
        gate,
        config.policy(),
    ));

    match cli.command {
        Command::Code { .. } | Command::Decode { .. } => Ok(()),
        Command::Join { user, code } => print_json(&engine.on_join(user, code.as_deref()).await?),
        Command::Subscription { user, subscribed } => {
            print_json(&engine.on_subscription_event(user, subscribed).await?)
        }
        Command::Recheck { user } => print_json(&engine.recheck(user).await?),
        Command::Status { user, force } => {
            let verdict = engine.subscription_status(user, force).await?;
            print_json(&json!({ "user": user, "subscribed": verdict.as_bool() }))
        }
        Command::Referrals { user } => print_json(&engine.referrals(user)?),
        Command::Veto { user } => print_json(&transition_json(&engine.veto(user).await?)),
        Command::Ban { user } => {
            engine.set_banned(user, true).await?;
            print_json(&json!({ "user": user, "banned": true }))
        }
        Command::Unban { user } => {
            engine.set_banned(user, false).await?;
            print_json(&json!({ "user": user, "banned": false }))
        }
        Command::Purge { user } => {
            let removed = engine.purge(user).await?;
            print_json(&json!({ "user": user, "purged": removed }))
        }
        Command::Top { limit } => {
            let rows: Vec<_> = engine
                .top(limit)?
                .into_iter()
                .enumerate()
                .map(|(i, u)| json!({ "rank": i + 1, "user": u.id, "credited": u.credited_referrals }))
                .collect();
            print_json(&rows)
        }
        Command::Stats => print_json(&engine.stats()?),
        Command::Sweep { watch } => {
            print_json(&engine.expire_pending().await?)?;
            if watch {
                watch_sweeps(engine, &config).await;
            }
            Ok(())
        }
        Command::Replay { file } => replay(engine, &file).await,
    }
}

async fn watch_sweeps(engine: Arc<Engine>, config: &EngineConfig) {
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_one();
        }
    });
    rlog!(
        "sweep: watching every {}s, ctrl-c to stop",
        config.sweep_interval_secs
    );
    run_sweep_loop(engine, config.sweep_interval(), shutdown).await;
}

/// Replay a JSON-lines event log, printing one JSON line per input line in
/// input order, then the ledger totals.
async fn replay(engine: Arc<Engine>, path: &Path) -> Result<(), Box<dyn Error>> {
    let contents = tokio::fs::read_to_string(path).await?;
    for line in replay_lines(engine.clone(), &contents).await {
        print_json(&line)?;
    }
    print_json(&json!({ "stats": engine.stats()? }))
}
