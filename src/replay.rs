//! JSON-lines event replay.
//!
//! Events run concurrently across users while each user's events keep file
//! order. A join carrying an invite code reads its referrer's state, so it
//! waits for every earlier line and runs alone; the result is the same as
//! applying the file top to bottom.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::gate::SubscriptionChecker;
use crate::logging;
use crate::model::UserId;
use crate::orchestrator::{EventOutcome, Orchestrator, ReferralEvent};
use crate::rlog;

/// Result of one input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReplayLine {
    Applied { line: usize, result: EventOutcome },
    Failed { line: usize, error: String },
}

impl ReplayLine {
    pub fn line(&self) -> usize {
        match self {
            ReplayLine::Applied { line, .. } | ReplayLine::Failed { line, .. } => *line,
        }
    }
}

type Batch = BTreeMap<UserId, Vec<(usize, ReferralEvent)>>;

fn reads_other_users(event: &ReferralEvent) -> bool {
    matches!(event, ReferralEvent::Joined { code: Some(_), .. })
}

async fn apply<C: SubscriptionChecker>(
    engine: &Orchestrator<C>,
    line: usize,
    event: ReferralEvent,
) -> ReplayLine {
    match engine.handle(event).await {
        Ok(result) => ReplayLine::Applied { line, result },
        Err(e) => {
            rlog!("replay: line {} failed: {}", line, e);
            ReplayLine::Failed {
                line,
                error: e.to_string(),
            }
        }
    }
}

async fn run_batch<C>(
    engine: &Arc<Orchestrator<C>>,
    batch: Batch,
    results: &mut BTreeMap<usize, ReplayLine>,
) where
    C: SubscriptionChecker + 'static,
{
    if batch.is_empty() {
        return;
    }
    let mut tasks = JoinSet::new();
    for (_, events) in batch {
        let engine = engine.clone();
        tasks.spawn(async move {
            let mut out = Vec::with_capacity(events.len());
            for (line, event) in events {
                out.push(apply(&*engine, line, event).await);
            }
            out
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(lines) => results.extend(lines.into_iter().map(|r| (r.line(), r))),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => rlog!("replay: batch task cancelled: {}", e),
        }
    }
}

/// Apply every event in `contents` and return one result per non-blank
/// line, in input order. Lines that do not parse are reported, not applied.
pub async fn replay_lines<C>(engine: Arc<Orchestrator<C>>, contents: &str) -> Vec<ReplayLine>
where
    C: SubscriptionChecker + 'static,
{
    let mut results = BTreeMap::new();
    let mut batch = Batch::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<ReferralEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                rlog!("replay: line {} is not an event: {}", line, e);
                results.insert(
                    line,
                    ReplayLine::Failed {
                        line,
                        error: e.to_string(),
                    },
                );
                continue;
            }
        };
        if reads_other_users(&event) {
            run_batch(&engine, std::mem::take(&mut batch), &mut results).await;
            rlog!(
                "replay: line {} joins {} with a code, applied in order",
                line,
                logging::user(event.user())
            );
            results.insert(line, apply(&*engine, line, event).await);
        } else {
            batch.entry(event.user()).or_default().push((line, event));
        }
    }
    run_batch(&engine, batch, &mut results).await;
    results.into_values().collect()
}
