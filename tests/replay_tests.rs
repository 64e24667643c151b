//! Shuffled event logs replayed against the engine. Seeds are fixed so any
//! failure reproduces.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use refgate::codec::InviteCodec;
use refgate::gate::{CheckError, RetryPolicy, SubscriptionChecker, SubscriptionGate};
use refgate::memory::MemoryStorage;
use refgate::model::{EdgeState, LedgerStats, UserId};
use refgate::orchestrator::{
    AttributionPolicy, EngineError, EventOutcome, JoinOutcome, Orchestrator, ReferralEvent,
    SubscriptionOutcome,
};
use refgate::replay::{replay_lines, ReplayLine};
use refgate::storage::{ReferralStore, SqliteStorage};

const REFERRERS: u64 = 3;
const REFEREES: u64 = 60;

struct Unreachable;

impl SubscriptionChecker for Unreachable {
    async fn is_subscribed(&self, _user: UserId, _channel: &str) -> Result<bool, CheckError> {
        Err(CheckError::Denied("offline".to_string()))
    }
}

fn engine(store: Arc<dyn ReferralStore>) -> Orchestrator<Unreachable> {
    let gate = SubscriptionGate::new(
        Unreachable,
        "@channel",
        RetryPolicy::default(),
        std::time::Duration::from_secs(60),
        100,
    );
    Orchestrator::new(
        store,
        InviteCodec::new("replay-tests"),
        gate,
        AttributionPolicy {
            verify_on_join: false,
            ..AttributionPolicy::default()
        },
    )
}

/// Joins (some with a foreign code, some duplicated, some bogus) and
/// subscription flips for every referee, shuffled.
fn event_log(seed: u64, codec: &InviteCodec) -> Vec<ReferralEvent> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut events = Vec::new();
    for referee in (REFERRERS + 1)..=(REFERRERS + REFEREES) {
        let user = UserId(referee);
        let code = match rng.gen_range(0..10) {
            0 => Some("bogus-code".to_string()),
            1 => None,
            _ => Some(codec.encode(UserId(rng.gen_range(1..=REFERRERS)))),
        };
        for _ in 0..rng.gen_range(1..=3) {
            events.push(ReferralEvent::Joined {
                user,
                code: code.clone(),
            });
        }
        for _ in 0..rng.gen_range(0..=6) {
            events.push(ReferralEvent::Subscription {
                user,
                subscribed: rng.gen_bool(0.7),
            });
        }
    }
    events.shuffle(&mut rng);
    events
}

async fn seed_referrers(engine: &Orchestrator<Unreachable>) {
    for id in 1..=REFERRERS {
        engine.on_join(UserId(id), None).await.unwrap();
    }
}

fn assert_consistent(engine: &Orchestrator<Unreachable>) -> LedgerStats {
    let stats = engine.stats().unwrap();
    let edges = engine.ledger().list(None).unwrap();

    let mut confirmed_per_referrer: HashMap<UserId, u64> = HashMap::new();
    for edge in &edges {
        assert_ne!(edge.referrer_id, edge.referee_id);
        assert!(edge.referrer_id.0 <= REFERRERS);
        let referee = engine.identities().get(edge.referee_id).unwrap().unwrap();
        assert_eq!(referee.referred_by, Some(edge.referrer_id));
        if edge.state == EdgeState::Confirmed {
            assert!(edge.confirmed_at.is_some());
            *confirmed_per_referrer.entry(edge.referrer_id).or_default() += 1;
        }
    }
    for id in 1..=REFERRERS {
        let expected = confirmed_per_referrer.get(&UserId(id)).copied().unwrap_or(0);
        assert_eq!(engine.rewards().current_count(UserId(id)).unwrap(), expected);
    }
    assert_eq!(stats.total_credited, stats.confirmed);
    stats
}

/// Events for users that do not exist yet are reported, never applied.
fn tolerate_missing(result: Result<EventOutcome, EngineError>) {
    match result {
        Ok(_) | Err(EngineError::NotFound(_)) => {}
        Err(e) => panic!("unexpected engine error: {e}"),
    }
}

#[tokio::test]
async fn sequential_replay_is_deterministic_and_consistent() {
    let codec = InviteCodec::new("replay-tests");
    for seed in 0..10 {
        let log = event_log(seed, &codec);
        let mut runs = Vec::new();
        for _ in 0..2 {
            let engine = engine(Arc::new(MemoryStorage::new()));
            seed_referrers(&engine).await;
            for event in log.clone() {
                tolerate_missing(engine.handle(event).await);
            }
            runs.push(assert_consistent(&engine));
        }
        assert_eq!(runs[0], runs[1], "seed {seed}");
    }
}

#[tokio::test]
async fn replaying_a_log_twice_never_double_credits() {
    let codec = InviteCodec::new("replay-tests");
    let engine = engine(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    seed_referrers(&engine).await;
    let log = event_log(99, &codec);

    for event in log.clone() {
        tolerate_missing(engine.handle(event).await);
    }
    let first = assert_consistent(&engine);
    for event in log {
        tolerate_missing(engine.handle(event).await);
    }
    let second = assert_consistent(&engine);

    // Confirmed edges are final, so a second pass can only add to them.
    assert!(second.confirmed >= first.confirmed);
    assert_eq!(second.users, first.users);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_replay_keeps_credits_consistent() {
    let codec = InviteCodec::new("replay-tests");
    for seed in 100..105 {
        let engine = Arc::new(engine(Arc::new(MemoryStorage::new())));
        seed_referrers(&engine).await;
        let mut handles = Vec::new();
        for event in event_log(seed, &codec) {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.handle(event).await }));
        }
        for handle in handles {
            tolerate_missing(handle.await.unwrap());
        }
        assert_consistent(&engine);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn log_replay_attributes_referees_after_their_referrers() {
    let codec = InviteCodec::new("replay-tests");
    let engine = Arc::new(engine(Arc::new(MemoryStorage::new())));

    let mut lines = vec![r#"{"type":"subscription","user":7,"subscribed":true}"#.to_string()];
    for n in 1..=50u64 {
        let referrer = 100 * n;
        lines.push(format!(r#"{{"type":"joined","user":{referrer}}}"#));
        lines.push(format!(
            r#"{{"type":"joined","user":{n},"code":"{}"}}"#,
            codec.encode(UserId(referrer))
        ));
    }
    lines.push(String::new());
    lines.push("not json".to_string());
    for n in 1..=50u64 {
        lines.push(format!(r#"{{"type":"subscription","user":{n},"subscribed":true}}"#));
    }

    let results = replay_lines(engine.clone(), &lines.join("\n")).await;
    assert_eq!(results.len(), lines.len() - 1);
    let numbers: Vec<usize> = results.iter().map(ReplayLine::line).collect();
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    assert_eq!(numbers, sorted);

    assert!(matches!(&results[0], ReplayLine::Failed { line: 1, .. }));
    for pair in results[1..101].chunks(2) {
        assert!(matches!(
            &pair[0],
            ReplayLine::Applied {
                result: EventOutcome::Join(JoinOutcome::NoReferral { created: true }),
                ..
            }
        ));
        assert!(
            matches!(
                &pair[1],
                ReplayLine::Applied {
                    result: EventOutcome::Join(JoinOutcome::Attributed { .. }),
                    ..
                }
            ),
            "{:?}",
            pair[1]
        );
    }
    assert!(matches!(&results[101], ReplayLine::Failed { line: 103, .. }));
    for result in &results[102..] {
        assert!(matches!(
            result,
            ReplayLine::Applied {
                result: EventOutcome::Subscription(SubscriptionOutcome::Credited { count: 1, .. }),
                ..
            }
        ));
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.confirmed, 50);
    assert_eq!(stats.total_credited, 50);
    for n in 1..=50u64 {
        assert_eq!(engine.rewards().current_count(UserId(100 * n)).unwrap(), 1);
    }
}
