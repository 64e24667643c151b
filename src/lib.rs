//! Referral attribution engine.
//!
//! Issues invite codes, attributes joiners to the referrer whose code they
//! used, and credits the referrer once the joiner is verified subscribed to a
//! channel. See [`orchestrator::Orchestrator`] for the entry points.

pub mod codec;
pub mod config;
pub mod gate;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod replay;
pub mod reward;
pub mod storage;
pub mod sweep;
