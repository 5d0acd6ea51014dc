//! Sling - work dispatch, admission control and identity locking for a town
//! of AI worker agents

pub mod adapters;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod ratelimit;
pub mod subprocess;
pub mod telemetry;
