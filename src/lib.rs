//! `darklaunch` is a server-side feature flagging SDK: applications embed it
//! to ask "what value should this flag take for this user?" and get a
//! deterministic answer in microseconds, while background tasks keep the flag
//! dataset synchronized with the control plane and ship analytics events back
//! to it.
//!
//! # Overview
//!
//! The crate is organized around three subsystems:
//!
//! - the **evaluator** ([`eval`]): a pure function over flag, segment, and
//!   user data implementing targeting, rule matching, deterministic rollouts,
//!   and prerequisites;
//! - the **data-source pipeline**: streaming (server-sent events) or polling
//!   consumers feeding a versioned, snapshot-read [`store`];
//! - the **event pipeline** ([`events`]): a bounded producer/consumer that
//!   summarizes evaluations and delivers batched JSON payloads.
//!
//! [`Client`] wires the three together behind typed variation accessors.
//!
//! # Logging
//!
//! The crate logs through [`log`](https://docs.rs/log) under the
//! `darklaunch` target. Install any `log`-compatible logger to see SDK
//! activity.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod eval;
pub mod events;
pub mod store;

mod client;
mod config;
mod data_source;
mod error;
mod model;
mod str;
mod user;
mod value;

pub use client::Client;
pub use config::{Config, ConfigBuilder, ServiceEndpoints};
pub use error::{Error, Result};
pub use eval::{Detail, ErrorKind, Reason};
pub use model::{
    Clause, FeatureFlag, Prerequisite, Rollout, Rule, Segment, SegmentRule, Target,
    VariationOrRollout, WeightedVariation,
};
pub use user::{User, UserBuilder};
pub use value::Value;
