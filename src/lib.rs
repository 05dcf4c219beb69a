//! A client for Unleash-compatible feature toggle servers.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature toggles for a [`Context`]
//! (user id, session id, remote address, custom properties, ...). Toggle definitions are fetched
//! from the server in the background and evaluated locally, so checking a toggle never waits for
//! the network.
//!
//! ```no_run
//! # use unleash_client::{ClientConfig, Context};
//! let client = ClientConfig::new("my-app", "https://unleash.example.com/api/")
//!     .with_authorization("client-api-token")
//!     .to_client()?;
//! client.start()?;
//!
//! let context = Context::new().with_user_id("42");
//! if client.is_enabled("new-checkout", &context, false) {
//!     // ...
//! }
//! # Ok::<(), unleash_client::Error>(())
//! ```
//!
//! The [`Repository`] owns the toggle definitions. At startup it loads bootstrap data and/or the
//! backup saved by a previous run ([`StartupPrecedence`] decides which one wins), then polls the
//! server using conditional requests. Every new set of definitions replaces the previous one
//! atomically and is written back to the backup.
//!
//! The [`StrategyEngine`] evaluates activation strategies and selects variants. Percentage
//! rollouts and variant selection hash the stickiness key with MurmurHash3, giving the same
//! results as the server and other SDKs.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only construction ([`ClientConfig::to_client`])
//! and lifecycle calls return errors. Evaluation never fails: unknown toggles and missing
//! definitions yield the caller's fallback, and misconfigured strategies or constraints are
//! treated as not matching and reported as [`Diagnostic`]s.
//!
//! Failures of the background synchronization are delivered to [`EventListener`]s as
//! [`Event::Error`] and [`Event::Warning`]; the previous definitions stay in effect.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, all under the `unleash` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! A runnable example lives in `demos/simple/main.rs`; run it with
//! `cargo run --example simple`.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod constraints;
mod context;
mod engine;
mod error;
mod poller;
mod repository;
mod snapshot_store;
#[cfg(test)]
mod test_server;

pub mod bootstrap;
pub mod events;
pub mod fetcher;
pub mod hasher;
pub mod storage;
pub mod strategy;
pub mod toggles;

pub use bootstrap::BootstrapSource;
pub use client::Client;
pub use config::ClientConfig;
pub use context::Context;
pub use engine::{Diagnostic, Evaluation, StrategyEngine};
pub use error::{Error, Result};
pub use events::{Event, EventListener};
pub use poller::PollerConfig;
pub use repository::{
    Repository, RepositoryConfig, RepositoryState, StartupPrecedence, SyncOutcome,
};
pub use toggles::{
    Constraint, Operator, StrategyConfig, ToggleDefinition, ToggleDelta, Variant,
    VariantDefinition,
};
