//! Crosswire: ChatOps ingestion and routing engine.
//!
//! Connects workspace chat platforms (Slack, Microsoft Teams) to a
//! fleet of backend agents through a single ingestion layer: webhook
//! authentication, delivery deduplication, channel-to-agent bindings,
//! an inline "switch agent" syntax, sender authorization, and channel
//! discovery reconciliation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           ingress                               │
//! │   rate limit -> verify signature -> challenge -> ack + spawn    │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼──────────────────────────────────┐
//! │                        ChatOpsManager                           │
//! │   dedup -> binding -> inline override -> security -> context    │
//! │         -> execute (backend) -> reply via adapter               │
//! └───────┬──────────────────┬─────────────────────┬────────────────┘
//!         │                  │                     │
//!   ┌─────▼─────┐      ┌─────▼─────┐        ┌──────▼──────┐
//!   │ providers │      │   store   │        │   backend   │
//!   │ slack/    │      │ bindings, │        │ agents,     │
//!   │ teams     │      │ dedup,    │        │ users,      │
//!   │ adapters  │      │ settings  │        │ execution   │
//!   └───────────┘      └───────────┘        └─────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingress;
pub mod manager;
pub mod matcher;
pub mod providers;
pub mod store;

pub use error::{Error, Result};
pub use manager::{ChatOpsManager, DenialReason, DiscoveryReport, ProcessOutcome};
pub use providers::{ChatProvider, IncomingMessage, ProviderAdapter};
