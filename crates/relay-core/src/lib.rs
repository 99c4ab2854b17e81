//! # relay-core
//!
//! Record store, connection registry and delivery engine for the Relay
//! broadcast server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **RecordStore** - Ordered collection of live records with id assignment
//! - **ConnectionRegistry** - Live connections and what each one knows
//! - **Relay** - Applies actions and decides what each connection receives
//! - **Outbound** - Non-blocking send capability supplied by the transport
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│    Relay    │────▶│ RecordStore │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │  Outbound   │◀────│  Registry   │
//! └─────────────┘     └─────────────┘
//! ```

pub mod engine;
pub mod outbound;
pub mod registry;
pub mod store;

pub use engine::{
    ApplyReport, Delivery, IgnoreReason, JoinError, Outcome, Relay, RelayConfig, RelayStats,
    ScopeTransition, DEFAULT_MAX_CONNECTIONS,
};
pub use outbound::{ChannelOutbound, Outbound, OutboundError};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use store::{RecordStore, StoreError};
