//! Actors of a node
//!
//! Each actor runs as an independent tokio task and is driven through a
//! cloneable handle.
//!
//! ## Architecture Overview
//!
//! ```text
//!   CEP engine ──rule match──▶ StatementSubscriber
//!                                     │ enqueue (never blocks)
//!                                     ▼
//!                           ┌──────────────────┐
//!                           │  EventForwarder  │ single worker, retries to tail
//!                           └────────┬─────────┘
//!                                    │ publish
//!                     ┌──────────────┴──────────────┐
//!                     ▼                             ▼
//!              local CEP engine              remote broker
//!              (local bypass)              (next grouping level)
//! ```
//!
//! ## Actor Types
//!
//! - **EventForwarder**: drains the publish/forward queue with bounded retries
//! - **StatsPrinter**: logs publish/forward counters at a fixed rate
//!
//! ## Communication Patterns
//!
//! 1. **Tasks**: unbounded mpsc queue feeding the forwarder
//! 2. **Commands**: each actor has an mpsc command channel for control messages
//! 3. **Events**: topology changes are broadcast to interested parties
//! 4. **Request/Response**: oneshot channels for synchronous queries

pub mod forwarder;
pub mod messages;
pub mod stats_printer;
