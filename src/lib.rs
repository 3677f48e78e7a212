// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! ambrosia: a local runtime that makes a stateful service recoverable.
//!
//! Every call into the service and every call it makes is logged before it
//! takes effect. After a crash the last checkpoint plus the log rebuild the
//! exact same state, and in an active-active deployment a standby replica
//! replaying the same log takes over without losing or repeating work.
//!
//! ```text
//! peer ──► input link ──► Committer ──► log file
//!                              │
//!                              ▼
//!                           service ──► Connections/EventBuffer ──► output link ──► peer
//! ```

pub mod config;
pub mod error;
pub mod spin;
pub mod elastic;
pub mod wire;
pub mod event_buffer;
pub mod connections;
pub mod service;
pub mod committer;
pub mod checkpoint;
pub mod roles;
pub mod recovery;
pub mod peer;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{AmbrosiaError, Result};
pub use peer::{ConnectionBroker, MemoryBroker, PeerStream};
pub use runtime::{Prepared, Runtime};
pub use service::{spawn_immortal, Immortal, Outbox, ServiceEndpoint, ServiceHandle, ServiceRequest};
