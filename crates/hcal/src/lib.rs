// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hcal - publish/subscribe and RPC middleware
//!
//! Processes discover each other through periodic registration broadcasts
//! and exchange messages over whichever transport suits each pair of
//! endpoints: shared memory on the same host, UDP multicast or TCP across
//! hosts. Request/response services run over TCP sessions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hcal::{Config, Context, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let ctx = Context::builder().config(Config::from_env()).start()?;
//!
//!     let subscriber = ctx.create_subscriber("sensors/temperature", Default::default())?;
//!     let publisher = ctx.create_publisher("sensors/temperature", Default::default())?;
//!     publisher.send_bytes(b"21.5")?;
//!
//!     if let Some(sample) = subscriber.receive(Duration::from_secs(1)) {
//!         println!("{} via {}", sample.sender_id, sample.layer);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                           Application                               |
//! |   Context -> Publisher / Subscriber / ServiceServer / ServiceClient |
//! +---------------------------------------------------------------------+
//! |                    Registration and directory                       |
//! |   EntityRegistry | RegistrationProvider | Directory | Watchdog      |
//! +---------------------------------------------------------------------+
//! |                     Transport multiplexer                           |
//! |   per-peer layer selection by locality and priority                 |
//! +---------------------------------------------------------------------+
//! |                          Layers                                     |
//! |   Shared memory | UDP multicast | TCP (mio)                         |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Context`] | One middleware instance, factory for all entities |
//! | [`Publisher`] | Sends messages on a topic |
//! | [`Subscriber`] | Receives messages of a topic |
//! | [`ServiceServer`] | Offers named methods over TCP |
//! | [`ServiceClient`] | Calls the methods of every matching server |
//! | [`Config`] | Static configuration, validated at start |
//!
//! ## Modules Overview
//!
//! - [`context`] - Context and builder (start here)
//! - [`pubsub`] - Publishers and subscribers
//! - [`service`] - RPC sessions
//! - [`registration`] - Registration samples, codec and carriers
//! - [`directory`] - Discovered entities, expiry and topic filter
//! - [`transport`] - Layer multiplexer and layer implementations
//! - [`monitoring`] - Snapshots of a running context

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

pub mod config;
pub mod context;
pub mod directory;
pub mod entity;
pub mod error;
#[macro_use]
pub mod logging;
pub mod monitoring;
pub mod pubsub;
pub mod registration;
pub mod registry;
pub mod service;
pub mod transport;
pub mod wire;

mod executor;
mod worker;

pub use config::{Config, ConfigError, LayerKind, RegistrationTransportKind, RuntimeConfig};
pub use context::{Context, ContextBuilder};
pub use directory::{DirectoryEvent, ObserverId, TopicFilter};
pub use entity::{DataTypeInformation, EntityId, EntityKind, ServiceRole, TopicDirection};
pub use error::{Error, Result};
pub use monitoring::MonitoringSnapshot;
pub use pubsub::{Publisher, ReceiveCallback, Received, Subscriber};
pub use registration::{InProcessBus, ProcessSeverity, RegistrationSample};
pub use service::{
    CallState, RemoteExceptionCode, ServiceClient, ServiceError, ServiceResponse, ServiceServer,
    SessionEvent, SessionState,
};
pub use transport::shm::{BytesPayload, PayloadWriter};
pub use transport::LayerEvent;
