// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitoring snapshots.
//!
//! Point-in-time views of one context: every directory entry (local and
//! remote), per-kind entity counts, and for local publishers and
//! subscribers the transport layers actually carrying data. Taken with
//! [`Context::monitoring`](crate::Context::monitoring); nothing is held
//! across calls.

pub mod snapshot;

pub use snapshot::{
    EntityCounts, MonitoringSnapshot, ProcessView, RegistrationCounters, ServiceView, TopicView,
};
