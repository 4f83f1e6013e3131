// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration and discovery protocol.
//!
//! ```text
//!  EntityRegistry --tick--> RegistrationProvider --datagrams--> carrier
//!        |                          |                              |
//!        |                   apply (local)                          v
//!        |                          v                   RegistrationReceiver
//!        +--------------------> Directory <-------------- apply (remote)
//! ```
//!
//! Entities move through `Unregistered -> Announcing -> (Stale -> removed)`:
//! they are announced every refresh period while registered, and the
//! directory of every peer drops them when no refresh arrived within the
//! timeout, or immediately on their leaving sample.

pub mod codec;
pub mod provider;
pub mod receiver;
pub mod sample;
pub mod transport;

pub use provider::RegistrationProvider;
pub use receiver::{ReceiverStats, RegistrationReceiver};
pub use sample::{
    Command, MethodInfo, ProcessInfo, ProcessSeverity, RegistrationSample, SampleBody,
    ServiceInfo, TopicInfo, TopicStatistics,
};
pub use transport::{
    DatagramHandler, InProcessBus, Listening, RegistrationTransport, ShmRegistration,
    UdpRegistration,
};
