// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging helpers.
//!
//! All crate output goes through the [`log`] facade; installing a sink
//! (env_logger, syslog, ...) is left to the application. Messages carry a
//! bracketed component prefix so they can be filtered by subsystem:
//!
//! | Prefix  | Subsystem                          |
//! |---------|------------------------------------|
//! | `[REG]` | registration broadcast and receive |
//! | `[DIR]` | directory updates and expiry       |
//! | `[MUX]` | transport layer selection          |
//! | `[SHM]` | shared memory channel              |
//! | `[UDP]` | multicast sockets                  |
//! | `[TCP]` | TCP I/O threads                    |
//! | `[RPC]` | service sessions                   |
//!
//! The [`trace_fn!`](crate::trace_fn) macro marks function entry and is
//! compiled in only with the `trace` feature.

/// Function entry trace marker.
///
/// Logs `[ENTER:FNC] function_name` at trace level.
/// Only active when the `trace` feature is enabled.
///
/// # Example
/// ```ignore
/// fn apply_sample(sample: &RegistrationSample) {
///     trace_fn!("Directory::apply_sample");
///     // ...
/// }
/// ```
#[macro_export]
#[cfg(feature = "trace")]
macro_rules! trace_fn {
    ($fn_name:expr) => {
        log::trace!("[ENTER:FNC] {}", $fn_name);
    };
}

/// No-op trace macro (when trace feature disabled).
#[macro_export]
#[cfg(not(feature = "trace"))]
macro_rules! trace_fn {
    ($fn_name:expr) => {};
}
