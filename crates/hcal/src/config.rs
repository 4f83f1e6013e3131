// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HCAL configuration - single source of truth for defaults.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time defaults (ports, multicast group, timing, memfile sizing)
//! - **Level 2 (Context)**: [`Config`] tree handed to [`Context`](crate::Context) at start
//! - **Level 3 (Dynamic)**: [`RuntimeConfig`] for values swapped while running (topic filter)
//!
//! Configuration *files* are not parsed here; callers build a [`Config`] in
//! code (or with [`Config::from_env`] for the two supported overrides).
//!
//! # Example
//!
//! ```ignore
//! use hcal::config::{Config, LayerKind};
//! use std::time::Duration;
//!
//! let mut config = Config::default();
//! config.registration.refresh = Duration::from_millis(200);
//! config.registration.timeout = Duration::from_secs(2);
//! config.publisher.memfile_buffer_count = 2;
//! config.validate()?;
//! ```

use crate::directory::filter::TopicFilter;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub use crate::entity::LayerKind;

// =======================================================================
// Registration timing
// =======================================================================

/// Registration refresh period (milliseconds)
///
/// Every live entity re-announces itself at this period.
pub const REGISTRATION_REFRESH_MS: u64 = 1_000;

/// Registration timeout (milliseconds)
///
/// An entity not refreshed for this long is dropped from the directory.
/// Must be at least twice [`REGISTRATION_REFRESH_MS`].
pub const REGISTRATION_TIMEOUT_MS: u64 = 10_000;

// =======================================================================
// UDP multicast
// =======================================================================

/// Base multicast group for registration and payload traffic.
pub const UDP_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

/// Mask applied to topic hashes to spread payload traffic over groups.
///
/// `0.0.0.15` yields 16 groups starting at [`UDP_MULTICAST_GROUP`].
pub const UDP_MULTICAST_MASK: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 15);

/// Registration port.
pub const UDP_REGISTRATION_PORT: u16 = 14_000;

/// Payload port.
pub const UDP_PAYLOAD_PORT: u16 = 14_002;

/// Multicast TTL.
pub const UDP_MULTICAST_TTL: u32 = 3;

/// Socket send buffer size (bytes).
pub const UDP_SNDBUF_BYTES: usize = 5 * 1024 * 1024;

/// Socket receive buffer size (bytes).
pub const UDP_RCVBUF_BYTES: usize = 5 * 1024 * 1024;

/// Largest datagram put on the wire. Bigger messages are fragmented.
pub const UDP_MAX_DATAGRAM_BYTES: usize = 65_000;

/// Largest message (after reassembly) carried over UDP.
pub const UDP_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Incomplete fragmented messages are dropped after this long (milliseconds).
pub const UDP_FRAGMENT_TIMEOUT_MS: u64 = 1_000;

/// Incomplete fragmented messages kept per receiver.
pub const UDP_FRAGMENT_MAX_PENDING: usize = 64;

// =======================================================================
// Shared memory
// =======================================================================

/// Default shared memory domain.
pub const SHM_DOMAIN: &str = "hcal";

/// Minimum memfile payload capacity (bytes).
pub const MEMFILE_MIN_SIZE_BYTES: usize = 4_096;

/// Headroom added when a memfile grows (percent of the payload size).
pub const MEMFILE_RESERVE_PERCENT: u32 = 50;

/// Default number of memfile slots.
pub const MEMFILE_BUFFER_COUNT: u32 = 1;

/// How long a writer waits for the channel's named lock (milliseconds).
pub const MEMFILE_LOCK_TIMEOUT_MS: u64 = 50;

/// Maximum readers tracked per shared memory channel.
pub const MEMFILE_MAX_READERS: usize = 64;

// =======================================================================
// TCP / services
// =======================================================================

/// Completion callback threads.
pub const TCP_READER_EXECUTORS: usize = 4;

/// Server handler threads.
pub const TCP_WRITER_EXECUTORS: usize = 4;

/// Reconnect attempts before a session reports `Disconnected`.
pub const TCP_MAX_RECONNECTIONS: u32 = 5;

/// Fixed delay between reconnect attempts (milliseconds).
pub const TCP_RECONNECT_BACKOFF_MS: u64 = 500;

/// Largest TCP frame accepted (bytes).
pub const TCP_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A layer that failed to open towards one peer is retried after this long
/// (milliseconds).
pub const LAYER_RETRY_INTERVAL_MS: u64 = 1_000;

// =======================================================================
// Errors
// =======================================================================

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Refresh period is zero
    ZeroRefresh,

    /// Timeout shorter than twice the refresh period
    RegistrationTiming { refresh: Duration, timeout: Duration },

    /// A priority list is empty
    EmptyPriorityList(&'static str),

    /// A priority list names the same layer twice
    DuplicateLayer(LayerKind),

    /// Address is not an IPv4 multicast group
    InvalidMulticastGroup(Ipv4Addr),

    /// Filter regular expression does not compile
    InvalidFilter(String),

    /// Zero memfile buffers
    ZeroBufferCount,

    /// Zero executor threads
    ZeroExecutors(&'static str),

    /// Shared memory domain contains characters not allowed in shm names
    InvalidDomain(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroRefresh => write!(f, "registration refresh must be non-zero"),
            Self::RegistrationTiming { refresh, timeout } => write!(
                f,
                "registration timeout {}ms must be at least twice the refresh {}ms",
                timeout.as_millis(),
                refresh.as_millis()
            ),
            Self::EmptyPriorityList(which) => write!(f, "{which} priority list is empty"),
            Self::DuplicateLayer(kind) => write!(f, "layer {kind} listed twice in priority list"),
            Self::InvalidMulticastGroup(addr) => write!(f, "{addr} is not a multicast group"),
            Self::InvalidFilter(msg) => write!(f, "invalid topic filter: {msg}"),
            Self::ZeroBufferCount => write!(f, "memfile buffer count must be at least 1"),
            Self::ZeroExecutors(which) => write!(f, "{which} executor count must be at least 1"),
            Self::InvalidDomain(domain) => write!(f, "invalid shared memory domain: {domain}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// =======================================================================
// Config tree
// =======================================================================

/// Which transport carries registration samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationTransportKind {
    /// UDP multicast on [`UdpConfig::registration_port`]
    Udp,
    /// Shared memory broadcast queue in [`ShmConfig::domain`]
    Shm,
    /// In-process bus (single process, tests)
    InProcess,
}

/// Registration and discovery settings.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub refresh: Duration,
    pub timeout: Duration,
    pub transport: RegistrationTransportKind,
    /// Deliver this process's own samples received over the wire
    pub loopback: bool,
    /// Slots of the shared memory broadcast queue
    pub shm_queue_size: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            refresh: Duration::from_millis(REGISTRATION_REFRESH_MS),
            timeout: Duration::from_millis(REGISTRATION_TIMEOUT_MS),
            transport: RegistrationTransportKind::Udp,
            loopback: false,
            shm_queue_size: 256,
        }
    }
}

/// UDP multicast settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub group: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub registration_port: u16,
    pub payload_port: u16,
    pub ttl: u32,
    pub sndbuf_bytes: usize,
    pub rcvbuf_bytes: usize,
    /// Outgoing interface (default: any)
    pub interface: Option<Ipv4Addr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            group: UDP_MULTICAST_GROUP,
            mask: UDP_MULTICAST_MASK,
            registration_port: UDP_REGISTRATION_PORT,
            payload_port: UDP_PAYLOAD_PORT,
            ttl: UDP_MULTICAST_TTL,
            sndbuf_bytes: UDP_SNDBUF_BYTES,
            rcvbuf_bytes: UDP_RCVBUF_BYTES,
            interface: None,
        }
    }
}

/// Shared memory settings.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    pub domain: String,
    pub lock_timeout: Duration,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            domain: SHM_DOMAIN.to_string(),
            lock_timeout: Duration::from_millis(MEMFILE_LOCK_TIMEOUT_MS),
        }
    }
}

/// TCP settings shared by the payload layer and services.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub max_reconnections: u32,
    pub reconnect_backoff: Duration,
    pub reader_executors: usize,
    pub writer_executors: usize,
    pub max_message_size: usize,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_reconnections: TCP_MAX_RECONNECTIONS,
            reconnect_backoff: Duration::from_millis(TCP_RECONNECT_BACKOFF_MS),
            reader_executors: TCP_READER_EXECUTORS,
            writer_executors: TCP_WRITER_EXECUTORS,
            max_message_size: TCP_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

/// Layer selection and per-layer settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Priority for peers on the same host (first = preferred)
    pub local_priority: Vec<LayerKind>,
    /// Priority for peers on other hosts
    pub remote_priority: Vec<LayerKind>,
    /// Allow connections to other hosts at all
    pub network_enabled: bool,
    /// Delay before a layer that failed towards one peer is tried again
    pub layer_retry_interval: Duration,
    pub udp: UdpConfig,
    pub shm: ShmConfig,
    pub tcp: TcpConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_priority: vec![LayerKind::Shm, LayerKind::Udp, LayerKind::Tcp],
            remote_priority: vec![LayerKind::Udp, LayerKind::Tcp],
            network_enabled: true,
            layer_retry_interval: Duration::from_millis(LAYER_RETRY_INTERVAL_MS),
            udp: UdpConfig::default(),
            shm: ShmConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

/// Per-entity layer enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerToggles {
    pub shm: bool,
    pub udp: bool,
    pub tcp: bool,
}

impl LayerToggles {
    pub const ALL: LayerToggles = LayerToggles {
        shm: true,
        udp: true,
        tcp: true,
    };

    pub fn is_enabled(&self, kind: LayerKind) -> bool {
        match kind {
            LayerKind::Shm => self.shm,
            LayerKind::Udp => self.udp,
            LayerKind::Tcp => self.tcp,
        }
    }

    /// Only `kind` enabled.
    pub fn only(kind: LayerKind) -> Self {
        Self {
            shm: kind == LayerKind::Shm,
            udp: kind == LayerKind::Udp,
            tcp: kind == LayerKind::Tcp,
        }
    }
}

/// Publisher defaults.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub layers: LayerToggles,
    pub memfile_min_size_bytes: usize,
    pub memfile_reserve_percent: u32,
    pub memfile_buffer_count: u32,
    /// Wait for reader acknowledgement after each shm write (`None` = no handshake)
    pub acknowledge_timeout_ms: Option<u32>,
    /// Use `write_modified` on buffers that hold the previous payload
    pub zero_copy: bool,
    /// TCP listen port (0 = ephemeral)
    pub tcp_port: u16,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            layers: LayerToggles {
                shm: true,
                udp: true,
                tcp: false,
            },
            memfile_min_size_bytes: MEMFILE_MIN_SIZE_BYTES,
            memfile_reserve_percent: MEMFILE_RESERVE_PERCENT,
            memfile_buffer_count: MEMFILE_BUFFER_COUNT,
            acknowledge_timeout_ms: None,
            zero_copy: false,
            tcp_port: 0,
        }
    }
}

/// Subscriber defaults.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub layers: LayerToggles,
    /// Capacity of the pull queue when no callback is installed
    pub queue_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            layers: LayerToggles::ALL,
            queue_capacity: 64,
        }
    }
}

/// Service defaults.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Server listen port (0 = ephemeral)
    pub server_port: u16,
    pub connect_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_port: 0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Monitoring filter.
#[derive(Debug, Clone, Default)]
pub struct MonitoringConfig {
    pub filter_include: String,
    pub filter_exclude: String,
}

/// Complete context configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub registration: RegistrationConfig,
    pub transport: TransportConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub service: ServiceConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Defaults plus environment overrides.
    ///
    /// - `HCAL_MULTICAST_IF`: IPv4 address of the multicast interface
    /// - `HCAL_SHM_DOMAIN`: shared memory domain name
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(iface) = std::env::var("HCAL_MULTICAST_IF") {
            match iface.parse::<Ipv4Addr>() {
                Ok(addr) => config.transport.udp.interface = Some(addr),
                Err(_) => log::warn!("[UDP] ignoring invalid HCAL_MULTICAST_IF={}", iface),
            }
        }
        if let Ok(domain) = std::env::var("HCAL_SHM_DOMAIN") {
            if !domain.is_empty() {
                config.transport.shm.domain = domain;
            }
        }
        config
    }

    /// Configuration for a single process without network traffic.
    ///
    /// Registration goes over the in-process bus and publishers only enable
    /// the shared memory layer.
    pub fn in_process() -> Self {
        let mut config = Self::default();
        config.registration.transport = RegistrationTransportKind::InProcess;
        config.transport.network_enabled = false;
        config.publisher.layers = LayerToggles {
            shm: true,
            udp: false,
            tcp: false,
        };
        config
    }

    /// Set registration refresh and timeout.
    #[must_use]
    pub fn with_registration_timing(mut self, refresh: Duration, timeout: Duration) -> Self {
        self.registration.refresh = refresh;
        self.registration.timeout = timeout;
        self
    }

    /// Select the registration transport.
    #[must_use]
    pub fn with_registration_transport(mut self, kind: RegistrationTransportKind) -> Self {
        self.registration.transport = kind;
        self
    }

    /// Set the shared memory domain.
    #[must_use]
    pub fn with_shm_domain(mut self, domain: impl Into<String>) -> Self {
        self.transport.shm.domain = domain.into();
        self
    }

    /// Set include/exclude topic filters.
    #[must_use]
    pub fn with_filter(mut self, include: impl Into<String>, exclude: impl Into<String>) -> Self {
        self.monitoring.filter_include = include.into();
        self.monitoring.filter_exclude = exclude.into();
        self
    }

    /// Set local and remote priority lists.
    #[must_use]
    pub fn with_priorities(mut self, local: Vec<LayerKind>, remote: Vec<LayerKind>) -> Self {
        self.transport.local_priority = local;
        self.transport.remote_priority = remote;
        self
    }

    /// Reject configurations that cannot work reliably.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reg = &self.registration;
        if reg.refresh.is_zero() {
            return Err(ConfigError::ZeroRefresh);
        }
        if reg.timeout < reg.refresh * 2 {
            return Err(ConfigError::RegistrationTiming {
                refresh: reg.refresh,
                timeout: reg.timeout,
            });
        }

        validate_priority(&self.transport.local_priority, "local")?;
        validate_priority(&self.transport.remote_priority, "remote")?;

        if !self.transport.udp.group.is_multicast() {
            return Err(ConfigError::InvalidMulticastGroup(self.transport.udp.group));
        }

        let domain = &self.transport.shm.domain;
        if domain.is_empty()
            || !domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidDomain(domain.clone()));
        }

        if self.publisher.memfile_buffer_count == 0 {
            return Err(ConfigError::ZeroBufferCount);
        }
        if self.transport.tcp.reader_executors == 0 {
            return Err(ConfigError::ZeroExecutors("reader"));
        }
        if self.transport.tcp.writer_executors == 0 {
            return Err(ConfigError::ZeroExecutors("writer"));
        }

        TopicFilter::new(
            &self.monitoring.filter_include,
            &self.monitoring.filter_exclude,
        )
        .map_err(|e| ConfigError::InvalidFilter(e.to_string()))?;

        Ok(())
    }

    /// Priority list for a locality.
    pub fn priority_for(&self, same_host: bool) -> &[LayerKind] {
        if same_host {
            &self.transport.local_priority
        } else {
            &self.transport.remote_priority
        }
    }
}

fn validate_priority(list: &[LayerKind], which: &'static str) -> Result<(), ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::EmptyPriorityList(which));
    }
    for (i, kind) in list.iter().enumerate() {
        if list[..i].contains(kind) {
            return Err(ConfigError::DuplicateLayer(*kind));
        }
    }
    Ok(())
}

// =======================================================================
// Runtime (hot) configuration
// =======================================================================

/// Values that may change while the context runs.
///
/// Readers load the current value lock-free; writers swap a whole new value.
/// Free-form attributes are announced with the process registration.
pub struct RuntimeConfig {
    filter: ArcSwap<TopicFilter>,
    attributes: DashMap<String, String>,
}

impl RuntimeConfig {
    pub fn new(filter: TopicFilter) -> Self {
        Self {
            filter: ArcSwap::from_pointee(filter),
            attributes: DashMap::new(),
        }
    }

    /// Set a free-form attribute.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Read a free-form attribute.
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(|v| v.value().clone())
    }

    /// Remove a free-form attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<String> {
        self.attributes.remove(key).map(|(_, v)| v)
    }

    /// Sorted copy of all attributes.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .attributes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// Current topic filter.
    pub fn filter(&self) -> Arc<TopicFilter> {
        self.filter.load_full()
    }

    /// Replace the topic filter. Already known topics are not re-filtered.
    pub fn set_filter(&self, filter: TopicFilter) {
        self.filter.store(Arc::new(filter));
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(TopicFilter::accept_all())
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("filter", &self.filter.load())
            .field("attributes", &self.attributes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::in_process().validate().is_ok());
    }

    #[test]
    fn test_default_priorities() {
        let config = Config::default();
        assert_eq!(
            config.priority_for(true),
            &[LayerKind::Shm, LayerKind::Udp, LayerKind::Tcp]
        );
        assert_eq!(config.priority_for(false), &[LayerKind::Udp, LayerKind::Tcp]);
    }

    #[test]
    fn test_timeout_must_be_twice_refresh() {
        let mut config = Config::default();
        config.registration.refresh = Duration::from_millis(1000);
        config.registration.timeout = Duration::from_millis(1999);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RegistrationTiming { .. })
        ));

        config.registration.timeout = Duration::from_millis(2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let mut config = Config::default();
        config.registration.refresh = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroRefresh));
    }

    #[test]
    fn test_priority_validation() {
        let mut config = Config::default();
        config.transport.remote_priority.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyPriorityList("remote"))
        );

        let mut config = Config::default();
        config.transport.local_priority = vec![LayerKind::Shm, LayerKind::Shm];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateLayer(LayerKind::Shm))
        );
    }

    #[test]
    fn test_multicast_group_validation() {
        let mut config = Config::default();
        config.transport.udp.group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMulticastGroup(_))
        ));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let mut config = Config::default();
        config.monitoring.filter_exclude = "([".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_invalid_domain_rejected() {
        let mut config = Config::default();
        config.transport.shm.domain = "a/b".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_layer_toggles() {
        let only = LayerToggles::only(LayerKind::Tcp);
        assert!(only.is_enabled(LayerKind::Tcp));
        assert!(!only.is_enabled(LayerKind::Shm));
        assert!(!only.is_enabled(LayerKind::Udp));
    }

    #[test]
    fn test_builder_setters() {
        let config = Config::default()
            .with_registration_timing(Duration::from_millis(100), Duration::from_millis(500))
            .with_shm_domain("unit")
            .with_filter("^topic_", "");
        assert_eq!(config.registration.refresh, Duration::from_millis(100));
        assert_eq!(config.transport.shm.domain, "unit");
        assert_eq!(config.monitoring.filter_include, "^topic_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_attributes() {
        let runtime = RuntimeConfig::default();
        runtime.set_attribute("b", "2");
        runtime.set_attribute("a", "1");
        assert_eq!(runtime.attribute("a").as_deref(), Some("1"));
        assert_eq!(
            runtime.attributes(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert_eq!(runtime.remove_attribute("a").as_deref(), Some("1"));
        assert!(runtime.attribute("a").is_none());
    }

    #[test]
    fn test_runtime_filter_swap() {
        let runtime = RuntimeConfig::default();
        assert!(runtime.filter().accepts("__internal"));

        runtime.set_filter(TopicFilter::new("", "^__.*$").expect("valid filter"));
        assert!(!runtime.filter().accepts("__internal"));
    }
}
