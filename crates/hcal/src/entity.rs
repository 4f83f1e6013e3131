// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity identity and the descriptive types carried in registrations.
//!
//! An entity is a publisher, subscriber, service server, or service client.
//! Every entity gets an [`EntityId`] from the [`EntityIdAllocator`] of the
//! context that created it. Ids compare by their integer only; process id and
//! host name ride along for locality decisions and monitoring.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// EntityId
// ============================================================================

/// System-wide identity of one entity instance.
///
/// Equality and hashing use [`EntityId::id`] only.
#[derive(Debug, Clone)]
pub struct EntityId {
    id: u64,
    process_id: u32,
    host_name: String,
}

impl EntityId {
    /// Build an id from its parts (used by decoders and tests).
    pub fn new(id: u64, process_id: u32, host_name: impl Into<String>) -> Self {
        Self {
            id,
            process_id,
            host_name: host_name.into(),
        }
    }

    /// Process-unique integer.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS process id of the owner.
    #[inline]
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Host name of the owner.
    #[inline]
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// True if both ids were allocated on the same host.
    #[must_use]
    pub fn same_host(&self, other: &EntityId) -> bool {
        self.host_name == other.host_name
    }

    /// True if both ids belong to the same process on the same host.
    #[must_use]
    pub fn same_process(&self, other: &EntityId) -> bool {
        self.same_host(other) && self.process_id == other.process_id
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:016x}", self.host_name, self.process_id, self.id)
    }
}

/// Allocates process-unique entity ids.
///
/// The upper 32 bits are a salt hashed from host, pid and start time so that
/// independently started processes do not hand out the same integers.
#[derive(Debug)]
pub struct EntityIdAllocator {
    salt: u64,
    next: AtomicU32,
    process_id: u32,
    host_name: String,
}

impl EntityIdAllocator {
    /// Create an allocator for this process.
    pub fn new(host_name: impl Into<String>) -> Self {
        let host_name = host_name.into();
        let process_id = std::process::id();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seed = format!("{host_name}/{process_id}/{nanos}");
        let salt = u64::from(hash_string(&seed)) << 32;
        Self {
            salt,
            next: AtomicU32::new(1),
            process_id,
            host_name,
        }
    }

    /// Hand out the next id. Never fails.
    pub fn allocate(&self) -> EntityId {
        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        EntityId {
            id: self.salt | u64::from(counter),
            process_id: self.process_id,
            host_name: self.host_name.clone(),
        }
    }

    /// True if `id` was handed out by this allocator.
    #[must_use]
    pub fn issued(&self, id: u64) -> bool {
        id & 0xFFFF_FFFF_0000_0000 == self.salt
            && (id as u32) < self.next.load(Ordering::Relaxed)
    }

    /// Host name stamped into allocated ids.
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Process id stamped into allocated ids.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

/// FNV-1a hash for strings.
pub(crate) fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Local host name.
///
/// Uses `gethostname(2)`, falls back to `$HOSTNAME`, then `"localhost"`.
#[must_use]
pub fn local_host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY:
    // - buf is a valid writable buffer of buf.len() bytes
    // - gethostname writes at most len bytes and returns -1 on error
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

// ============================================================================
// Entity kinds
// ============================================================================

/// Kind of a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Process,
    Publisher,
    Subscriber,
    Server,
    Client,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// Direction of a topic entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicDirection {
    Publisher,
    Subscriber,
}

impl TopicDirection {
    /// The direction a matching peer must have.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Publisher => Self::Subscriber,
            Self::Subscriber => Self::Publisher,
        }
    }
}

/// Role of a service entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Server,
    Client,
}

// ============================================================================
// Data type information
// ============================================================================

/// Payload type description supplied by encoding collaborators.
///
/// The core never interprets the descriptor bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTypeInformation {
    pub name: String,
    pub encoding: String,
    pub descriptor: Vec<u8>,
}

impl DataTypeInformation {
    pub fn new(name: impl Into<String>, encoding: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoding: encoding.into(),
            descriptor: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_descriptor(mut self, descriptor: Vec<u8>) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// True when neither name nor encoding is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.encoding.is_empty()
    }
}

// ============================================================================
// Transport layers
// ============================================================================

/// Concrete transport technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    Shm,
    Udp,
    Tcp,
}

impl LayerKind {
    pub const ALL: [LayerKind; 3] = [LayerKind::Shm, LayerKind::Udp, LayerKind::Tcp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shm => "shm",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    pub(crate) fn wire_code(self) -> u8 {
        match self {
            Self::Shm => 1,
            Self::Udp => 2,
            Self::Tcp => 3,
        }
    }

    pub(crate) fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Shm),
            2 => Some(Self::Udp),
            3 => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared memory layer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmLayerParams {
    pub domain: String,
    pub buffer_count: u32,
    pub zero_copy: bool,
    pub acknowledge_timeout_ms: Option<u32>,
}

/// UDP multicast layer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpLayerParams {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
}

/// TCP layer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpLayerParams {
    pub port: u16,
}

/// Per-layer parameters announced with a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerParameters {
    Shm(ShmLayerParams),
    Udp(UdpLayerParams),
    Tcp(TcpLayerParams),
}

impl LayerParameters {
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Shm(_) => LayerKind::Shm,
            Self::Udp(_) => LayerKind::Udp,
            Self::Tcp(_) => LayerKind::Tcp,
        }
    }
}

/// One enabled transport layer of a topic entity.
///
/// `available` is cleared by the owner when opening the layer failed locally,
/// so peers stop selecting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLayer {
    pub version: u32,
    pub available: bool,
    pub params: LayerParameters,
}

impl TransportLayer {
    pub fn new(params: LayerParameters) -> Self {
        Self {
            version: 1,
            available: true,
            params,
        }
    }

    #[inline]
    pub fn kind(&self) -> LayerKind {
        self.params.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entity_id_compares_by_integer_only() {
        let a = EntityId::new(42, 1, "host-a");
        let b = EntityId::new(42, 2, "host-b");
        let c = EntityId::new(43, 1, "host-a");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_allocator_unique_ids() {
        let alloc = EntityIdAllocator::new("host");
        let ids: HashSet<u64> = (0..1000).map(|_| alloc.allocate().id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_allocator_stamps_process() {
        let alloc = EntityIdAllocator::new("myhost");
        let id = alloc.allocate();
        assert_eq!(id.host_name(), "myhost");
        assert_eq!(id.process_id(), std::process::id());
    }

    #[test]
    fn test_allocator_recognizes_own_ids() {
        let mine = EntityIdAllocator::new("host");
        let other = EntityIdAllocator::new("host");
        let id = mine.allocate();
        assert!(mine.issued(id.id()));
        assert!(!other.issued(id.id()));
        assert!(!mine.issued(id.id() + 1));
    }

    #[test]
    fn test_locality() {
        let a = EntityId::new(1, 10, "h1");
        let b = EntityId::new(2, 11, "h1");
        let c = EntityId::new(3, 10, "h2");
        assert!(a.same_host(&b));
        assert!(!a.same_process(&b));
        assert!(!a.same_host(&c));
    }

    #[test]
    fn test_layer_kind_wire_codes() {
        for kind in LayerKind::ALL {
            assert_eq!(LayerKind::from_wire_code(kind.wire_code()), Some(kind));
        }
        assert_eq!(LayerKind::from_wire_code(0), None);
    }

    #[test]
    fn test_local_host_name_not_empty() {
        assert!(!local_host_name().is_empty());
    }

    #[test]
    fn test_data_type_empty() {
        assert!(DataTypeInformation::default().is_empty());
        assert!(!DataTypeInformation::new("Foo", "proto").is_empty());
    }
}
