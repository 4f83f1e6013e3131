// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer transport layer selection.
//!
//! For every matched peer the multiplexer keeps exactly one active layer:
//!
//! 1. Pick the priority list by locality (same host -> local list).
//! 2. Keep layers enabled and available on both sides, in priority order,
//!    minus the ones that recently failed to open for this peer.
//! 3. The first candidate wins. If it is already active nothing happens, so
//!    re-evaluating with unchanged inputs is free.
//! 4. A candidate that fails to open is reported as a downgrade and the next
//!    one is tried. The failure is remembered for this peer only, until the
//!    retry interval passes or the peer's registration changes.
//!
//! Failures are scoped. A [`FailureScope::Local`] failure means the layer
//! cannot work here at all and is handed back in [`Reconciled::failed`] so
//! the owner withdraws it from its own offer. A [`FailureScope::Peer`]
//! failure (unresolvable host, refused connection) only affects that peer.
//!
//! The old link is closed only after the new one is open.

use crate::config::{TransportConfig, LAYER_RETRY_INTERVAL_MS};
use crate::entity::{EntityId, LayerKind, TransportLayer};
use crate::transport::{LayerError, LayerEvent};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// What a failed open says about the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// Layer unusable for the local entity (disabled, resources missing)
    Local,
    /// Layer unusable towards this peer only
    Peer,
}

/// Failure of [`LinkOpener::open_link`].
#[derive(Debug)]
pub struct LinkError {
    pub scope: FailureScope,
    pub error: LayerError,
}

impl LinkError {
    #[must_use]
    pub fn local(error: LayerError) -> Self {
        Self {
            scope: FailureScope::Local,
            error,
        }
    }

    #[must_use]
    pub fn peer(error: LayerError) -> Self {
        Self {
            scope: FailureScope::Peer,
            error,
        }
    }
}

impl From<LayerError> for LinkError {
    fn from(error: LayerError) -> Self {
        Self::local(error)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Opens and closes the per-peer side of a layer.
///
/// Implemented by publishers (writers) and subscribers (readers). Calls are
/// serialized per multiplexer but made without its peer table locked, so
/// lookups such as [`Multiplexer::selected`] never wait on them.
/// Implementations must not call [`Multiplexer::reconcile`] re-entrantly.
pub trait LinkOpener {
    fn open_link(
        &self,
        layer: LayerKind,
        peer: &EntityId,
        params: &TransportLayer,
    ) -> Result<(), LinkError>;

    fn close_link(&self, layer: LayerKind, peer: &EntityId);
}

/// One side of a connection: identity plus announced layers.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    pub id: &'a EntityId,
    pub layers: &'a [TransportLayer],
}

impl Endpoint<'_> {
    fn offers(&self, kind: LayerKind) -> bool {
        self.layers.iter().any(|l| l.kind() == kind && l.available)
    }

    fn params(&self, kind: LayerKind) -> Option<&TransportLayer> {
        self.layers.iter().find(|l| l.kind() == kind)
    }
}

/// Outcome of one re-evaluation.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Layer carrying the connection afterwards
    pub selected: Option<LayerKind>,
    /// Transitions to report, in order
    pub events: Vec<LayerEvent>,
    /// Layers that failed locally; the owner marks them unavailable
    pub failed: Vec<LayerKind>,
}

impl Reconciled {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.events.is_empty()
    }
}

struct PeerLink {
    peer: EntityId,
    same_host: bool,
    layers: Vec<TransportLayer>,
    active: Option<LayerKind>,
    /// layer -> time of the last failed open
    failed: HashMap<LayerKind, Instant>,
}

/// Connection table of one local entity.
pub struct Multiplexer {
    local_priority: Vec<LayerKind>,
    remote_priority: Vec<LayerKind>,
    network_enabled: bool,
    retry_interval: Duration,
    /// Serializes reconcile/remove/clear; held across opener calls
    gate: Mutex<()>,
    /// Short critical sections only
    peers: Mutex<HashMap<u64, PeerLink>>,
}

impl Multiplexer {
    #[must_use]
    pub fn new(transport: &TransportConfig) -> Self {
        Self::with_priorities(
            transport.local_priority.clone(),
            transport.remote_priority.clone(),
            transport.network_enabled,
        )
        .with_retry_interval(transport.layer_retry_interval)
    }

    #[must_use]
    pub fn with_priorities(
        local_priority: Vec<LayerKind>,
        remote_priority: Vec<LayerKind>,
        network_enabled: bool,
    ) -> Self {
        Self {
            local_priority,
            remote_priority,
            network_enabled,
            retry_interval: Duration::from_millis(LAYER_RETRY_INTERVAL_MS),
            gate: Mutex::new(()),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// How long a failed layer is skipped for a peer.
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Layers usable between `local` and `peer`, best first.
    #[must_use]
    pub fn candidates(&self, local: &Endpoint<'_>, peer: &Endpoint<'_>) -> Vec<LayerKind> {
        let same_host = local.id.same_host(peer.id);
        if !same_host && !self.network_enabled {
            return Vec::new();
        }
        let priority = if same_host {
            &self.local_priority
        } else {
            &self.remote_priority
        };
        priority
            .iter()
            .copied()
            .filter(|kind| local.offers(*kind) && peer.offers(*kind))
            .collect()
    }

    /// Bring the link to `peer` in line with both sides' current layers.
    pub fn reconcile(
        &self,
        local: &Endpoint<'_>,
        peer: &Endpoint<'_>,
        opener: &dyn LinkOpener,
    ) -> Reconciled {
        crate::trace_fn!("Multiplexer::reconcile");
        let _gate = self.gate.lock();
        let candidates = self.candidates(local, peer);
        let now = Instant::now();

        let (active, viable) = {
            let mut peers = self.peers.lock();
            let link = peers.entry(peer.id.id()).or_insert_with(|| PeerLink {
                peer: peer.id.clone(),
                same_host: local.id.same_host(peer.id),
                layers: peer.layers.to_vec(),
                active: None,
                failed: HashMap::new(),
            });
            if link.layers.as_slice() != peer.layers {
                link.layers = peer.layers.to_vec();
                link.failed.clear();
            }
            let retry = self.retry_interval;
            link.failed
                .retain(|_, at| now.saturating_duration_since(*at) < retry);
            let viable: Vec<LayerKind> = candidates
                .into_iter()
                .filter(|k| !link.failed.contains_key(k))
                .collect();
            (link.active, viable)
        };

        let mut outcome = Reconciled::default();
        let mut failures: Vec<(LayerKind, LinkError)> = Vec::new();
        let mut selected = None;

        for kind in viable {
            if active == Some(kind) {
                selected = Some(kind);
                break;
            }
            let Some(params) = peer.params(kind) else {
                continue;
            };
            match opener.open_link(kind, peer.id, params) {
                Ok(()) => {
                    selected = Some(kind);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "[MUX] {} -> {}: opening {} failed ({:?}): {}",
                        local.id,
                        peer.id,
                        kind,
                        e.scope,
                        e
                    );
                    failures.push((kind, e));
                }
            }
        }

        {
            let mut peers = self.peers.lock();
            if let Some(link) = peers.get_mut(&peer.id.id()) {
                for (kind, _) in &failures {
                    link.failed.insert(*kind, now);
                }
                link.active = selected;
            }
        }

        for (from, e) in failures {
            if e.scope == FailureScope::Local {
                outcome.failed.push(from);
            }
            outcome.events.push(LayerEvent::Downgraded {
                local: local.id.clone(),
                peer: peer.id.clone(),
                from,
                to: selected,
                reason: e.to_string(),
            });
        }

        let previous = active;
        if previous != selected {
            if let Some(old) = previous {
                opener.close_link(old, peer.id);
            }
            match selected {
                Some(layer) => {
                    log::info!(
                        "[MUX] {} -> {} over {} (was {:?})",
                        local.id,
                        peer.id,
                        layer,
                        previous
                    );
                    outcome.events.push(LayerEvent::Selected {
                        local: local.id.clone(),
                        peer: peer.id.clone(),
                        layer,
                        previous,
                    });
                }
                None => {
                    if let Some(layer) = previous {
                        outcome.events.push(LayerEvent::Released {
                            local: local.id.clone(),
                            peer: peer.id.clone(),
                            layer,
                        });
                    }
                }
            }
        }
        outcome.selected = selected;
        outcome
    }

    /// The link to `peer_id` over `layer` dropped on its own.
    ///
    /// Clears the active layer and counts the drop as a failure of that
    /// layer for this peer, so the next [`reconcile`](Self::reconcile) picks
    /// a layer again. Nothing happens if `layer` is no longer active.
    pub fn link_lost(&self, local: &EntityId, peer_id: u64, layer: LayerKind) -> Option<LayerEvent> {
        let _gate = self.gate.lock();
        let mut peers = self.peers.lock();
        let link = peers.get_mut(&peer_id)?;
        if link.active != Some(layer) {
            return None;
        }
        link.active = None;
        link.failed.insert(layer, Instant::now());
        log::info!("[MUX] {} -> {} lost {}", local, link.peer, layer);
        Some(LayerEvent::Released {
            local: local.clone(),
            peer: link.peer.clone(),
            layer,
        })
    }

    /// Forget `peer`, closing its link.
    pub fn remove(
        &self,
        local: &EntityId,
        peer: &EntityId,
        opener: &dyn LinkOpener,
    ) -> Option<LayerEvent> {
        let _gate = self.gate.lock();
        let link = self.peers.lock().remove(&peer.id())?;
        let layer = link.active?;
        opener.close_link(layer, peer);
        log::debug!("[MUX] {} -> {} released {}", local, peer, layer);
        Some(LayerEvent::Released {
            local: local.clone(),
            peer: link.peer,
            layer,
        })
    }

    /// Close every link (owner shutting down).
    pub fn clear(&self, opener: &dyn LinkOpener) {
        let _gate = self.gate.lock();
        let drained: Vec<PeerLink> = self.peers.lock().drain().map(|(_, l)| l).collect();
        for link in drained {
            if let Some(layer) = link.active {
                opener.close_link(layer, &link.peer);
            }
        }
    }

    /// Active layer towards the peer with entity id `peer_id`.
    #[must_use]
    pub fn selected(&self, peer_id: u64) -> Option<LayerKind> {
        self.peers.lock().get(&peer_id).and_then(|l| l.active)
    }

    /// Union of the active layers over all peers.
    #[must_use]
    pub fn active_layers(&self) -> BTreeSet<LayerKind> {
        self.peers.lock().values().filter_map(|l| l.active).collect()
    }

    /// Peers with an active link as (same host, other host).
    #[must_use]
    pub fn connection_counts(&self) -> (u32, u32) {
        let peers = self.peers.lock();
        let mut local = 0;
        let mut external = 0;
        for link in peers.values().filter(|l| l.active.is_some()) {
            if link.same_host {
                local += 1;
            } else {
                external += 1;
            }
        }
        (local, external)
    }

    /// Known peer ids (matched, with or without an active link).
    #[must_use]
    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.lock().keys().copied().collect()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("local_priority", &self.local_priority)
            .field("remote_priority", &self.remote_priority)
            .field("retry_interval", &self.retry_interval)
            .field("peers", &self.peers.lock().len())
            .finish()
    }
}
