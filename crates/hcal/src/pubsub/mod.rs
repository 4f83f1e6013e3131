// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publishers and subscribers.
//!
//! Both register in the entity registry, listen to the directory for peers
//! on their topic and let their [`Multiplexer`](crate::transport::Multiplexer)
//! decide which layer connects them to each peer. A layer that cannot work
//! locally is marked unavailable in the entity's own registration so peers
//! drop it too. A layer that fails towards one peer stays usable for the
//! others and is retried for that peer on a later registration refresh.

mod publisher;
mod subscriber;

pub use publisher::Publisher;
pub use subscriber::{ReceiveCallback, Received, Subscriber};

use crate::context::ContextInner;
use crate::directory::{DirectoryEvent, DirectoryListener};
use crate::entity::{EntityId, LayerKind};
use crate::registration::{RegistrationSample, SampleBody, TopicInfo};
use crate::transport::mux::Endpoint;
use crate::transport::{LayerEvent, Reconciled};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Observer of connection-level transport events.
pub type LayerEventCallback = Arc<dyn Fn(&LayerEvent) + Send + Sync>;

/// Directory listener forwarding to an entity that may already be gone.
pub(crate) struct Routed<T>(pub(crate) Weak<T>);

impl<T: DirectoryListener> DirectoryListener for Routed<T> {
    fn on_directory_event(&self, event: &DirectoryEvent) {
        if let Some(target) = self.0.upgrade() {
            target.on_directory_event(event);
        }
    }
}

/// Topic-side state shared by publishers and subscribers.
pub(crate) struct TopicEntity {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) id: EntityId,
    /// Own registration body; layers lose availability on open failures
    pub(crate) info: Mutex<TopicInfo>,
    pub(crate) events: Mutex<Option<LayerEventCallback>>,
}

impl TopicEntity {
    pub(crate) fn endpoint_layers(&self) -> Vec<crate::entity::TransportLayer> {
        self.info.lock().layers.clone()
    }

    /// True if `sample` is a peer this entity connects to.
    pub(crate) fn matches(&self, sample: &RegistrationSample) -> bool {
        if sample.entity == self.id {
            return false;
        }
        match sample.topic() {
            Some(peer) => crate::directory::topics_match(&self.info.lock(), peer),
            None => false,
        }
    }

    /// Queue transport events for the user callback.
    pub(crate) fn report(&self, events: &[LayerEvent]) {
        if events.is_empty() {
            return;
        }
        let Some(callback) = self.events.lock().clone() else {
            return;
        };
        let events = events.to_vec();
        self.ctx.callbacks.submit(move || {
            for event in &events {
                callback(event);
            }
        });
    }

    /// Clear availability of `failed` in the own registration and announce
    /// it. Returns false if nothing changed.
    pub(crate) fn mark_unavailable(&self, failed: &[LayerKind]) -> bool {
        let (topic, layers) = {
            let mut info = self.info.lock();
            let mut changed = false;
            for layer in info.layers.iter_mut() {
                if failed.contains(&layer.kind()) && layer.available {
                    layer.available = false;
                    changed = true;
                }
            }
            if !changed {
                return false;
            }
            (info.topic_name.clone(), info.layers.clone())
        };
        log::info!("[MUX] {} {}: marking {:?} unavailable", self.id, topic, failed);
        let updated = self.ctx.registry.update(&self.id, |body| {
            if let SampleBody::Topic(topic) = body {
                topic.layers = layers;
            }
        });
        if let Some(sample) = updated {
            self.ctx.provider.announce(&[sample]);
        }
        true
    }
}

/// Run one re-evaluation against `peer` for an entity.
pub(crate) fn reconcile_peer<O>(
    entity: &TopicEntity,
    mux: &crate::transport::Multiplexer,
    opener: &O,
    peer: &RegistrationSample,
) -> Reconciled
where
    O: crate::transport::LinkOpener,
{
    let own = entity.endpoint_layers();
    let theirs = peer.topic().map(|t| t.layers.as_slice()).unwrap_or_default();
    mux.reconcile(
        &Endpoint {
            id: &entity.id,
            layers: &own,
        },
        &Endpoint {
            id: &peer.entity,
            layers: theirs,
        },
        opener,
    )
}
