// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber: receives one topic from every matched publisher.

use super::{reconcile_peer, LayerEventCallback, Routed, TopicEntity};
use crate::context::ContextInner;
use crate::directory::{DirectoryEvent, DirectoryListener, ObserverId};
use crate::entity::{DataTypeInformation, EntityId, LayerKind, TopicDirection, TransportLayer};
use crate::error::{Error, Result};
use crate::registration::{RegistrationSample, SampleBody, TopicInfo, TopicStatistics};
use crate::registry::TopicCounters;
use crate::transport::shm::{self, ChannelOptions, ShmLayerReader, WriteParams};
use crate::transport::tcp::{self, LinkLost, TcpLayerReader};
use crate::transport::udp::{self, UdpLayerReader};
use crate::transport::{
    sample_sink, LayerError, LayerEvent, LayerReader, LinkError, LinkOpener, Multiplexer,
    ReceivedSample, Reconciled, SampleSink,
};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One delivered sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Entity id of the publisher
    pub sender_id: u64,
    /// Send clock, increasing per publisher and layer
    pub clock: u64,
    /// Send time set by the publisher (microseconds since the Unix epoch)
    pub timestamp: i64,
    /// Layer the sample arrived on
    pub layer: LayerKind,
    pub payload: Vec<u8>,
}

/// Receive callback, run on the layer's reader thread.
pub type ReceiveCallback = Arc<dyn Fn(&Received) + Send + Sync>;

#[derive(Default)]
struct Readers {
    shm: Option<ShmLayerReader>,
    udp: Option<UdpLayerReader>,
    tcp: Option<TcpLayerReader>,
}

struct SubscriberShared {
    me: Weak<SubscriberShared>,
    entity: TopicEntity,
    topic: String,
    mux: Multiplexer,
    readers: Mutex<Readers>,
    counters: Arc<TopicCounters>,
    /// (publisher, layer) -> last accepted clock
    last_clock: Mutex<HashMap<(u64, LayerKind), u64>>,
    callback: Mutex<Option<ReceiveCallback>>,
    queue: (Sender<Received>, Receiver<Received>),
}

impl SubscriberShared {
    fn sink(&self) -> SampleSink {
        let me = Weak::clone(&self.me);
        sample_sink(move |sample| {
            if let Some(shared) = me.upgrade() {
                shared.deliver(sample);
            }
        })
    }

    /// Reports links that dropped without being closed by us.
    fn on_lost(&self, layer: LayerKind) -> LinkLost {
        let me = Weak::clone(&self.me);
        Arc::new(move |peer_id| {
            if let Some(shared) = me.upgrade() {
                shared.link_lost(peer_id, layer);
            }
        })
    }

    /// Drop the dead link and pick a layer again.
    fn link_lost(&self, peer_id: u64, layer: LayerKind) {
        let Some(event) = self.mux.link_lost(&self.entity.id, peer_id, layer) else {
            return;
        };
        self.record_connections();
        self.entity.report(&[event]);
        if let Some(peer) = self.entity.ctx.directory.get(peer_id) {
            self.reconcile(&peer);
        }
    }

    fn reader(&self, readers: &mut Readers, kind: LayerKind) -> std::result::Result<(), LayerError> {
        let ctx = &self.entity.ctx;
        match kind {
            LayerKind::Shm if readers.shm.is_none() => {
                readers.shm = Some(ShmLayerReader::new(&self.topic, self.sink()));
            }
            LayerKind::Udp if readers.udp.is_none() => {
                readers.udp = Some(UdpLayerReader::new(
                    &self.topic,
                    ctx.config.transport.udp.clone(),
                    self.sink(),
                ));
            }
            LayerKind::Tcp if readers.tcp.is_none() => {
                readers.tcp = Some(TcpLayerReader::new(
                    &self.topic,
                    &ctx.config.transport.tcp,
                    ctx.registry.host_name(),
                    self.sink(),
                    self.on_lost(LayerKind::Tcp),
                )?);
            }
            _ => {}
        }
        Ok(())
    }

    /// Entry point of every layer reader.
    fn deliver(&self, sample: &ReceivedSample<'_>) {
        // Only the layer selected for this publisher is accepted.
        if self.mux.selected(sample.sender_id) != Some(sample.layer) {
            return;
        }
        {
            let mut clocks = self.last_clock.lock();
            let last = clocks.entry((sample.sender_id, sample.layer)).or_insert(0);
            if sample.clock <= *last {
                return;
            }
            // Shm clocks are per channel, shared by all writers of the topic.
            if sample.layer != LayerKind::Shm && *last > 0 && sample.clock > *last + 1 {
                self.counters
                    .message_drops
                    .fetch_add(sample.clock - *last - 1, Ordering::Relaxed);
            }
            *last = sample.clock;
        }
        self.counters.data_clock.fetch_add(1, Ordering::Relaxed);

        let received = Received {
            sender_id: sample.sender_id,
            clock: sample.clock,
            timestamp: sample.timestamp,
            layer: sample.layer,
            payload: sample.payload.to_vec(),
        };
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&received);
            return;
        }
        let (tx, rx) = &self.queue;
        if let Err(TrySendError::Full(received)) = tx.try_send(received) {
            // Oldest sample makes room.
            let _ = rx.try_recv();
            self.counters.message_drops.fetch_add(1, Ordering::Relaxed);
            let _ = tx.try_send(received);
        }
    }

    fn reconcile(&self, peer: &RegistrationSample) {
        let outcome = reconcile_peer(&self.entity, &self.mux, self, peer);
        self.settle(outcome);
    }

    fn settle(&self, outcome: Reconciled) {
        self.record_connections();
        self.entity.report(&outcome.events);
        if !outcome.failed.is_empty() && self.entity.mark_unavailable(&outcome.failed) {
            for peer_id in self.mux.peer_ids() {
                if let Some(peer) = self.entity.ctx.directory.get(peer_id) {
                    self.reconcile(&peer);
                }
            }
        }
    }

    fn record_connections(&self) {
        let (local, external) = self.mux.connection_counts();
        self.counters.set_connections(local, external);
        self.counters.set_layers_in_use(&self.mux.active_layers());
    }

    fn forget(&self, peer: &EntityId) {
        if let Some(event) = self.mux.remove(&self.entity.id, peer, self) {
            self.record_connections();
            self.entity.report(&[event]);
        }
        self.last_clock.lock().retain(|(sender, _), _| *sender != peer.id());
    }
}

impl DirectoryListener for SubscriberShared {
    fn on_directory_event(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::Added(sample)
            | DirectoryEvent::Updated {
                sample,
                inputs_changed: true,
            } => {
                if self.entity.matches(sample) {
                    self.reconcile(sample);
                } else if sample.topic().is_some() {
                    self.forget(&sample.entity);
                }
            }
            DirectoryEvent::Removed { sample, .. } => self.forget(&sample.entity),
            // Plain refresh: retries layers whose failure has expired.
            DirectoryEvent::Updated { sample, .. } => {
                if self.entity.matches(sample) {
                    self.reconcile(sample);
                }
            }
        }
    }
}

impl LinkOpener for SubscriberShared {
    fn open_link(
        &self,
        layer: LayerKind,
        peer: &EntityId,
        params: &TransportLayer,
    ) -> std::result::Result<(), LinkError> {
        let mut readers = self.readers.lock();
        // A reader that cannot start is a local problem; a connect that fails
        // concerns the peer's announced parameters or its host.
        self.reader(&mut readers, layer)?;
        let reader: Option<&mut dyn LayerReader> = match layer {
            LayerKind::Shm => readers.shm.as_mut().map(|r| r as &mut dyn LayerReader),
            LayerKind::Udp => readers.udp.as_mut().map(|r| r as &mut dyn LayerReader),
            LayerKind::Tcp => readers.tcp.as_mut().map(|r| r as &mut dyn LayerReader),
        };
        match reader {
            Some(reader) => reader.connect(peer, params).map_err(LinkError::peer),
            None => Err(LayerError::Unavailable(layer).into()),
        }
    }

    fn close_link(&self, layer: LayerKind, peer: &EntityId) {
        let mut readers = self.readers.lock();
        match layer {
            LayerKind::Shm => {
                if let Some(r) = readers.shm.as_mut() {
                    r.disconnect(peer);
                }
            }
            LayerKind::Udp => {
                if let Some(r) = readers.udp.as_mut() {
                    r.disconnect(peer);
                }
            }
            LayerKind::Tcp => {
                if let Some(r) = readers.tcp.as_mut() {
                    r.disconnect(peer);
                }
            }
        }
    }
}

/// Receiving end of a topic.
///
/// Samples are either handed to the receive callback on the reader thread
/// or queued for [`Subscriber::receive`]. The queue keeps the newest
/// `queue_capacity` samples.
pub struct Subscriber {
    shared: Arc<SubscriberShared>,
    listener: ObserverId,
}

impl Subscriber {
    pub(crate) fn create(
        ctx: &Arc<ContextInner>,
        topic: &str,
        data_type: DataTypeInformation,
    ) -> Result<Self> {
        crate::trace_fn!("Subscriber::create");
        if topic.is_empty() {
            return Err(Error::InvalidName("empty topic name".into()));
        }
        ctx.ensure_open()?;
        let config = &ctx.config;
        let toggles = config.subscriber.layers;

        let mut layers = Vec::new();
        if toggles.shm {
            layers.push(shm::announcement(
                &ChannelOptions::from_config(&config.publisher, &config.transport.shm),
                &WriteParams::default(),
            ));
        }
        if toggles.udp && config.transport.network_enabled {
            layers.push(udp::announcement(&config.transport.udp, topic));
        }
        if toggles.tcp {
            layers.push(tcp::announcement(0));
        }

        let info = TopicInfo {
            direction: TopicDirection::Subscriber,
            topic_name: topic.to_string(),
            data_type,
            layers,
            stats: TopicStatistics::default(),
        };
        let counters = Arc::new(TopicCounters::default());
        let id = ctx
            .registry
            .register_topic(SampleBody::Topic(info.clone()), Arc::clone(&counters));

        let capacity = config.subscriber.queue_capacity.max(1);
        let shared = Arc::new_cyclic(|me| SubscriberShared {
            me: Weak::clone(me),
            entity: TopicEntity {
                ctx: Arc::clone(ctx),
                id: id.clone(),
                info: Mutex::new(info.clone()),
                events: Mutex::new(None),
            },
            topic: topic.to_string(),
            mux: Multiplexer::new(&config.transport),
            readers: Mutex::new(Readers::default()),
            counters,
            last_clock: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            queue: bounded(capacity),
        });
        let listener = ctx
            .directory
            .add_listener(Arc::new(Routed(Arc::downgrade(&shared))));

        if let Some(sample) = ctx.registry.get(&id) {
            ctx.provider.announce(&[sample]);
        }
        for peer in ctx.directory.matching_topics(&info) {
            shared.reconcile(&peer);
        }
        log::debug!("[MUX] subscriber {} on {}", id, topic);
        Ok(Self { shared, listener })
    }

    /// Wait up to `timeout` for the next queued sample.
    pub fn receive(&self, timeout: Duration) -> Option<Received> {
        self.shared.queue.1.recv_timeout(timeout).ok()
    }

    pub fn try_receive(&self) -> Option<Received> {
        self.shared.queue.1.try_recv().ok()
    }

    /// Deliver samples to `callback` instead of the queue.
    ///
    /// The callback runs on the layer's reader thread and must not block.
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(&Received) + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Arc::new(callback));
    }

    pub fn remove_receive_callback(&self) {
        *self.shared.callback.lock() = None;
    }

    /// Observe layer selection, downgrade and release events.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(&LayerEvent) + Send + Sync + 'static,
    {
        let callback: LayerEventCallback = Arc::new(callback);
        *self.shared.entity.events.lock() = Some(callback);
    }

    pub fn remove_event_callback(&self) {
        *self.shared.entity.events.lock() = None;
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.shared.entity.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Publishers with an active link.
    #[must_use]
    pub fn publisher_count(&self) -> usize {
        let (local, external) = self.shared.mux.connection_counts();
        (local + external) as usize
    }

    /// Layer carrying the connection to `publisher`.
    #[must_use]
    pub fn layer_for(&self, publisher: &EntityId) -> Option<LayerKind> {
        self.shared.mux.selected(publisher.id())
    }

    #[must_use]
    pub fn active_layers(&self) -> BTreeSet<LayerKind> {
        self.shared.mux.active_layers()
    }

    #[must_use]
    pub fn announced_layers(&self) -> Vec<TransportLayer> {
        self.shared.entity.endpoint_layers()
    }

    #[must_use]
    pub fn statistics(&self) -> TopicStatistics {
        self.shared.counters.snapshot()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let ctx = &self.shared.entity.ctx;
        ctx.directory.remove_listener(self.listener);
        self.shared.mux.clear(&*self.shared);
        ctx.leave(&self.shared.entity.id);
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.shared.entity.id)
            .field("topic", &self.shared.topic)
            .field("mux", &self.shared.mux)
            .finish()
    }
}
