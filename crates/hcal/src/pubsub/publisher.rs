// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher: sends payloads of one topic over the layers its peers selected.

use super::{reconcile_peer, LayerEventCallback, Routed, TopicEntity};
use crate::context::ContextInner;
use crate::directory::{DirectoryEvent, DirectoryListener, ObserverId};
use crate::entity::{DataTypeInformation, EntityId, LayerKind, TopicDirection, TransportLayer};
use crate::error::{Error, Result};
use crate::registration::{RegistrationSample, SampleBody, TopicInfo, TopicStatistics};
use crate::registry::TopicCounters;
use crate::transport::shm::{
    self, BytesPayload, ChannelOptions, PayloadWriter, ShmLayerWriter, WriteParams,
};
use crate::transport::tcp::{self, TcpLayerWriter};
use crate::transport::udp::{self, UdpLayerWriter};
use crate::transport::{
    now_micros, serialize, LayerError, LayerEvent, LayerWriter, LinkError, LinkOpener,
    Multiplexer, OutgoingSample, Reconciled,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Layer writers of one publisher.
///
/// SHM and UDP writers open with the first peer selecting them and close
/// with the last; the TCP listener lives as long as the publisher because
/// its port is part of the registration.
#[derive(Default)]
struct Writers {
    shm: Option<ShmLayerWriter>,
    udp: Option<UdpLayerWriter>,
    tcp: Option<TcpLayerWriter>,
    users: HashMap<LayerKind, usize>,
}

impl Writers {
    fn get(&mut self, kind: LayerKind) -> Option<&mut dyn LayerWriter> {
        match kind {
            LayerKind::Shm => self.shm.as_mut().map(|w| w as &mut dyn LayerWriter),
            LayerKind::Udp => self.udp.as_mut().map(|w| w as &mut dyn LayerWriter),
            LayerKind::Tcp => self.tcp.as_mut().map(|w| w as &mut dyn LayerWriter),
        }
    }
}

struct PublisherShared {
    entity: TopicEntity,
    topic: String,
    mux: Multiplexer,
    writers: Mutex<Writers>,
    counters: Arc<TopicCounters>,
    clock: AtomicU64,
}

impl PublisherShared {
    fn reconcile(&self, peer: &RegistrationSample) {
        let outcome = reconcile_peer(&self.entity, &self.mux, self, peer);
        self.settle(outcome);
    }

    fn settle(&self, outcome: Reconciled) {
        self.record_connections();
        self.entity.report(&outcome.events);
        if !outcome.failed.is_empty() && self.entity.mark_unavailable(&outcome.failed) {
            // Own offer shrank: every peer is re-evaluated against it.
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
    }
}

impl DirectoryListener for PublisherShared {
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

impl LinkOpener for PublisherShared {
    fn open_link(
        &self,
        layer: LayerKind,
        _peer: &EntityId,
        _params: &TransportLayer,
    ) -> std::result::Result<(), LinkError> {
        // Writers serve every peer alike: all failures here are local.
        let ctx = &self.entity.ctx;
        let mut writers = self.writers.lock();
        match layer {
            LayerKind::Shm if writers.shm.is_none() => {
                let options =
                    ChannelOptions::from_config(&ctx.config.publisher, &ctx.config.transport.shm);
                let params = WriteParams::from_config(self.entity.id.id(), &ctx.config.publisher);
                writers.shm = Some(ShmLayerWriter::open(&ctx.arena, &self.topic, options, params)?);
            }
            LayerKind::Udp if writers.udp.is_none() => {
                writers.udp = Some(UdpLayerWriter::open(&ctx.config.transport.udp, &self.topic)?);
            }
            LayerKind::Tcp if writers.tcp.is_none() => {
                return Err(LayerError::Unavailable(LayerKind::Tcp).into());
            }
            _ => {}
        }
        *writers.users.entry(layer).or_default() += 1;
        Ok(())
    }

    fn close_link(&self, layer: LayerKind, _peer: &EntityId) {
        let mut writers = self.writers.lock();
        let users = writers.users.entry(layer).or_default();
        *users = users.saturating_sub(1);
        if *users > 0 {
            return;
        }
        match layer {
            LayerKind::Shm => writers.shm = None,
            LayerKind::Udp => writers.udp = None,
            LayerKind::Tcp => {}
        }
    }
}

/// Sending end of a topic.
///
/// ```rust,no_run
/// use hcal::{Config, Context};
///
/// let ctx = Context::builder().config(Config::in_process()).start()?;
/// let publisher = ctx.create_publisher("chatter", Default::default())?;
/// publisher.send_bytes(b"hello")?;
/// # Ok::<(), hcal::Error>(())
/// ```
pub struct Publisher {
    shared: Arc<PublisherShared>,
    listener: ObserverId,
}

impl Publisher {
    pub(crate) fn create(
        ctx: &Arc<ContextInner>,
        topic: &str,
        data_type: DataTypeInformation,
    ) -> Result<Self> {
        crate::trace_fn!("Publisher::create");
        if topic.is_empty() {
            return Err(Error::InvalidName("empty topic name".into()));
        }
        ctx.ensure_open()?;
        let config = &ctx.config;
        let toggles = config.publisher.layers;

        let mut layers = Vec::new();
        if toggles.shm {
            layers.push(shm::announcement(
                &ChannelOptions::from_config(&config.publisher, &config.transport.shm),
                &WriteParams::from_config(0, &config.publisher),
            ));
        }
        if toggles.udp && config.transport.network_enabled {
            layers.push(udp::announcement(&config.transport.udp, topic));
        }
        let mut writers = Writers::default();
        if toggles.tcp {
            match TcpLayerWriter::open(topic, &config.transport.tcp, config.publisher.tcp_port) {
                Ok(writer) => {
                    layers.push(tcp::announcement(writer.port()));
                    writers.tcp = Some(writer);
                }
                Err(e) => {
                    log::warn!("[TCP] {}: listener failed, tcp unavailable: {}", topic, e);
                    let mut layer = tcp::announcement(0);
                    layer.available = false;
                    layers.push(layer);
                }
            }
        }

        let info = TopicInfo {
            direction: TopicDirection::Publisher,
            topic_name: topic.to_string(),
            data_type,
            layers,
            stats: TopicStatistics::default(),
        };
        let counters = Arc::new(TopicCounters::default());
        let id = ctx
            .registry
            .register_topic(SampleBody::Topic(info.clone()), Arc::clone(&counters));

        let shared = Arc::new(PublisherShared {
            entity: TopicEntity {
                ctx: Arc::clone(ctx),
                id: id.clone(),
                info: Mutex::new(info.clone()),
                events: Mutex::new(None),
            },
            topic: topic.to_string(),
            mux: Multiplexer::new(&config.transport),
            writers: Mutex::new(writers),
            counters,
            clock: AtomicU64::new(0),
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
        log::debug!("[MUX] publisher {} on {}", id, topic);
        Ok(Self { shared, listener })
    }

    /// Send one payload to every connected subscriber.
    ///
    /// Returns the payload size, or 0 when no subscriber is connected. With
    /// shared memory as the only active layer the payload writer fills the
    /// channel buffer in place; otherwise it is serialized once and copied to
    /// each layer.
    pub fn send(&self, payload: &mut dyn PayloadWriter) -> Result<usize> {
        self.send_with_time(payload, None)
    }

    /// Send one payload stamped with `time` (microseconds since the Unix
    /// epoch); `None` stamps the current time.
    pub fn send_with_time(
        &self,
        payload: &mut dyn PayloadWriter,
        time: Option<i64>,
    ) -> Result<usize> {
        let shared = &self.shared;
        let active: BTreeSet<LayerKind> = shared.mux.active_layers();
        if active.is_empty() {
            return Ok(0);
        }
        let clock = shared.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let header = OutgoingSample {
            sender_id: shared.entity.id.id(),
            clock,
            timestamp: time.unwrap_or_else(now_micros),
            topic: &shared.topic,
        };

        let mut writers = shared.writers.lock();
        let mut sent = None;
        let mut first_error = None;
        if active.len() == 1 {
            let kind = active.iter().copied().next().unwrap_or(LayerKind::Shm);
            if let Some(writer) = writers.get(kind) {
                match writer.write(&header, payload) {
                    Ok(n) => sent = Some(n),
                    Err(e) => first_error = Some(e),
                }
            }
        } else {
            let data = serialize(payload)?;
            for kind in active {
                let Some(writer) = writers.get(kind) else {
                    continue;
                };
                match writer.write(&header, &mut BytesPayload(&data)) {
                    Ok(n) => sent = Some(n),
                    Err(e) => {
                        log::debug!("[MUX] {} send over {} failed: {}", shared.topic, kind, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        drop(writers);

        match (sent, first_error) {
            (Some(n), _) => {
                shared.counters.data_clock.fetch_add(1, Ordering::Relaxed);
                Ok(n)
            }
            (None, Some(e)) => {
                shared.counters.message_drops.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
            (None, None) => Ok(0),
        }
    }

    /// Send a byte buffer.
    pub fn send_bytes(&self, data: &[u8]) -> Result<usize> {
        self.send(&mut BytesPayload(data))
    }

    /// Send a byte buffer stamped with `time`, see [`send_with_time`](Self::send_with_time).
    pub fn send_bytes_with_time(&self, data: &[u8], time: Option<i64>) -> Result<usize> {
        self.send_with_time(&mut BytesPayload(data), time)
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

    /// Subscribers with an active link.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let (local, external) = self.shared.mux.connection_counts();
        (local + external) as usize
    }

    /// Layer carrying the connection to `subscriber`.
    #[must_use]
    pub fn layer_for(&self, subscriber: &EntityId) -> Option<LayerKind> {
        self.shared.mux.selected(subscriber.id())
    }

    /// Layers currently carrying data.
    #[must_use]
    pub fn active_layers(&self) -> BTreeSet<LayerKind> {
        self.shared.mux.active_layers()
    }

    /// Layers announced in the registration, with availability.
    #[must_use]
    pub fn announced_layers(&self) -> Vec<TransportLayer> {
        self.shared.entity.endpoint_layers()
    }

    /// Listen port of the TCP layer, if enabled.
    #[must_use]
    pub fn tcp_port(&self) -> Option<u16> {
        self.shared.writers.lock().tcp.as_ref().map(TcpLayerWriter::port)
    }

    #[must_use]
    pub fn statistics(&self) -> TopicStatistics {
        self.shared.counters.snapshot()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let ctx = &self.shared.entity.ctx;
        ctx.directory.remove_listener(self.listener);
        self.shared.mux.clear(&*self.shared);
        ctx.leave(&self.shared.entity.id);
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.shared.entity.id)
            .field("topic", &self.shared.topic)
            .field("mux", &self.shared.mux)
            .finish()
    }
}
