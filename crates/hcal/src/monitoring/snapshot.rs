// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Snapshot structures for monitoring.

use crate::context::ContextInner;
use crate::directory::DirectoryMetricsSnapshot;
use crate::entity::{DataTypeInformation, EntityId, LayerKind, ServiceRole, TopicDirection};
use crate::registration::{
    MethodInfo, ProcessSeverity, RegistrationSample, SampleBody, TopicStatistics,
};

/// View of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessView {
    pub entity: EntityId,
    pub process_name: String,
    pub unit_name: String,
    pub severity: ProcessSeverity,
    pub state_info: String,
    pub attributes: Vec<(String, String)>,
    pub is_local: bool,
}

/// View of one publisher or subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicView {
    pub entity: EntityId,
    pub direction: TopicDirection,
    pub topic_name: String,
    pub data_type: DataTypeInformation,
    /// Layers announced as enabled and available
    pub announced_layers: Vec<LayerKind>,
    /// Layers currently carrying data (local entities only, empty otherwise)
    pub layers_in_use: Vec<LayerKind>,
    pub statistics: TopicStatistics,
    pub is_local: bool,
}

/// View of one service server or client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub entity: EntityId,
    pub role: ServiceRole,
    pub service_name: String,
    pub methods: Vec<MethodInfo>,
    pub tcp_port: u16,
    pub is_local: bool,
}

/// Directory entries per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityCounts {
    pub processes: usize,
    pub publishers: usize,
    pub subscribers: usize,
    pub servers: usize,
    pub clients: usize,
}

impl EntityCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.processes + self.publishers + self.subscribers + self.servers + self.clients
    }
}

/// Registration traffic of this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrationCounters {
    pub datagrams_sent: u64,
    pub send_errors: u64,
    /// Entities registered by this context, process included
    pub local_entities: usize,
}

/// Monitoring snapshot of one context.
#[derive(Debug, Clone)]
pub struct MonitoringSnapshot {
    pub host_name: String,
    pub process: EntityId,
    pub processes: Vec<ProcessView>,
    pub topics: Vec<TopicView>,
    pub services: Vec<ServiceView>,
    pub counts: EntityCounts,
    pub directory: DirectoryMetricsSnapshot,
    pub registration: RegistrationCounters,
}

impl MonitoringSnapshot {
    pub(crate) fn capture(ctx: &ContextInner) -> Self {
        crate::trace_fn!("MonitoringSnapshot::capture");
        let is_local = |sample: &RegistrationSample| ctx.registry.owns(sample.entity.id());

        let processes: Vec<ProcessView> = ctx
            .directory
            .processes()
            .into_iter()
            .filter_map(|sample| {
                let local = is_local(&sample);
                match sample.body {
                    SampleBody::Process(info) => Some(ProcessView {
                        entity: sample.entity,
                        process_name: info.process_name,
                        unit_name: info.unit_name,
                        severity: info.severity,
                        state_info: info.state_info,
                        attributes: info.attributes,
                        is_local: local,
                    }),
                    _ => None,
                }
            })
            .collect();

        let topics: Vec<TopicView> = ctx
            .directory
            .topics()
            .into_iter()
            .filter_map(|sample| {
                let local = is_local(&sample);
                let layers_in_use = if local {
                    ctx.registry
                        .counters(sample.entity.id())
                        .map(|c| c.layers_in_use())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                let announced_layers = sample.topic()?.available_layers().collect();
                match sample.body {
                    SampleBody::Topic(info) => Some(TopicView {
                        entity: sample.entity,
                        direction: info.direction,
                        topic_name: info.topic_name,
                        data_type: info.data_type,
                        announced_layers,
                        layers_in_use,
                        statistics: info.stats,
                        is_local: local,
                    }),
                    _ => None,
                }
            })
            .collect();

        let services: Vec<ServiceView> = ctx
            .directory
            .services()
            .into_iter()
            .filter_map(|sample| {
                let local = is_local(&sample);
                match sample.body {
                    SampleBody::Service(info) => Some(ServiceView {
                        entity: sample.entity,
                        role: info.role,
                        service_name: info.service_name,
                        methods: info.methods,
                        tcp_port: info.tcp_port,
                        is_local: local,
                    }),
                    _ => None,
                }
            })
            .collect();

        let counts = EntityCounts {
            processes: processes.len(),
            publishers: topics
                .iter()
                .filter(|t| t.direction == TopicDirection::Publisher)
                .count(),
            subscribers: topics
                .iter()
                .filter(|t| t.direction == TopicDirection::Subscriber)
                .count(),
            servers: services.iter().filter(|s| s.role == ServiceRole::Server).count(),
            clients: services.iter().filter(|s| s.role == ServiceRole::Client).count(),
        };
        let (datagrams_sent, send_errors) = ctx.provider.counters();

        Self {
            host_name: ctx.registry.host_name().to_string(),
            process: ctx.process.clone(),
            processes,
            topics,
            services,
            counts,
            directory: ctx.directory.metrics(),
            registration: RegistrationCounters {
                datagrams_sent,
                send_errors,
                local_entities: ctx.registry.len(),
            },
        }
    }

    /// Local publishers and subscribers of `topic`.
    #[must_use]
    pub fn local_topic(&self, topic: &str) -> Vec<&TopicView> {
        self.topics
            .iter()
            .filter(|t| t.is_local && t.topic_name == topic)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::context::Context;
    use crate::entity::{ServiceRole, TopicDirection};
    use std::time::{Duration, Instant};

    #[test]
    fn test_snapshot_counts_local_entities() {
        let ctx = Context::builder()
            .config(Config::in_process())
            .start()
            .expect("context");
        let _publisher = ctx
            .create_publisher("telemetry", Default::default())
            .expect("publisher");
        let _subscriber = ctx
            .create_subscriber("telemetry", Default::default())
            .expect("subscriber");
        let server = ctx.create_service_server("status").expect("server");

        let snapshot = ctx.monitoring();
        assert_eq!(snapshot.counts.processes, 1);
        assert_eq!(snapshot.counts.publishers, 1);
        assert_eq!(snapshot.counts.subscribers, 1);
        assert_eq!(snapshot.counts.servers, 1);
        assert_eq!(snapshot.counts.clients, 0);
        assert_eq!(snapshot.counts.total(), 4);
        assert!(snapshot.processes[0].is_local);
        assert_eq!(snapshot.registration.local_entities, 4);

        let service = &snapshot.services[0];
        assert_eq!(service.role, ServiceRole::Server);
        assert_eq!(service.tcp_port, server.port());
        let topics = snapshot.local_topic("telemetry");
        assert_eq!(topics.len(), 2);
        assert!(topics.iter().all(|t| !t.announced_layers.is_empty()));
    }

    #[test]
    fn test_snapshot_reports_layer_in_use() {
        let ctx = Context::builder()
            .config(Config::in_process().with_shm_domain(format!("mon{}", fastrand::u32(..))))
            .start()
            .expect("context");
        let publisher = ctx
            .create_publisher("in_use", Default::default())
            .expect("publisher");
        let _subscriber = ctx
            .create_subscriber("in_use", Default::default())
            .expect("subscriber");

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = ctx.monitoring();
            let view = snapshot
                .local_topic("in_use")
                .into_iter()
                .find(|t| t.direction == TopicDirection::Publisher)
                .cloned()
                .expect("publisher view");
            if !view.layers_in_use.is_empty() {
                assert_eq!(
                    view.layers_in_use,
                    publisher.active_layers().into_iter().collect::<Vec<_>>()
                );
                break;
            }
            assert!(Instant::now() < deadline, "no layer selected");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
