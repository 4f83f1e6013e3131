// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration sample model.
//!
//! A [`RegistrationSample`] is what every entity broadcasts each refresh tick
//! and what the directory stores per entity.

use crate::entity::{
    DataTypeInformation, EntityId, EntityKind, LayerKind, ServiceRole, TopicDirection,
    TransportLayer,
};

/// Register or leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    Unregister,
}

/// Coarse process health, announced with the process registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessSeverity {
    #[default]
    Unknown,
    Healthy,
    Warning,
    Critical,
    Failed,
}

impl ProcessSeverity {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Warning => 2,
            Self::Critical => 3,
            Self::Failed => 4,
        }
    }

    pub(crate) fn from_wire_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unknown,
            1 => Self::Healthy,
            2 => Self::Warning,
            3 => Self::Critical,
            4 => Self::Failed,
            _ => return None,
        })
    }
}

/// Process registration body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessInfo {
    pub process_name: String,
    pub unit_name: String,
    pub severity: ProcessSeverity,
    pub state_info: String,
    pub attributes: Vec<(String, String)>,
}

/// Counters carried with each topic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopicStatistics {
    /// Messages sent (publisher) or received (subscriber)
    pub data_clock: u64,
    pub message_drops: u64,
    pub connections_local: u32,
    pub connections_external: u32,
}

/// Publisher or subscriber registration body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub direction: TopicDirection,
    pub topic_name: String,
    pub data_type: DataTypeInformation,
    pub layers: Vec<TransportLayer>,
    pub stats: TopicStatistics,
}

impl TopicInfo {
    /// Layers enabled and not marked unavailable.
    pub fn available_layers(&self) -> impl Iterator<Item = LayerKind> + '_ {
        self.layers.iter().filter(|l| l.available).map(TransportLayer::kind)
    }

    /// Parameters announced for `kind`.
    pub fn layer(&self, kind: LayerKind) -> Option<&TransportLayer> {
        self.layers.iter().find(|l| l.kind() == kind)
    }
}

/// Method description announced by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub request_type: DataTypeInformation,
    pub response_type: DataTypeInformation,
}

/// Server or client registration body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub role: ServiceRole,
    pub service_name: String,
    pub methods: Vec<MethodInfo>,
    /// Listening port (servers only, 0 for clients)
    pub tcp_port: u16,
    pub protocol_min: u8,
    pub protocol_max: u8,
}

/// Tagged registration payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleBody {
    Process(ProcessInfo),
    Topic(TopicInfo),
    Service(ServiceInfo),
}

/// One registration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSample {
    pub command: Command,
    /// Increases with every broadcast of this entity
    pub clock: u64,
    pub entity: EntityId,
    pub body: SampleBody,
}

impl RegistrationSample {
    pub fn kind(&self) -> EntityKind {
        match &self.body {
            SampleBody::Process(_) => EntityKind::Process,
            SampleBody::Topic(t) => match t.direction {
                TopicDirection::Publisher => EntityKind::Publisher,
                TopicDirection::Subscriber => EntityKind::Subscriber,
            },
            SampleBody::Service(s) => match s.role {
                ServiceRole::Server => EntityKind::Server,
                ServiceRole::Client => EntityKind::Client,
            },
        }
    }

    /// Topic or service name (process name for process samples).
    pub fn name(&self) -> &str {
        match &self.body {
            SampleBody::Process(p) => &p.process_name,
            SampleBody::Topic(t) => &t.topic_name,
            SampleBody::Service(s) => &s.service_name,
        }
    }

    pub fn topic(&self) -> Option<&TopicInfo> {
        match &self.body {
            SampleBody::Topic(t) => Some(t),
            _ => None,
        }
    }

    pub fn service(&self) -> Option<&ServiceInfo> {
        match &self.body {
            SampleBody::Service(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.command == Command::Register
    }

    /// Copy of this sample turned into a leaving message.
    #[must_use]
    pub fn to_unregister(&self) -> Self {
        let mut sample = self.clone();
        sample.command = Command::Unregister;
        sample.clock = self.clock.wrapping_add(1);
        sample
    }

    /// True when everything a connection depends on is identical.
    ///
    /// Statistics and process state are ignored so that refreshes carrying
    /// only new counters do not trigger re-evaluation.
    pub fn same_connection_inputs(&self, other: &RegistrationSample) -> bool {
        match (&self.body, &other.body) {
            (SampleBody::Topic(a), SampleBody::Topic(b)) => {
                a.direction == b.direction
                    && a.topic_name == b.topic_name
                    && a.data_type == b.data_type
                    && a.layers == b.layers
            }
            (SampleBody::Service(a), SampleBody::Service(b)) => a == b,
            (SampleBody::Process(a), SampleBody::Process(b)) => {
                a.process_name == b.process_name && a.unit_name == b.unit_name
            }
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entity::{LayerParameters, TcpLayerParams};

    pub(crate) fn topic_sample(
        id: u64,
        host: &str,
        direction: TopicDirection,
        topic: &str,
        layers: Vec<TransportLayer>,
    ) -> RegistrationSample {
        RegistrationSample {
            command: Command::Register,
            clock: 1,
            entity: EntityId::new(id, 100, host),
            body: SampleBody::Topic(TopicInfo {
                direction,
                topic_name: topic.to_string(),
                data_type: DataTypeInformation::default(),
                layers,
                stats: TopicStatistics::default(),
            }),
        }
    }

    #[test]
    fn test_kind_and_name() {
        let s = topic_sample(1, "h", TopicDirection::Subscriber, "chatter", vec![]);
        assert_eq!(s.kind(), EntityKind::Subscriber);
        assert_eq!(s.name(), "chatter");
        assert!(s.topic().is_some());
        assert!(s.service().is_none());
    }

    #[test]
    fn test_statistics_do_not_change_connection_inputs() {
        let a = topic_sample(1, "h", TopicDirection::Publisher, "t", vec![]);
        let mut b = a.clone();
        if let SampleBody::Topic(t) = &mut b.body {
            t.stats.data_clock = 99;
        }
        assert!(a.same_connection_inputs(&b));

        if let SampleBody::Topic(t) = &mut b.body {
            t.layers
                .push(TransportLayer::new(LayerParameters::Tcp(TcpLayerParams {
                    port: 1,
                })));
        }
        assert!(!a.same_connection_inputs(&b));
    }

    #[test]
    fn test_available_layers_skip_unavailable() {
        let mut tcp = TransportLayer::new(LayerParameters::Tcp(TcpLayerParams { port: 1 }));
        tcp.available = false;
        let s = topic_sample(1, "h", TopicDirection::Publisher, "t", vec![tcp]);
        let info = s.topic().expect("topic");
        assert_eq!(info.available_layers().count(), 0);
        assert!(info.layer(LayerKind::Tcp).is_some());
    }

    #[test]
    fn test_to_unregister_bumps_clock() {
        let s = topic_sample(1, "h", TopicDirection::Publisher, "t", vec![]);
        let u = s.to_unregister();
        assert_eq!(u.command, Command::Unregister);
        assert_eq!(u.clock, s.clock + 1);
    }
}
