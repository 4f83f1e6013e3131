// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration datagram codec.
//!
//! ```text
//! +--------+---------+-----------+------------------------------------+
//! | "HCAL" | version | count u32 | count x (len u32 | sample bytes)   |
//! +--------+---------+-----------+------------------------------------+
//! ```
//!
//! A sample is `command u8 | clock u64 | id u64 | pid u32 | host str |
//! body tag u8 | body`. Transport layers are framed with their own `u16`
//! length so that decoders skip layer kinds they do not know.

use super::sample::{
    Command, MethodInfo, ProcessInfo, ProcessSeverity, RegistrationSample, SampleBody,
    ServiceInfo, TopicInfo, TopicStatistics,
};
use crate::entity::{
    DataTypeInformation, EntityId, LayerKind, LayerParameters, ServiceRole, ShmLayerParams,
    TcpLayerParams, TopicDirection, TransportLayer, UdpLayerParams,
};
use crate::wire::{CodecError, CodecResult, WireReader, WireWriter};
use std::net::Ipv4Addr;

/// Datagram magic.
pub const MAGIC: &[u8; 4] = b"HCAL";

/// Current schema version.
pub const SCHEMA_VERSION: u8 = 1;

/// Magic + version + count.
pub const DATAGRAM_HEADER_SIZE: usize = 9;

const BODY_PROCESS: u8 = 1;
const BODY_TOPIC: u8 = 2;
const BODY_SERVICE: u8 = 3;

// ============================================================================
// Datagrams
// ============================================================================

/// Pack samples into as few datagrams as fit in `max_datagram` bytes.
///
/// A sample larger than `max_datagram` gets a datagram of its own.
pub fn encode_datagrams(
    samples: &[RegistrationSample],
    max_datagram: usize,
) -> CodecResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut current = new_datagram();
    let mut count: u32 = 0;

    for sample in samples {
        let bytes = encode_sample(sample)?;
        let framed = 4 + bytes.len();
        if count > 0 && current.len() + framed > max_datagram {
            current.patch_u32(5, count);
            out.push(std::mem::replace(&mut current, new_datagram()).into_inner());
            count = 0;
        }
        current.write_bytes("sample", &bytes)?;
        count += 1;
    }

    if count > 0 {
        current.patch_u32(5, count);
        out.push(current.into_inner());
    }
    Ok(out)
}

fn new_datagram() -> WireWriter {
    let mut w = WireWriter::with_capacity(1024);
    w.write_raw(MAGIC);
    w.write_u8(SCHEMA_VERSION);
    w.write_u32(0);
    w
}

/// Decode every sample of a datagram.
///
/// A malformed sample fails the whole datagram; the sender refreshes anyway.
pub fn decode_datagram(buf: &[u8]) -> CodecResult<Vec<RegistrationSample>> {
    let mut r = WireReader::new(buf);
    if r.take(4)? != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = r.read_u8()?;
    if version != SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let count = r.read_u32()? as usize;
    let mut samples = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let bytes = r.read_bytes()?;
        samples.push(decode_sample(bytes)?);
    }
    Ok(samples)
}

// ============================================================================
// Samples
// ============================================================================

pub fn encode_sample(sample: &RegistrationSample) -> CodecResult<Vec<u8>> {
    let mut w = WireWriter::with_capacity(256);
    w.write_u8(match sample.command {
        Command::Register => 1,
        Command::Unregister => 2,
    });
    w.write_u64(sample.clock);
    w.write_u64(sample.entity.id());
    w.write_u32(sample.entity.process_id());
    w.write_str("host_name", sample.entity.host_name())?;

    match &sample.body {
        SampleBody::Process(p) => {
            w.write_u8(BODY_PROCESS);
            encode_process(&mut w, p)?;
        }
        SampleBody::Topic(t) => {
            w.write_u8(BODY_TOPIC);
            encode_topic(&mut w, t)?;
        }
        SampleBody::Service(s) => {
            w.write_u8(BODY_SERVICE);
            encode_service(&mut w, s)?;
        }
    }
    Ok(w.into_inner())
}

pub fn decode_sample(buf: &[u8]) -> CodecResult<RegistrationSample> {
    let mut r = WireReader::new(buf);
    let command = match r.read_u8()? {
        1 => Command::Register,
        2 => Command::Unregister,
        value => {
            return Err(CodecError::InvalidTag {
                field: "command",
                value,
            })
        }
    };
    let clock = r.read_u64()?;
    let id = r.read_u64()?;
    let pid = r.read_u32()?;
    let host = r.read_str()?;

    let body = match r.read_u8()? {
        BODY_PROCESS => SampleBody::Process(decode_process(&mut r)?),
        BODY_TOPIC => SampleBody::Topic(decode_topic(&mut r)?),
        BODY_SERVICE => SampleBody::Service(decode_service(&mut r)?),
        value => return Err(CodecError::InvalidTag { field: "body", value }),
    };

    Ok(RegistrationSample {
        command,
        clock,
        entity: EntityId::new(id, pid, host),
        body,
    })
}

// ============================================================================
// Bodies
// ============================================================================

fn encode_process(w: &mut WireWriter, p: &ProcessInfo) -> CodecResult<()> {
    w.write_str("process_name", &p.process_name)?;
    w.write_str("unit_name", &p.unit_name)?;
    w.write_u8(p.severity.wire_code());
    w.write_str("state_info", &p.state_info)?;
    let count = u16::try_from(p.attributes.len()).map_err(|_| CodecError::TooLong {
        field: "attributes",
        len: p.attributes.len(),
    })?;
    w.write_u16(count);
    for (key, value) in &p.attributes {
        w.write_str("attribute", key)?;
        w.write_str("attribute", value)?;
    }
    Ok(())
}

fn decode_process(r: &mut WireReader<'_>) -> CodecResult<ProcessInfo> {
    let process_name = r.read_str()?;
    let unit_name = r.read_str()?;
    let code = r.read_u8()?;
    let severity = ProcessSeverity::from_wire_code(code).ok_or(CodecError::InvalidTag {
        field: "severity",
        value: code,
    })?;
    let state_info = r.read_str()?;
    let count = r.read_u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        attributes.push((r.read_str()?, r.read_str()?));
    }
    Ok(ProcessInfo {
        process_name,
        unit_name,
        severity,
        state_info,
        attributes,
    })
}

fn encode_topic(w: &mut WireWriter, t: &TopicInfo) -> CodecResult<()> {
    w.write_u8(match t.direction {
        TopicDirection::Publisher => 1,
        TopicDirection::Subscriber => 2,
    });
    w.write_str("topic_name", &t.topic_name)?;
    encode_type(w, &t.data_type)?;

    w.write_u8(t.layers.len().min(u8::MAX as usize) as u8);
    for layer in t.layers.iter().take(u8::MAX as usize) {
        let mut inner = WireWriter::with_capacity(32);
        inner.write_u32(layer.version);
        inner.write_bool(layer.available);
        encode_layer_params(&mut inner, &layer.params)?;
        let inner = inner.into_inner();

        w.write_u8(layer.kind().wire_code());
        w.write_u16(inner.len() as u16);
        w.write_raw(&inner);
    }

    w.write_u64(t.stats.data_clock);
    w.write_u64(t.stats.message_drops);
    w.write_u32(t.stats.connections_local);
    w.write_u32(t.stats.connections_external);
    Ok(())
}

fn decode_topic(r: &mut WireReader<'_>) -> CodecResult<TopicInfo> {
    let direction = match r.read_u8()? {
        1 => TopicDirection::Publisher,
        2 => TopicDirection::Subscriber,
        value => {
            return Err(CodecError::InvalidTag {
                field: "direction",
                value,
            })
        }
    };
    let topic_name = r.read_str()?;
    let data_type = decode_type(r)?;

    let count = r.read_u8()?;
    let mut layers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let code = r.read_u8()?;
        let len = r.read_u16()? as usize;
        let bytes = r.take(len)?;
        let Some(kind) = LayerKind::from_wire_code(code) else {
            log::debug!("[REG] skipping unknown layer code {}", code);
            continue;
        };
        let mut inner = WireReader::new(bytes);
        let version = inner.read_u32()?;
        let available = inner.read_bool()?;
        let params = decode_layer_params(&mut inner, kind)?;
        layers.push(TransportLayer {
            version,
            available,
            params,
        });
    }

    let stats = TopicStatistics {
        data_clock: r.read_u64()?,
        message_drops: r.read_u64()?,
        connections_local: r.read_u32()?,
        connections_external: r.read_u32()?,
    };

    Ok(TopicInfo {
        direction,
        topic_name,
        data_type,
        layers,
        stats,
    })
}

fn encode_layer_params(w: &mut WireWriter, params: &LayerParameters) -> CodecResult<()> {
    match params {
        LayerParameters::Shm(p) => {
            w.write_str("shm_domain", &p.domain)?;
            w.write_u32(p.buffer_count);
            w.write_bool(p.zero_copy);
            w.write_bool(p.acknowledge_timeout_ms.is_some());
            w.write_u32(p.acknowledge_timeout_ms.unwrap_or(0));
        }
        LayerParameters::Udp(p) => {
            w.write_raw(&p.group.octets());
            w.write_u16(p.port);
            w.write_u32(p.ttl);
        }
        LayerParameters::Tcp(p) => {
            w.write_u16(p.port);
        }
    }
    Ok(())
}

fn decode_layer_params(r: &mut WireReader<'_>, kind: LayerKind) -> CodecResult<LayerParameters> {
    Ok(match kind {
        LayerKind::Shm => {
            let domain = r.read_str()?;
            let buffer_count = r.read_u32()?;
            let zero_copy = r.read_bool()?;
            let has_ack = r.read_bool()?;
            let ack = r.read_u32()?;
            LayerParameters::Shm(ShmLayerParams {
                domain,
                buffer_count,
                zero_copy,
                acknowledge_timeout_ms: has_ack.then_some(ack),
            })
        }
        LayerKind::Udp => {
            let octets = r.take(4)?;
            let group = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            LayerParameters::Udp(UdpLayerParams {
                group,
                port: r.read_u16()?,
                ttl: r.read_u32()?,
            })
        }
        LayerKind::Tcp => LayerParameters::Tcp(TcpLayerParams {
            port: r.read_u16()?,
        }),
    })
}

fn encode_service(w: &mut WireWriter, s: &ServiceInfo) -> CodecResult<()> {
    w.write_u8(match s.role {
        ServiceRole::Server => 1,
        ServiceRole::Client => 2,
    });
    w.write_str("service_name", &s.service_name)?;
    w.write_u16(s.tcp_port);
    w.write_u8(s.protocol_min);
    w.write_u8(s.protocol_max);
    let count = u16::try_from(s.methods.len()).map_err(|_| CodecError::TooLong {
        field: "methods",
        len: s.methods.len(),
    })?;
    w.write_u16(count);
    for m in &s.methods {
        w.write_str("method_name", &m.name)?;
        encode_type(w, &m.request_type)?;
        encode_type(w, &m.response_type)?;
    }
    Ok(())
}

fn decode_service(r: &mut WireReader<'_>) -> CodecResult<ServiceInfo> {
    let role = match r.read_u8()? {
        1 => ServiceRole::Server,
        2 => ServiceRole::Client,
        value => return Err(CodecError::InvalidTag { field: "role", value }),
    };
    let service_name = r.read_str()?;
    let tcp_port = r.read_u16()?;
    let protocol_min = r.read_u8()?;
    let protocol_max = r.read_u8()?;
    let count = r.read_u16()? as usize;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        methods.push(MethodInfo {
            name: r.read_str()?,
            request_type: decode_type(r)?,
            response_type: decode_type(r)?,
        });
    }
    Ok(ServiceInfo {
        role,
        service_name,
        methods,
        tcp_port,
        protocol_min,
        protocol_max,
    })
}

fn encode_type(w: &mut WireWriter, t: &DataTypeInformation) -> CodecResult<()> {
    w.write_str("type_name", &t.name)?;
    w.write_str("type_encoding", &t.encoding)?;
    w.write_bytes("type_descriptor", &t.descriptor)
}

fn decode_type(r: &mut WireReader<'_>) -> CodecResult<DataTypeInformation> {
    Ok(DataTypeInformation {
        name: r.read_str()?,
        encoding: r.read_str()?,
        descriptor: r.read_bytes()?.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic_with_all_layers() -> RegistrationSample {
        RegistrationSample {
            command: Command::Register,
            clock: 17,
            entity: EntityId::new(0xABCD_0000_0000_0001, 4242, "node-a"),
            body: SampleBody::Topic(TopicInfo {
                direction: TopicDirection::Publisher,
                topic_name: "camera/front".into(),
                data_type: DataTypeInformation::new("Image", "proto").with_descriptor(vec![9; 12]),
                layers: vec![
                    TransportLayer::new(LayerParameters::Shm(ShmLayerParams {
                        domain: "hcal".into(),
                        buffer_count: 2,
                        zero_copy: true,
                        acknowledge_timeout_ms: Some(20),
                    })),
                    TransportLayer::new(LayerParameters::Udp(UdpLayerParams {
                        group: Ipv4Addr::new(239, 0, 0, 3),
                        port: 14002,
                        ttl: 3,
                    })),
                    TransportLayer {
                        version: 1,
                        available: false,
                        params: LayerParameters::Tcp(TcpLayerParams { port: 40000 }),
                    },
                ],
                stats: TopicStatistics {
                    data_clock: 5,
                    message_drops: 1,
                    connections_local: 2,
                    connections_external: 0,
                },
            }),
        }
    }

    fn server_sample() -> RegistrationSample {
        RegistrationSample {
            command: Command::Unregister,
            clock: 3,
            entity: EntityId::new(2, 7, "node-b"),
            body: SampleBody::Service(ServiceInfo {
                role: ServiceRole::Server,
                service_name: "math".into(),
                methods: vec![MethodInfo {
                    name: "add".into(),
                    request_type: DataTypeInformation::new("AddReq", "raw"),
                    response_type: DataTypeInformation::new("AddResp", "raw"),
                }],
                tcp_port: 5555,
                protocol_min: 1,
                protocol_max: 1,
            }),
        }
    }

    fn process_sample() -> RegistrationSample {
        RegistrationSample {
            command: Command::Register,
            clock: 1,
            entity: EntityId::new(3, 7, "node-b"),
            body: SampleBody::Process(ProcessInfo {
                process_name: "/usr/bin/demo".into(),
                unit_name: "demo".into(),
                severity: ProcessSeverity::Healthy,
                state_info: "ok".into(),
                attributes: vec![("site".into(), "lab".into())],
            }),
        }
    }

    #[test]
    fn test_datagram_preserves_every_body_kind() {
        let samples = vec![topic_with_all_layers(), server_sample(), process_sample()];
        let datagrams = encode_datagrams(&samples, 64 * 1024).expect("encode");
        assert_eq!(datagrams.len(), 1);
        assert_eq!(&datagrams[0][..4], MAGIC);

        let decoded = decode_datagram(&datagrams[0]).expect("decode");
        assert_eq!(decoded, samples);
        // EntityId equality ignores host/pid, so check them explicitly
        assert_eq!(decoded[0].entity.host_name(), "node-a");
        assert_eq!(decoded[0].entity.process_id(), 4242);
    }

    #[test]
    fn test_samples_split_across_datagrams() {
        let samples: Vec<_> = (0..20).map(|_| topic_with_all_layers()).collect();
        let one = encode_sample(&samples[0]).expect("encode").len();
        let max = DATAGRAM_HEADER_SIZE + 3 * (one + 4);

        let datagrams = encode_datagrams(&samples, max).expect("encode");
        assert_eq!(datagrams.len(), 7);
        assert!(datagrams.iter().all(|d| d.len() <= max));

        let total: usize = datagrams
            .iter()
            .map(|d| decode_datagram(d).expect("decode").len())
            .sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_empty_input_yields_no_datagram() {
        assert!(encode_datagrams(&[], 1500).expect("encode").is_empty());
    }

    #[test]
    fn test_bad_magic_and_version() {
        assert_eq!(
            decode_datagram(b"XCAL\x01\x00\x00\x00\x00"),
            Err(CodecError::BadMagic)
        );
        assert_eq!(
            decode_datagram(b"HCAL\x09\x00\x00\x00\x00"),
            Err(CodecError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_truncated_datagram() {
        let datagrams = encode_datagrams(&[server_sample()], 1500).expect("encode");
        let cut = &datagrams[0][..datagrams[0].len() - 3];
        assert!(matches!(
            decode_datagram(cut),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_layer_is_skipped() {
        let mut sample = topic_with_all_layers();
        if let SampleBody::Topic(t) = &mut sample.body {
            t.layers.truncate(1);
        }
        let mut bare = sample.clone();
        if let SampleBody::Topic(t) = &mut bare.body {
            t.layers.clear();
        }
        // layer count sits just before the 24 statistics bytes of the bare encoding
        let count_pos = encode_sample(&bare).expect("encode").len() - 24 - 1;

        let mut bytes = encode_sample(&sample).expect("encode");
        assert_eq!(bytes[count_pos], 1);
        assert_eq!(bytes[count_pos + 1], LayerKind::Shm.wire_code());
        bytes[count_pos + 1] = 0x7F;

        let decoded = decode_sample(&bytes).expect("decode");
        assert!(decoded.topic().expect("topic").layers.is_empty());
    }
}
