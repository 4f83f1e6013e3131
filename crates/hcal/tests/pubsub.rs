// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::cast_possible_truncation)] // Test data conversions

//! Publisher/subscriber integration tests
//!
//! Two contexts on one host connected through an in-process registration
//! bus: shared memory delivery, receive callbacks, layer fallback, link
//! recovery.

use hcal::config::LayerToggles;
use hcal::registration::{Command, SampleBody, TopicInfo, TopicStatistics};
use hcal::transport::tcp::{self, TcpLayerWriter};
use hcal::transport::{LayerWriter, OutgoingSample};
use hcal::{
    BytesPayload, Config, Context, DataTypeInformation, EntityId, InProcessBus, LayerEvent,
    LayerKind, Publisher, RegistrationSample, Subscriber, TopicDirection,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn config(domain: &str) -> Config {
    let mut config = Config::in_process()
        .with_registration_timing(Duration::from_millis(50), Duration::from_millis(500))
        .with_shm_domain(domain);
    // Lossless delivery: every send waits for the reader.
    config.publisher.acknowledge_timeout_ms = Some(1000);
    config
}

fn start(bus: &InProcessBus, config: Config) -> Context {
    Context::builder()
        .config(config)
        .registration_transport(Arc::new(bus.clone()))
        .start()
        .expect("context")
}

fn wait_connected(publisher: &Publisher, subscriber: &Subscriber, layer: LayerKind) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if publisher.layer_for(subscriber.id()) == Some(layer)
            && subscriber.layer_for(publisher.id()) == Some(layer)
        {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "no {} connection: publisher {:?}, subscriber {:?}",
            layer,
            publisher.layer_for(subscriber.id()),
            subscriber.layer_for(publisher.id())
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Send until the first sample gets through; readers attach lazily.
fn warm_up(publisher: &Publisher, delivered: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !delivered() {
        assert!(Instant::now() < deadline, "nothing delivered");
        publisher.send_bytes(WARM_UP).expect("send");
        std::thread::sleep(Duration::from_millis(10));
    }
}

const WARM_UP: &[u8] = b"warm-up";

#[test]
fn test_shm_round_trip_between_contexts() {
    let domain = format!("ps{:08x}", fastrand::u32(..));
    let bus = InProcessBus::new();
    let a = start(&bus, config(&domain));
    let b = start(&bus, config(&domain));

    let subscriber = b.create_subscriber("pose", Default::default()).expect("subscriber");
    let publisher = a.create_publisher("pose", Default::default()).expect("publisher");
    wait_connected(&publisher, &subscriber, LayerKind::Shm);
    assert_eq!(publisher.subscriber_count(), 1);
    let first = std::cell::Cell::new(false);
    warm_up(&publisher, || {
        first.get() || {
            first.set(subscriber.receive(Duration::from_millis(1)).is_some());
            first.get()
        }
    });

    for i in 0..20u32 {
        let payload = format!("sample-{i}");
        assert_eq!(publisher.send_bytes(payload.as_bytes()).expect("send"), payload.len());
    }
    let mut received = Vec::new();
    while received.len() < 20 {
        let sample = subscriber
            .receive(Duration::from_secs(2))
            .expect("sample within deadline");
        assert_eq!(sample.sender_id, publisher.id().id());
        assert_eq!(sample.layer, LayerKind::Shm);
        if sample.payload == WARM_UP {
            continue;
        }
        received.push(String::from_utf8(sample.payload).expect("utf8"));
    }
    let expected: Vec<String> = (0..20).map(|i| format!("sample-{i}")).collect();
    assert_eq!(received, expected);

    let stats = publisher.statistics();
    assert!(stats.data_clock >= 21);
    assert_eq!(stats.connections_local, 1);
}

#[test]
fn test_receive_callback_runs_instead_of_queue() {
    let domain = format!("cb{:08x}", fastrand::u32(..));
    let bus = InProcessBus::new();
    let a = start(&bus, config(&domain));
    let b = start(&bus, config(&domain));

    let subscriber = b.create_subscriber("callback", Default::default()).expect("subscriber");
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    subscriber.set_receive_callback(move |sample| {
        sink.lock().expect("lock").push(sample.payload.clone());
    });
    let publisher = a.create_publisher("callback", Default::default()).expect("publisher");
    wait_connected(&publisher, &subscriber, LayerKind::Shm);
    warm_up(&publisher, || !got.lock().expect("lock").is_empty());
    got.lock().expect("lock").retain(|p| p != WARM_UP);

    publisher.send_bytes(b"one").expect("send");
    publisher.send_bytes(b"two").expect("send");
    let deadline = Instant::now() + Duration::from_secs(2);
    while !got.lock().expect("lock").iter().any(|p| p == b"two") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let got: Vec<Vec<u8>> = got
        .lock()
        .expect("lock")
        .iter()
        .filter(|p| p.as_slice() != WARM_UP)
        .cloned()
        .collect();
    assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    assert!(subscriber.try_receive().is_none());
}

#[test]
fn test_disconnect_when_publisher_leaves() {
    let domain = format!("dc{:08x}", fastrand::u32(..));
    let bus = InProcessBus::new();
    let a = start(&bus, config(&domain));
    let b = start(&bus, config(&domain));

    let subscriber = b.create_subscriber("leaving", Default::default()).expect("subscriber");
    let publisher = a.create_publisher("leaving", Default::default()).expect("publisher");
    wait_connected(&publisher, &subscriber, LayerKind::Shm);
    let publisher_id = publisher.id().clone();
    drop(publisher);

    let deadline = Instant::now() + Duration::from_secs(2);
    while subscriber.publisher_count() > 0 {
        assert!(Instant::now() < deadline, "publisher never released");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(subscriber.layer_for(&publisher_id), None);
}

#[test]
fn test_falls_back_to_tcp_when_shm_cannot_open() {
    // Channel names built from this domain exceed the platform name limit.
    let mut config = config(&"d".repeat(300));
    config.publisher.layers = LayerToggles {
        shm: true,
        udp: false,
        tcp: true,
    };
    config.publisher.acknowledge_timeout_ms = None;
    let ctx = Context::builder().config(config).start().expect("context");

    let publisher = ctx.create_publisher("fallback", Default::default()).expect("publisher");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    publisher.set_event_callback(move |event| sink.lock().expect("lock").push(event.clone()));
    let subscriber = ctx.create_subscriber("fallback", Default::default()).expect("subscriber");
    wait_connected(&publisher, &subscriber, LayerKind::Tcp);

    let shm = publisher
        .announced_layers()
        .into_iter()
        .find(|l| l.kind() == LayerKind::Shm)
        .expect("shm announced");
    assert!(!shm.available);

    // The TCP connection may still be completing its handshake.
    let deadline = Instant::now() + Duration::from_secs(3);
    let sample = loop {
        publisher.send_bytes(b"over tcp").expect("send");
        if let Some(sample) = subscriber.receive(Duration::from_millis(100)) {
            break sample;
        }
        assert!(Instant::now() < deadline, "nothing arrived over tcp");
    };
    assert_eq!(sample.layer, LayerKind::Tcp);
    assert_eq!(sample.payload, b"over tcp");

    let deadline = Instant::now() + Duration::from_secs(1);
    while events.lock().expect("lock").is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let events = events.lock().expect("lock");
    assert!(
        events.iter().any(|e| matches!(
            e,
            LayerEvent::Selected { layer: LayerKind::Tcp, .. }
                | LayerEvent::Downgraded { from: LayerKind::Shm, .. }
        )),
        "events: {:?}",
        events
    );
}

#[test]
fn test_send_time_reaches_subscriber() {
    let domain = format!("ts{:08x}", fastrand::u32(..));
    let bus = InProcessBus::new();
    let a = start(&bus, config(&domain));
    let b = start(&bus, config(&domain));

    let subscriber = b.create_subscriber("stamped", Default::default()).expect("subscriber");
    let publisher = a.create_publisher("stamped", Default::default()).expect("publisher");
    wait_connected(&publisher, &subscriber, LayerKind::Shm);
    let first = std::cell::Cell::new(false);
    warm_up(&publisher, || {
        first.get() || {
            first.set(subscriber.receive(Duration::from_millis(1)).is_some());
            first.get()
        }
    });

    publisher
        .send_bytes_with_time(b"stamped", Some(1_700_000_000_000_000))
        .expect("send");
    let sample = loop {
        let sample = subscriber.receive(Duration::from_secs(2)).expect("sample");
        if sample.payload != WARM_UP {
            break sample;
        }
    };
    assert_eq!(sample.payload, b"stamped");
    assert_eq!(sample.timestamp, 1_700_000_000_000_000);

    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_micros() as i64;
    publisher.send_bytes(b"now").expect("send");
    let sample = subscriber.receive(Duration::from_secs(2)).expect("sample");
    assert!(sample.timestamp >= before);
}

#[test]
fn test_falls_back_to_udp_when_shm_cannot_open() {
    let mut config = config(&"u".repeat(300));
    config.transport.network_enabled = true;
    config.transport.udp.payload_port = 20_000 + fastrand::u16(..20_000);
    config.publisher.layers = LayerToggles {
        shm: true,
        udp: true,
        tcp: false,
    };
    config.subscriber.layers = config.publisher.layers;
    config.publisher.acknowledge_timeout_ms = None;
    let ctx = Context::builder().config(config).start().expect("context");

    let publisher = ctx.create_publisher("udp-fallback", Default::default()).expect("publisher");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    publisher.set_event_callback(move |event| sink.lock().expect("lock").push(event.clone()));
    let subscriber = ctx
        .create_subscriber("udp-fallback", Default::default())
        .expect("subscriber");
    wait_connected(&publisher, &subscriber, LayerKind::Udp);

    let deadline = Instant::now() + Duration::from_secs(1);
    while events.lock().expect("lock").is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let events = events.lock().expect("lock");
    assert!(
        events.iter().any(|e| matches!(
            e,
            LayerEvent::Selected { layer: LayerKind::Udp, .. }
                | LayerEvent::Downgraded { from: LayerKind::Shm, .. }
        )),
        "events: {:?}",
        events
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, LayerEvent::Selected { layer: LayerKind::Shm, .. })));
}

// ----------------------------------------------------------------------------
// Link recovery, against a publisher registration driven by the test
// ----------------------------------------------------------------------------

fn tcp_only(config: Config) -> Config {
    // Registrations fed by hand are not refreshed on their own.
    let mut config = config.with_registration_timing(Duration::from_millis(50), Duration::from_secs(30));
    config.subscriber.layers = LayerToggles {
        shm: false,
        udp: false,
        tcp: true,
    };
    config.transport.layer_retry_interval = Duration::from_millis(100);
    config
}

fn remote_publisher(entity: &EntityId, topic: &str, port: u16, clock: u64) -> RegistrationSample {
    RegistrationSample {
        command: Command::Register,
        clock,
        entity: entity.clone(),
        body: SampleBody::Topic(TopicInfo {
            direction: TopicDirection::Publisher,
            topic_name: topic.to_string(),
            data_type: DataTypeInformation::default(),
            layers: vec![tcp::announcement(port)],
            stats: TopicStatistics::default(),
        }),
    }
}

/// Write through `writer` until `subscriber` has the sample.
fn send_until_received(
    writer: &mut TcpLayerWriter,
    subscriber: &Subscriber,
    sender: &EntityId,
    clock: &mut u64,
    payload: &[u8],
) -> hcal::Received {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        *clock += 1;
        let sample = OutgoingSample {
            sender_id: sender.id(),
            clock: *clock,
            timestamp: 1_000 + *clock as i64,
            topic: "relink",
        };
        writer
            .write(&sample, &mut BytesPayload(payload))
            .expect("write");
        if let Some(received) = subscriber.receive(Duration::from_millis(50)) {
            return received;
        }
        assert!(Instant::now() < deadline, "nothing arrived over tcp");
    }
}

fn wait_for_link(subscriber: &Subscriber, publisher: &EntityId, writer: &TcpLayerWriter) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while subscriber.layer_for(publisher) != Some(LayerKind::Tcp) || writer.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "no tcp link");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_tcp_link_reconnects_after_publisher_restart() {
    let config = tcp_only(config("relink"));
    let tcp_config = config.transport.tcp.clone();
    let ctx = Context::builder().config(config).start().expect("context");
    let subscriber = ctx.create_subscriber("relink", Default::default()).expect("subscriber");

    let mut writer = TcpLayerWriter::open("relink", &tcp_config, 0).expect("listener");
    let port = writer.port();
    let publisher = EntityId::new(0x5EED_0001, 4242, ctx.host_name());
    let mut registration_clock = 1;
    ctx.directory()
        .apply(remote_publisher(&publisher, "relink", port, registration_clock))
        .expect("added");
    wait_for_link(&subscriber, &publisher, &writer);

    let mut clock = 0;
    let first = send_until_received(&mut writer, &subscriber, &publisher, &mut clock, b"before");
    assert_eq!(first.payload, b"before");
    assert_eq!(first.timestamp, 1_000 + first.clock as i64);

    // The subscriber notices the closed link and releases the layer.
    drop(writer);
    let deadline = Instant::now() + Duration::from_secs(3);
    while subscriber.layer_for(&publisher).is_some() {
        assert!(Instant::now() < deadline, "lost link not released");
        std::thread::sleep(Duration::from_millis(10));
    }

    // Registration refreshes retry the layer once the failure has expired.
    let mut writer = TcpLayerWriter::open("relink", &tcp_config, port).expect("listener");
    let deadline = Instant::now() + Duration::from_secs(5);
    while subscriber.layer_for(&publisher) != Some(LayerKind::Tcp) || writer.subscriber_count() == 0 {
        assert!(Instant::now() < deadline, "no reconnect");
        registration_clock += 1;
        let _ = ctx
            .directory()
            .apply(remote_publisher(&publisher, "relink", port, registration_clock));
        std::thread::sleep(Duration::from_millis(50));
    }

    let again = send_until_received(&mut writer, &subscriber, &publisher, &mut clock, b"after");
    assert_eq!(again.payload, b"after");
    assert_eq!(again.layer, LayerKind::Tcp);
}

#[test]
fn test_healthy_publisher_connects_after_unreachable_one() {
    let mut config = tcp_only(config("mixedpeers"));
    config.transport.network_enabled = true;
    let tcp_config = config.transport.tcp.clone();
    let ctx = Context::builder().config(config).start().expect("context");
    let subscriber = ctx.create_subscriber("relink", Default::default()).expect("subscriber");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    subscriber.set_event_callback(move |event| sink.lock().expect("lock").push(event.clone()));

    let unreachable = EntityId::new(0x5EED_0002, 4243, "no-such-host.invalid");
    ctx.directory()
        .apply(remote_publisher(&unreachable, "relink", 9, 1))
        .expect("added");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !events
        .lock()
        .expect("lock")
        .iter()
        .any(|e| matches!(e, LayerEvent::Downgraded { from: LayerKind::Tcp, .. }))
    {
        assert!(Instant::now() < deadline, "unreachable publisher never failed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(subscriber.layer_for(&unreachable), None);

    // The failure belongs to that publisher; tcp stays announced and usable.
    let tcp_layer = subscriber
        .announced_layers()
        .into_iter()
        .find(|l| l.kind() == LayerKind::Tcp)
        .expect("tcp announced");
    assert!(tcp_layer.available);

    let mut writer = TcpLayerWriter::open("relink", &tcp_config, 0).expect("listener");
    let healthy = EntityId::new(0x5EED_0003, 4244, ctx.host_name());
    ctx.directory()
        .apply(remote_publisher(&healthy, "relink", writer.port(), 1))
        .expect("added");
    wait_for_link(&subscriber, &healthy, &writer);

    let mut clock = 0;
    let received = send_until_received(&mut writer, &subscriber, &healthy, &mut clock, b"healthy");
    assert_eq!(received.payload, b"healthy");
    assert_eq!(received.sender_id, healthy.id());
    assert_eq!(subscriber.layer_for(&unreachable), None);
}
