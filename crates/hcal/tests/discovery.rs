// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Discovery integration tests
//!
//! Contexts sharing one in-process registration bus: convergence, expiry of
//! silent entities, topic filters and registration callbacks.

use hcal::entity::TransportLayer;
use hcal::registration::{Command, SampleBody, TopicInfo, TopicStatistics};
use hcal::{
    Config, Context, DataTypeInformation, EntityId, EntityKind, InProcessBus, RegistrationSample,
    TopicDirection, TopicFilter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REFRESH: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_millis(300);

fn config() -> Config {
    Config::in_process()
        .with_registration_timing(REFRESH, TIMEOUT)
        .with_shm_domain(format!("disc{:08x}", fastrand::u32(..)))
}

fn start(bus: &InProcessBus, config: Config) -> Context {
    Context::builder()
        .config(config)
        .registration_transport(Arc::new(bus.clone()))
        .start()
        .expect("context")
}

fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_peers_converge_within_two_refresh_periods() {
    let bus = InProcessBus::new();
    let a = start(&bus, config());
    let b = start(&bus, config());
    let publisher = a
        .create_publisher("converge", DataTypeInformation::new("Pose", "raw"))
        .expect("publisher");

    let started = Instant::now();
    // Scheduling slack on loaded test machines on top of the 2 x refresh bound.
    assert!(wait_until(REFRESH * 2 + Duration::from_millis(200), || {
        b.directory().get(publisher.id().id()).is_some()
    }));
    println!("converged after {:?}", started.elapsed());

    let sample = b.directory().get(publisher.id().id()).expect("entry");
    let info = sample.topic().expect("topic");
    assert_eq!(info.topic_name, "converge");
    assert_eq!(info.data_type.name, "Pose");
    assert!(b.directory().get(a.process_id().id()).is_some());
}

#[test]
fn test_dropped_entity_is_removed_immediately() {
    let bus = InProcessBus::new();
    let a = start(&bus, config());
    let b = start(&bus, config());
    let server = a.create_service_server("ephemeral").expect("server");
    let id = server.id().id();
    assert!(wait_until(Duration::from_secs(1), || b.directory().get(id).is_some()));

    drop(server);
    // The leaving sample beats the timeout by far.
    assert!(wait_until(TIMEOUT / 2, || b.directory().get(id).is_none()));
}

#[test]
fn test_silent_entity_expires_after_timeout() {
    let ctx = Context::builder()
        .config(config())
        .start()
        .expect("context");
    let ghost = RegistrationSample {
        command: Command::Register,
        clock: 1,
        entity: EntityId::new(0xDEAD_0000_0001, 4242, "elsewhere"),
        body: SampleBody::Topic(TopicInfo {
            direction: TopicDirection::Publisher,
            topic_name: "ghost".into(),
            data_type: DataTypeInformation::default(),
            layers: Vec::<TransportLayer>::new(),
            stats: TopicStatistics::default(),
        }),
    };
    let applied_at = Instant::now();
    ctx.directory().apply(ghost);
    assert!(ctx.directory().get(0xDEAD_0000_0001).is_some());

    // Kept at least until the timeout, gone within timeout + one sweep.
    std::thread::sleep(TIMEOUT.saturating_sub(applied_at.elapsed() + Duration::from_millis(50)));
    assert!(ctx.directory().get(0xDEAD_0000_0001).is_some());
    assert!(wait_until(REFRESH * 4, || ctx
        .directory()
        .get(0xDEAD_0000_0001)
        .is_none()));
    assert!(ctx.directory().metrics().expired >= 1);
}

#[test]
fn test_filter_precedence() {
    let filter = TopicFilter::new("", "^__.*$").expect("filter");
    let accepted: Vec<bool> = ["topic_1", "topic_2", "apple", "__internal"]
        .iter()
        .map(|t| filter.accepts(t))
        .collect();
    assert_eq!(accepted, vec![true, true, true, false]);

    // Exclude wins over include.
    let filter = TopicFilter::new("^topic_.*$", "^topic_2$").expect("filter");
    assert!(filter.accepts("topic_1"));
    assert!(!filter.accepts("topic_2"));
    assert!(!filter.accepts("apple"));
}

#[test]
fn test_filtered_remote_topics_stay_out_of_directory() {
    let bus = InProcessBus::new();
    let observer = start(&bus, config().with_filter("", "^__.*$"));
    let remote = start(&bus, config());

    let names = ["topic_1", "topic_2", "apple", "__internal"];
    let publishers: Vec<_> = names
        .iter()
        .map(|name| remote.create_publisher(name, Default::default()).expect("publisher"))
        .collect();

    assert!(wait_until(Duration::from_secs(1), || {
        publishers[..3]
            .iter()
            .all(|p| observer.directory().get(p.id().id()).is_some())
    }));
    // Give the filtered one a few more refresh periods to (not) show up.
    std::thread::sleep(REFRESH * 3);
    assert!(observer.directory().get(publishers[3].id().id()).is_none());
    assert!(observer.directory().metrics().filtered > 0);
    assert!(remote.directory().get(publishers[3].id().id()).is_some());
}

#[test]
fn test_registration_callback_by_kind() {
    let bus = InProcessBus::new();
    let a = start(&bus, config());
    let b = start(&bus, config());
    let servers = Arc::new(AtomicUsize::new(0));
    let publishers = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&servers);
    let server_cb = b.add_registration_callback(EntityKind::Server, move |sample| {
        assert_eq!(sample.kind(), EntityKind::Server);
        s.fetch_add(1, Ordering::Relaxed);
    });
    let p = Arc::clone(&publishers);
    b.add_registration_callback(EntityKind::Publisher, move |_| {
        p.fetch_add(1, Ordering::Relaxed);
    });

    let _server = a.create_service_server("watched").expect("server");
    assert!(wait_until(Duration::from_secs(1), || servers.load(Ordering::Relaxed) > 0));
    assert_eq!(publishers.load(Ordering::Relaxed), 0);

    b.remove_registration_callback(server_cb);
    let seen = servers.load(Ordering::Relaxed);
    std::thread::sleep(REFRESH * 3);
    assert_eq!(servers.load(Ordering::Relaxed), seen);
}

#[test]
fn test_shutdown_removes_process_from_peers() {
    let bus = InProcessBus::new();
    let a = start(&bus, config());
    let b = start(&bus, config());
    let process = a.process_id().clone();
    assert!(wait_until(Duration::from_secs(1), || b
        .directory()
        .get(process.id())
        .is_some()));
    a.shutdown();
    assert!(wait_until(TIMEOUT / 2, || b.directory().get(process.id()).is_none()));
}
