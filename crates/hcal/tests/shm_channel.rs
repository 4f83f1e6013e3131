// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::cast_possible_truncation)] // Test data conversions

//! Shared memory channel integration tests
//!
//! Several channel handles on one (domain, topic), as separate processes
//! would hold them: round trip, and no interleaving of concurrent writers
//! on a single buffer with in-place updates.

use hcal::transport::shm::{ChannelOptions, ChannelReader, ChannelWriter, PayloadWriter, WriteParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PAYLOAD: usize = 4096;

fn options() -> ChannelOptions {
    ChannelOptions {
        domain: format!("it{:08x}", fastrand::u32(..)),
        buffer_count: 1,
        min_size: PAYLOAD,
        ..ChannelOptions::default()
    }
}

/// Fills the whole buffer with one byte, both fully and in place.
struct Uniform(u8);

impl PayloadWriter for Uniform {
    fn get_size(&self) -> usize {
        PAYLOAD
    }

    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        buf.fill(self.0);
        true
    }

    fn write_modified(&mut self, buf: &mut [u8]) -> bool {
        // Byte by byte so a racing reader would see a mix.
        for b in buf.iter_mut() {
            *b = self.0;
        }
        true
    }
}

#[test]
fn test_round_trip_across_handles() {
    let opts = options();
    let mut writer = ChannelWriter::open("roundtrip", opts.clone()).expect("writer");
    let mut reader = ChannelReader::open(&opts.domain, "roundtrip").expect("reader");
    assert_eq!(writer.reader_count(), 1);

    let params = WriteParams {
        writer_id: 11,
        ..WriteParams::default()
    };
    let report = writer.write_bytes(b"across handles", params).expect("write");
    assert!(reader.wait(Duration::from_secs(1)));
    let sample = reader.try_read().expect("sample");
    assert_eq!(sample.data, b"across handles");
    assert_eq!(sample.info.writer_id, 11);
    assert_eq!(sample.info.clock, report.clock);

    // Zero-copy read lends the mapped bytes.
    writer.write_bytes(&[7u8; 32], params).expect("write");
    let sum = reader
        .read_with(|data, info| {
            assert_eq!(info.writer_id, 11);
            data.iter().map(|b| u32::from(*b)).sum::<u32>()
        })
        .expect("sample");
    assert_eq!(sum, 7 * 32);
}

#[test]
fn test_concurrent_writers_never_interleave() {
    let opts = options();
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (1..=2u8)
        .map(|id| {
            let opts = opts.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut writer = ChannelWriter::open("interleave", opts).expect("writer");
                let params = WriteParams {
                    writer_id: u64::from(id),
                    zero_copy: true,
                    acknowledge_timeout: None,
                    timestamp: 0,
                };
                let mut written = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let value = id.wrapping_mul(50).wrapping_add((written % 50) as u8);
                    writer.write(&mut Uniform(value), params).expect("write");
                    written += 1;
                }
                written
            })
        })
        .collect();

    let mut reader = ChannelReader::new(&opts.domain, "interleave");
    let deadline = Instant::now() + Duration::from_millis(500);
    let mut checked = 0u32;
    while Instant::now() < deadline {
        if !reader.wait(Duration::from_millis(20)) {
            continue;
        }
        if let Some(sample) = reader.try_read() {
            let first = sample.data[0];
            assert_eq!(sample.data.len(), PAYLOAD);
            assert!(
                sample.data.iter().all(|b| *b == first),
                "mixed payload at clock {}",
                sample.info.clock
            );
            // The value identifies its writer.
            assert_eq!(u64::from(first / 50), sample.info.writer_id);
            checked += 1;
        }
    }
    stop.store(true, Ordering::Relaxed);
    for handle in writers {
        assert!(handle.join().expect("writer thread") > 0);
    }
    assert!(checked > 0, "reader never saw a sample");
    // Torn reads are detected and dropped, never returned.
    println!("checked {} samples, metrics {:?}", checked, reader.metrics().snapshot());
}
