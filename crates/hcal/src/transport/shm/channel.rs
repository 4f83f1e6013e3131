// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel writer and reader.
//!
//! # Write path
//!
//! 1. Take the named writer lock
//! 2. Make sure the data object holds `get_size()` bytes (replace it with a
//!    bigger generation otherwise)
//! 3. Mark the slot for `clock` as being written (odd sequence)
//! 4. `write_modified` if the slot still holds this writer's previous
//!    payload of the same size and zero-copy is on, `write_full` otherwise
//! 5. Commit the slot, publish `write_clock`, wake readers
//! 6. Optionally wait for every attached reader to acknowledge `clock`
//!
//! # Read path
//!
//! Readers track the next clock they expect. A slot is read only if its
//! committed sequence matches that clock, and the sequence is checked again
//! after the payload was consumed. A mismatch means the writer reused the
//! slot mid-read: the read is counted as torn and discarded.

use super::futex::{futex_wait, futex_wake_all, WaitOutcome};
use super::layout::{
    align_capacity, control_size, data_size, slot_index, ChannelHeader, ControlView,
    DataHeader, DataView,
};
use super::lock::NamedLock;
use super::metrics::ShmMetrics;
use super::payload::{BytesPayload, PayloadWriter};
use super::segment::{Opened, ShmSegment};
use super::{channel_name, data_name, lock_name, process_alive, Result, ShmError};
use crate::config::{
    PublisherConfig, ShmConfig, MEMFILE_BUFFER_COUNT, MEMFILE_LOCK_TIMEOUT_MS,
    MEMFILE_MIN_SIZE_BYTES, MEMFILE_RESERVE_PERCENT, SHM_DOMAIN,
};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Options
// ============================================================================

/// Channel-wide settings, fixed by the first writer that creates it.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub domain: String,
    pub buffer_count: u32,
    pub min_size: usize,
    pub reserve_percent: u32,
    pub lock_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            domain: SHM_DOMAIN.to_string(),
            buffer_count: MEMFILE_BUFFER_COUNT,
            min_size: MEMFILE_MIN_SIZE_BYTES,
            reserve_percent: MEMFILE_RESERVE_PERCENT,
            lock_timeout: Duration::from_millis(MEMFILE_LOCK_TIMEOUT_MS),
        }
    }
}

impl ChannelOptions {
    #[must_use]
    pub fn from_config(publisher: &PublisherConfig, shm: &ShmConfig) -> Self {
        Self {
            domain: shm.domain.clone(),
            buffer_count: publisher.memfile_buffer_count.max(1),
            min_size: publisher.memfile_min_size_bytes,
            reserve_percent: publisher.memfile_reserve_percent,
            lock_timeout: shm.lock_timeout,
        }
    }
}

/// Per-send settings of one publisher.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteParams {
    /// Entity id of the publishing writer
    pub writer_id: u64,
    /// Allow `write_modified` on the previous payload
    pub zero_copy: bool,
    /// Wait for reader acknowledgement (`None` or zero = no handshake)
    pub acknowledge_timeout: Option<Duration>,
    /// Send time stamped into the slot (microseconds since the Unix epoch)
    pub timestamp: i64,
}

impl WriteParams {
    #[must_use]
    pub fn from_config(writer_id: u64, publisher: &PublisherConfig) -> Self {
        Self {
            writer_id,
            zero_copy: publisher.zero_copy,
            acknowledge_timeout: publisher
                .acknowledge_timeout_ms
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(u64::from(ms))),
            timestamp: 0,
        }
    }
}

/// How a payload reached the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Full,
    Modified,
}

/// Outcome of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub clock: u64,
    pub bytes: usize,
    pub mode: WriteMode,
    /// A new data object was created for this write
    pub resized: bool,
    /// Some reader did not acknowledge in time
    pub ack_timed_out: bool,
}

// ============================================================================
// Data object mapping
// ============================================================================

struct DataMapping {
    generation: u64,
    segment: ShmSegment,
    buffer_count: usize,
    capacity: usize,
}

impl DataMapping {
    fn open(channel: &str, generation: u64) -> Result<Self> {
        let segment = ShmSegment::open(&data_name(channel, generation))?;
        // SAFETY: the object is at least one DataHeader long once sized
        let header = unsafe { &*segment.as_ptr().cast::<DataHeader>() };
        if !header.is_valid() || header.generation != generation {
            return Err(ShmError::Corruption);
        }
        let buffer_count = header.buffer_count as usize;
        let capacity = header.slot_capacity as usize;
        if buffer_count == 0 || segment.size() < data_size(buffer_count, capacity) {
            return Err(ShmError::Corruption);
        }
        Ok(Self {
            generation,
            segment,
            buffer_count,
            capacity,
        })
    }

    fn create(channel: &str, generation: u64, buffer_count: usize, capacity: usize) -> Result<Self> {
        let segment = ShmSegment::create_replacing(
            &data_name(channel, generation),
            data_size(buffer_count, capacity),
        )?;
        // SAFETY: freshly created, zeroed, sized for buffer_count slots and not
        // yet published through the control generation
        unsafe { DataHeader::init(segment.as_ptr(), generation, buffer_count as u32, capacity) };
        Ok(Self {
            generation,
            segment,
            buffer_count,
            capacity,
        })
    }

    fn view(&self) -> DataView {
        // SAFETY: the segment outlives every use of the view (both live in self)
        unsafe { DataView::new(self.segment.as_ptr(), self.buffer_count, self.capacity) }
    }
}

fn control_view(segment: &ShmSegment) -> ControlView {
    // SAFETY: control segments are validated to be control_size() bytes
    unsafe { ControlView::new(segment.as_ptr()) }
}

// ============================================================================
// Writer
// ============================================================================

/// Writing side of a channel. One per (topic, domain) per process; see
/// [`ChannelArena`](super::ChannelArena) for sharing.
pub struct ChannelWriter {
    topic: String,
    name: String,
    options: ChannelOptions,
    buffer_count: usize,
    control: ShmSegment,
    lock: Arc<NamedLock>,
    data: Option<DataMapping>,
    metrics: Arc<ShmMetrics>,
}

impl ChannelWriter {
    /// Open the channel for `topic`, creating it if needed.
    pub fn open(topic: &str, options: ChannelOptions) -> Result<Self> {
        let name = channel_name(&options.domain, topic);
        let lock = NamedLock::open(&lock_name(&name))?;
        let control = {
            let _guard = lock.lock(options.lock_timeout)?;
            let control = Self::open_control(&name, options.buffer_count)?;
            control_view(&control)
                .header()
                .writers
                .fetch_add(1, Ordering::AcqRel);
            control
        };

        let buffer_count = control_view(&control).header().buffer_count as usize;
        if buffer_count != options.buffer_count as usize {
            log::debug!(
                "[SHM] {} uses buffer_count={} set by its creator (requested {})",
                topic,
                buffer_count,
                options.buffer_count
            );
        }
        log::debug!("[SHM] writer attached to {} ({})", name, topic);

        Ok(Self {
            topic: topic.to_string(),
            name,
            options,
            buffer_count,
            control,
            lock: Arc::new(lock),
            data: None,
            metrics: Arc::new(ShmMetrics::new()),
        })
    }

    /// Caller holds the writer lock.
    fn open_control(name: &str, buffer_count: u32) -> Result<ShmSegment> {
        let segment = match ShmSegment::open_or_create(name, control_size()) {
            Ok(Opened::Created(segment)) => {
                // SAFETY: new zeroed object, serialized by the writer lock
                unsafe { ChannelHeader::init(segment.as_ptr(), buffer_count.max(1)) };
                return Ok(segment);
            }
            Ok(Opened::Existing(segment)) => Some(segment),
            Err(ShmError::SizeMismatch { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(segment) = segment {
            let view = control_view(&segment);
            let header = view.header();
            if header.is_valid() && header.closed.load(Ordering::Acquire) == 0 {
                return Ok(segment);
            }
        }

        // Leftover from a closed or crashed channel
        log::debug!("[SHM] replacing stale channel {}", name);
        let segment = ShmSegment::create_replacing(name, control_size())?;
        // SAFETY: as above
        unsafe { ChannelHeader::init(segment.as_ptr(), buffer_count.max(1)) };
        Ok(segment)
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, data: &[u8], params: WriteParams) -> Result<WriteReport> {
        self.write(&mut BytesPayload(data), params)
    }

    /// Write a payload through its [`PayloadWriter`].
    pub fn write(
        &mut self,
        payload: &mut dyn PayloadWriter,
        params: WriteParams,
    ) -> Result<WriteReport> {
        crate::trace_fn!("ChannelWriter::write");
        let size = payload.get_size();
        let control = control_view(&self.control);
        let header = control.header();

        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock(self.options.lock_timeout)?;

        let resized = self.ensure_capacity(header, size)?;
        let data = self.data.as_ref().ok_or(ShmError::Corruption)?.view();

        let clock = header.write_clock.load(Ordering::Acquire) + 1;
        let index = slot_index(clock, data.buffer_count());
        let slot = data.slot(index);

        let previous_seq = slot.load_seq();
        let in_place = params.zero_copy
            && data.buffer_count() == 1
            && !resized
            && previous_seq != 0
            && previous_seq & 1 == 0
            && slot.writer_id.load(Ordering::Relaxed) == params.writer_id
            && slot.len.load(Ordering::Relaxed) as usize == size;

        slot.mark_writing(clock);
        // SAFETY: payload_ptr has slot_capacity >= size bytes (ensure_capacity);
        // the writer lock makes this the only writer of the slot
        let buf = unsafe { std::slice::from_raw_parts_mut(data.payload_ptr(index), size) };
        let ok = if in_place {
            payload.write_modified(buf)
        } else {
            payload.write_full(buf)
        };
        if !ok {
            // Content is unknown now; force a full write next time.
            slot.writer_id.store(0, Ordering::Relaxed);
            slot.seq.store(previous_seq, Ordering::Release);
            return Err(ShmError::WriteAborted);
        }

        slot.len.store(size as u64, Ordering::Relaxed);
        slot.writer_id.store(params.writer_id, Ordering::Relaxed);
        slot.timestamp.store(params.timestamp, Ordering::Relaxed);
        slot.commit(clock);
        header.write_clock.store(clock, Ordering::Release);
        header.notify.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.notify);

        ShmMetrics::inc(&self.metrics.writes);
        let mode = if in_place {
            ShmMetrics::inc(&self.metrics.modified_writes);
            WriteMode::Modified
        } else {
            ShmMetrics::inc(&self.metrics.full_writes);
            WriteMode::Full
        };

        let ack_timed_out = match params.acknowledge_timeout {
            Some(timeout) if !timeout.is_zero() => !self.wait_for_acks(&control, clock, timeout),
            _ => false,
        };

        Ok(WriteReport {
            clock,
            bytes: size,
            mode,
            resized,
            ack_timed_out,
        })
    }

    /// Caller holds the writer lock. Returns true if a new data object was
    /// created.
    fn ensure_capacity(&mut self, header: &ChannelHeader, needed: usize) -> Result<bool> {
        let generation = header.generation.load(Ordering::Acquire);
        let stale = self.data.as_ref().map(|d| d.generation) != Some(generation);
        if generation != 0 && stale {
            match DataMapping::open(&self.name, generation) {
                Ok(mapping) => self.data = Some(mapping),
                Err(e) => {
                    log::warn!("[SHM] {} generation {} unusable: {}", self.name, generation, e);
                    self.data = None;
                }
            }
        }

        let current = self.data.as_ref().map_or(0, |d| d.capacity);
        if self.data.is_some() && current >= needed {
            return Ok(false);
        }

        let reserve = needed.saturating_mul(self.options.reserve_percent as usize) / 100;
        let capacity = align_capacity(
            self.options
                .min_size
                .max(needed.saturating_add(reserve))
                .max(current),
        );
        let next = generation + 1;
        let mapping = DataMapping::create(&self.name, next, self.buffer_count, capacity)?;
        header.generation.store(next, Ordering::Release);
        if generation != 0 {
            let _ = ShmSegment::unlink(&data_name(&self.name, generation));
            ShmMetrics::inc(&self.metrics.resizes);
        }
        log::debug!(
            "[SHM] {} data object generation {} with {} x {} bytes",
            self.topic,
            next,
            self.buffer_count,
            capacity
        );
        self.data = Some(mapping);
        Ok(true)
    }

    /// Wait until every attached reader acknowledged `clock`. False on
    /// timeout.
    fn wait_for_acks(&self, control: &ControlView, clock: u64, timeout: Duration) -> bool {
        let header = control.header();
        let deadline = Instant::now() + timeout;
        loop {
            let observed = header.ack_notify.load(Ordering::Acquire);
            let pending = control
                .readers()
                .filter(|r| r.pid.load(Ordering::Acquire) != 0)
                .any(|r| r.ack_clock.load(Ordering::Acquire) < clock);
            if !pending {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                ShmMetrics::inc(&self.metrics.ack_timeouts);
                let reclaimed = reclaim_dead_readers(control);
                log::debug!(
                    "[SHM] {} clock {} not acknowledged within {:?} ({} dead readers reclaimed)",
                    self.topic,
                    clock,
                    timeout,
                    reclaimed
                );
                return false;
            }
            futex_wait(&header.ack_notify, observed, Some(deadline - now));
        }
    }

    /// Readers currently attached to the channel.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        control_view(&self.control)
            .readers()
            .filter(|r| r.pid.load(Ordering::Acquire) != 0)
            .count()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ShmMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current data capacity per slot (0 before the first write).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.capacity)
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let control = control_view(&self.control);
        let header = control.header();
        let guard = self.lock.lock(self.options.lock_timeout);
        if header.writers.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        let guard = match guard {
            Ok(guard) => guard,
            Err(e) => {
                // Without the lock a new writer may be reopening the channel.
                log::warn!(
                    "[SHM] channel {} left in place, writer lock not acquired: {}",
                    self.name,
                    e
                );
                return;
            }
        };
        header.closed.store(1, Ordering::Release);
        header.notify.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.notify);

        let generation = header.generation.load(Ordering::Acquire);
        if generation != 0 {
            let _ = ShmSegment::unlink(&data_name(&self.name, generation));
        }
        let _ = ShmSegment::unlink(&self.name);
        self.lock.unlink();
        drop(guard);
        log::debug!("[SHM] channel {} ({}) closed", self.name, self.topic);
    }
}

/// Free reader slots whose owner process is gone.
fn reclaim_dead_readers(control: &ControlView) -> usize {
    let mut reclaimed = 0;
    for reader in control.readers() {
        let pid = reader.pid.load(Ordering::Acquire);
        if pid != 0
            && !process_alive(pid)
            && reader
                .pid
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            log::info!("[SHM] reclaimed reader slot of dead process {}", pid);
            reclaimed += 1;
        }
    }
    reclaimed
}

// ============================================================================
// Reader
// ============================================================================

static NEXT_READER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Metadata of a sample read from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub clock: u64,
    pub writer_id: u64,
    pub timestamp: i64,
}

/// Copied-out sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSample {
    pub info: SampleInfo,
    pub data: Vec<u8>,
}

struct Attached {
    control: ShmSegment,
    slot: Option<usize>,
    data: Option<DataMapping>,
}

/// Reading side of a channel.
///
/// Attaches lazily: a reader created before any writer sees no data until
/// the channel appears, and goes back to that state when the channel closes.
pub struct ChannelReader {
    topic: String,
    name: String,
    token: u64,
    attached: Option<Attached>,
    next_clock: u64,
    metrics: Arc<ShmMetrics>,
}

impl ChannelReader {
    #[must_use]
    pub fn new(domain: &str, topic: &str) -> Self {
        let mut reader = Self {
            topic: topic.to_string(),
            name: channel_name(domain, topic),
            token: NEXT_READER_TOKEN.fetch_add(1, Ordering::Relaxed),
            attached: None,
            next_clock: 1,
            metrics: Arc::new(ShmMetrics::new()),
        };
        reader.try_attach();
        reader
    }

    /// Like [`ChannelReader::new`], but rejects names the channel could
    /// never be created under.
    pub fn open(domain: &str, topic: &str) -> Result<Self> {
        let name = channel_name(domain, topic);
        ShmSegment::validate_name(&data_name(&name, u64::MAX))?;
        Ok(Self::new(domain, topic))
    }

    /// True while mapped to a live channel.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    fn try_attach(&mut self) -> bool {
        if self.attached.is_some() {
            return true;
        }
        let Ok(control) = ShmSegment::open(&self.name) else {
            return false;
        };
        if control.size() < control_size() {
            return false;
        }
        let view = control_view(&control);
        let header = view.header();
        if !header.is_valid() || header.closed.load(Ordering::Acquire) != 0 {
            return false;
        }

        // Latest committed sample is still delivered to a late joiner.
        let head = header.write_clock.load(Ordering::Acquire);
        self.next_clock = head.max(1);

        let pid = std::process::id();
        let mut claimed = None;
        for index in 0..crate::config::MEMFILE_MAX_READERS {
            let slot = view.reader(index);
            if slot
                .pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.token.store(self.token, Ordering::Relaxed);
                slot.ack_clock
                    .store(self.next_clock - 1, Ordering::Release);
                claimed = Some(index);
                break;
            }
        }
        if claimed.is_none() {
            log::warn!(
                "[SHM] {} has no free reader slot, reading without acknowledgement",
                self.topic
            );
        }

        log::debug!("[SHM] reader attached to {} ({})", self.name, self.topic);
        self.attached = Some(Attached {
            control,
            slot: claimed,
            data: None,
        });
        true
    }

    fn detach(&mut self) {
        if let Some(attached) = self.attached.take() {
            release_slot(&attached, self.token);
            log::debug!("[SHM] reader detached from {}", self.name);
        }
    }

    /// Block until a new sample may be available or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.try_attach() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            return self.try_attach() && self.has_data();
        }
        let Some(attached) = self.attached.as_ref() else {
            return false;
        };
        let view = control_view(&attached.control);
        let header = view.header();
        let observed = header.notify.load(Ordering::Acquire);
        if self.has_data() {
            return true;
        }
        if futex_wait(&header.notify, observed, Some(timeout)) == WaitOutcome::TimedOut {
            return false;
        }
        self.has_data()
    }

    /// True if a sample newer than the last one read was committed.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.attached.as_ref().is_some_and(|a| {
            control_view(&a.control)
                .header()
                .write_clock
                .load(Ordering::Acquire)
                >= self.next_clock
        })
    }

    /// Copy the next sample out of the channel.
    pub fn try_read(&mut self) -> Option<ShmSample> {
        self.read_with(|data, info| ShmSample {
            info,
            data: data.to_vec(),
        })
    }

    /// Lend the next sample's mapped bytes to `f`.
    ///
    /// Without an acknowledge handshake the writer may reuse the slot while
    /// `f` runs. Such reads are detected afterwards, counted as torn, and
    /// their result is discarded.
    pub fn read_with<R>(&mut self, f: impl FnOnce(&[u8], SampleInfo) -> R) -> Option<R> {
        crate::trace_fn!("ChannelReader::read_with");
        if !self.try_attach() {
            return None;
        }
        let mut f = Some(f);
        loop {
            let attached = self.attached.as_mut()?;
            let view = control_view(&attached.control);
            let header = view.header();
            if header.closed.load(Ordering::Acquire) != 0 {
                self.detach();
                return None;
            }

            let head = header.write_clock.load(Ordering::Acquire);
            if head < self.next_clock {
                return None;
            }

            let generation = header.generation.load(Ordering::Acquire);
            if attached.data.as_ref().map(|d| d.generation) != Some(generation) {
                match DataMapping::open(&self.name, generation) {
                    Ok(mapping) => attached.data = Some(mapping),
                    Err(_) => return None,
                }
            }
            let data = attached.data.as_ref()?.view();
            let count = data.buffer_count() as u64;

            if head - self.next_clock >= count {
                let lost = head - self.next_clock - count + 1;
                ShmMetrics::add(&self.metrics.drops, lost);
                log::debug!("[SHM] {} reader overrun, {} samples lost", self.topic, lost);
                self.next_clock += lost;
            }

            let clock = self.next_clock;
            let index = slot_index(clock, data.buffer_count());
            let slot = data.slot(index);
            let seq = slot.load_seq();
            if seq != clock << 1 {
                // Overwritten, or written into a generation since replaced
                ShmMetrics::inc(&self.metrics.drops);
                self.next_clock += 1;
                continue;
            }

            let len = (slot.len.load(Ordering::Relaxed) as usize).min(data.slot_capacity());
            let info = SampleInfo {
                clock,
                writer_id: slot.writer_id.load(Ordering::Relaxed),
                timestamp: slot.timestamp.load(Ordering::Relaxed),
            };
            // SAFETY: len <= slot_capacity and the mapping stays alive in
            // attached.data for the duration of f
            let bytes = unsafe { std::slice::from_raw_parts(data.payload_ptr(index), len) };
            let result = f.take().map(|f| f(bytes, info));

            fence(Ordering::Acquire);
            self.next_clock += 1;
            if slot.load_seq() != seq {
                ShmMetrics::inc(&self.metrics.torn_reads);
                log::warn!(
                    "[SHM] {} torn read at clock {} discarded",
                    self.topic,
                    clock
                );
                return None;
            }

            ShmMetrics::inc(&self.metrics.reads);
            if let Some(index) = attached.slot {
                view.reader(index).ack_clock.store(clock, Ordering::Release);
                header.ack_notify.fetch_add(1, Ordering::Release);
                futex_wake_all(&header.ack_notify);
            }
            return result;
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ShmMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.detach();
    }
}

fn release_slot(attached: &Attached, token: u64) {
    let Some(index) = attached.slot else {
        return;
    };
    let view = control_view(&attached.control);
    let slot = view.reader(index);
    // Tokens are only unique per process.
    if slot.token.load(Ordering::Relaxed) == token
        && slot
            .pid
            .compare_exchange(std::process::id(), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    {
        // A writer may be waiting on this reader's acknowledgement.
        let header = view.header();
        header.ack_notify.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.ack_notify);
    }
}
