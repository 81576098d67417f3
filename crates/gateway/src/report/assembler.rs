// BSD-2-Clause

//! Report assembler & demultiplexer.
//!
//! Buffers self-delimited fragments from one streaming/tracing interface
//! into complete reports, enforcing the single-active-writer and
//! bounded-buffer invariants, then fans assembled reports out to
//! subscribers keyed by `(device_id, selector)` with per-subscriber
//! backpressure: a slow subscriber's full queue only drops that
//! subscriber's next report, instead of blocking or dropping for everyone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::error::{malformed_report, report_too_large, GatewayResult};
use crate::model::DeviceId;
use crate::report::{
    IndividualReport, Report, SignedListHeader, SignedListReport, FORMAT_CODE_INDIVIDUAL, INDIVIDUAL_LEN,
    SIGNED_HEADER_LEN, SIGNED_LIST_MAGIC,
};

/// The minimum bytes needed to tell a `SignedList` frame's leading `magic`
/// from an `Individual` frame's leading format code.
const FRAME_PREFIX_LEN: usize = 4;

/// Whether `buf` opens with a `SignedList` frame's magic. `Individual`
/// frames carry their format code at byte 0 instead; the two framings are
/// told apart by this, not by a shared format-code offset.
fn starts_with_signed_list_magic(buf: &[u8]) -> bool {
    buf.len() >= FRAME_PREFIX_LEN && buf[0..4] == SIGNED_LIST_MAGIC.to_le_bytes()
}

/// Incrementally assembles framed reports from a byte-fragment stream on
/// one streaming or tracing interface.
pub struct ReportAssembler {
    max_report_bytes: usize,
    buf: Vec<u8>,
    active_writer: Option<u64>,
}

impl ReportAssembler {
    pub fn new(max_report_bytes: usize) -> Self {
        Self { max_report_bytes, buf: Vec::new(), active_writer: None }
    }

    /// Feed a fragment from `writer` (an opaque id identifying the source of
    /// this byte range — e.g. an adapter's internal read-loop generation).
    /// Returns zero or more raw, length-complete frames ready for
    /// `report::codec`/`Report` decoding.
    ///
    /// A fragment from a writer other than the one a partially-assembled
    /// report started with is a fatal protocol error: only one writer may
    /// be mid-frame on an interface at a time.
    pub fn push_fragment(&mut self, writer: u64, fragment: &[u8]) -> GatewayResult<Vec<Vec<u8>>> {
        if !self.buf.is_empty() {
            match self.active_writer {
                Some(w) if w != writer => {
                    self.reset();
                    return Err(malformed_report(
                        "second writer began a report before the first completed",
                    ));
                }
                _ => {}
            }
        }
        self.active_writer = Some(writer);
        self.buf.extend_from_slice(fragment);

        if self.buf.len() > self.max_report_bytes {
            let overflowed = self.buf.len();
            self.reset();
            return Err(report_too_large(format!(
                "report exceeded max_report_bytes ({overflowed} > {})",
                self.max_report_bytes
            )));
        }

        let mut completed = Vec::new();
        loop {
            match self.try_extract_frame()? {
                Some(frame) => completed.push(frame),
                None => break,
            }
        }
        if self.buf.is_empty() {
            self.active_writer = None;
        }
        Ok(completed)
    }

    fn try_extract_frame(&mut self) -> GatewayResult<Option<Vec<u8>>> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        if starts_with_signed_list_magic(&self.buf) {
            // The full header (magic + format code + length fields) must be
            // buffered before the declared length is known.
            if self.buf.len() < SIGNED_HEADER_LEN {
                return Ok(None);
            }
            let header = SignedListHeader::decode(&self.buf)?;
            let declared_len = header.length as usize;
            if self.buf.len() < declared_len {
                return Ok(None);
            }
            let frame: Vec<u8> = self.buf.drain(..declared_len).collect();
            return Ok(Some(frame));
        }

        match self.buf[0] {
            FORMAT_CODE_INDIVIDUAL => {
                if self.buf.len() < INDIVIDUAL_LEN {
                    return Ok(None);
                }
                let frame: Vec<u8> = self.buf.drain(..INDIVIDUAL_LEN).collect();
                Ok(Some(frame))
            }
            other => {
                self.reset();
                Err(malformed_report(format!("unknown format_code {other}")))
            }
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.active_writer = None;
    }
}

/// Decode a raw completed frame into a [`Report`] (header validation only —
/// signature verification is a separate step via `codec::verify`).
pub fn decode_frame(frame: &[u8]) -> GatewayResult<Report> {
    if starts_with_signed_list_magic(frame) {
        return Ok(Report::SignedList(SignedListReport::decode(frame)?));
    }
    match frame.first() {
        Some(&FORMAT_CODE_INDIVIDUAL) => Ok(Report::Individual(IndividualReport::decode(frame)?)),
        _ => Err(malformed_report("empty or unrecognized frame")),
    }
}

/// Selector key for fan-out: `(device_id, selector)`. Individual reports
/// (which carry no selector) are routed under selector `0`.
pub type SubscriberKey = (DeviceId, u16);

/// One registered subscriber's bounded queue and drop counter.
struct Subscriber {
    tx: mpsc::Sender<Arc<Report>>,
    dropped: AtomicU64,
}

/// Fans assembled reports out to subscribers keyed by `(device_id,
/// selector)`, dropping into a full queue only for that subscriber.
#[derive(Default)]
pub struct ReportDemultiplexer {
    subscribers: RwLock<HashMap<SubscriberKey, Vec<Arc<Subscriber>>>>,
}

impl ReportDemultiplexer {
    pub fn new() -> Self {
        Self { subscribers: RwLock::new(HashMap::new()) }
    }

    /// Register a new subscriber, returning its receiver.
    pub async fn subscribe(
        &self,
        key: SubscriberKey,
        queue_capacity: usize,
    ) -> (Arc<SubscriberHandle>, mpsc::Receiver<Arc<Report>>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let subscriber = Arc::new(Subscriber { tx, dropped: AtomicU64::new(0) });
        self.subscribers.write().await.entry(key).or_default().push(Arc::clone(&subscriber));
        (Arc::new(SubscriberHandle { subscriber }), rx)
    }

    /// Dispatch `report` to every subscriber registered for `key`.
    /// Drops, and increments that subscriber's counter, if its queue is
    /// full — unaffected subscribers still receive it.
    pub async fn dispatch(&self, key: SubscriberKey, report: Arc<Report>) {
        let subscribers = self.subscribers.read().await;
        let Some(targets) = subscribers.get(&key) else {
            return;
        };
        for subscriber in targets {
            if subscriber.tx.try_send(Arc::clone(&report)).is_err() {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove every subscriber for `key` whose handle has been dropped.
    pub async fn prune(&self, key: SubscriberKey) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(targets) = subscribers.get_mut(&key) {
            targets.retain(|s| Arc::strong_count(s) > 1);
            if targets.is_empty() {
                subscribers.remove(&key);
            }
        }
    }
}

/// A subscriber's public handle, exposing its drop counter.
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
}

impl SubscriberHandle {
    pub fn dropped_count(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "assembler_tests.rs"]
mod tests;
