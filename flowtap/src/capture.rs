//! Host-facing capture handle: ring frames in, `(FlowKey, bytes)` out.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, trace, warn};

use flowtap_common::FlowKey;

use crate::{
    config::CaptureConfig,
    error::{CaptureError, FlowTableError},
    extract::{SkipReason, extract},
    flow_table::{FlowTable, Tracker},
    model::FlowRecord,
    ring::{BlockCursor, FrameSlot, PacketRing},
    session::{CaptureSession, KernelStats, SessionOptions, StopHandle, Wake, monotonic_ns},
};

/// A keyed frame, borrowed from the ring until the next `poll`.
#[derive(Clone, Copy, Debug)]
pub struct CapturedFrame<'a> {
    pub key: FlowKey,
    pub data: &'a [u8],
    /// Kernel receive time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub wire_len: u32,
}

#[derive(Debug)]
pub enum Polled<'a> {
    Frame(CapturedFrame<'a>),
    /// The timeout passed without a keyed frame.
    Empty,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CaptureStats {
    pub kernel: KernelStats,
    pub frames_delivered: u64,
    pub bytes_delivered: u64,
    pub skipped_truncated: u64,
    pub skipped_unsupported: u64,
    pub skipped_malformed: u64,
    pub skipped_fragment: u64,
    /// Frames this host transmitted; neither flow table counts them.
    pub outgoing_ignored: u64,
    pub blocks_released: u64,
}

impl CaptureStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_truncated + self.skipped_unsupported + self.skipped_malformed + self.skipped_fragment
    }

    fn count_skip(&mut self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::Truncated => &mut self.skipped_truncated,
            SkipReason::UnsupportedL2 => &mut self.skipped_unsupported,
            SkipReason::Malformed => &mut self.skipped_malformed,
            SkipReason::Fragment => &mut self.skipped_fragment,
        };
        *counter += 1;
    }
}

/// Walks user-owned blocks frame by frame, holding at most one block.
#[derive(Default)]
struct Reader {
    cursor: Option<BlockCursor>,
    stats: CaptureStats,
}

impl Reader {
    /// Next frame that yields a key, from blocks the kernel has already
    /// retired. `None` means the ring is drained for now.
    fn next(&mut self, ring: &mut PacketRing, flows: Option<&FlowTable>) -> Option<(FlowKey, FrameSlot)> {
        loop {
            let cursor = match self.cursor.as_mut() {
                Some(cursor) => cursor,
                None => {
                    let idx = ring.try_acquire()?;
                    self.cursor.insert(ring.cursor(idx))
                }
            };

            let Some(slot) = ring.next_slot(cursor) else {
                let block = cursor.block;
                self.cursor = None;
                if ring.release(block) {
                    self.stats.blocks_released += 1;
                }
                continue;
            };
            if slot.is_outgoing() {
                self.stats.outgoing_ignored += 1;
                continue;
            }

            match extract(ring.frame(&slot).data()) {
                Ok(key) => {
                    self.stats.frames_delivered += 1;
                    self.stats.bytes_delivered += slot.wire_len() as u64;
                    if let Some(table) = flows {
                        table.observe(&key, slot.wire_len() as u64, monotonic_ns());
                    }
                    return Some((key, slot));
                }
                Err(reason) => {
                    trace!(%reason, "skipped frame");
                    self.stats.count_skip(reason);
                    if let Some(table) = flows {
                        table.observe_skip(reason.counter_slot());
                    }
                }
            }
        }
    }

    fn release_held(&mut self, ring: &mut PacketRing) {
        if let Some(cursor) = self.cursor.take() {
            if ring.release(cursor.block) {
                self.stats.blocks_released += 1;
            }
        }
    }
}

/// A running capture on one interface, plus its flow accounting.
pub struct FlowCapture {
    session: CaptureSession,
    reader: Reader,
    tracker: Tracker,
}

impl FlowCapture {
    /// Open the ring and start flow tracking. Must run inside a tokio runtime.
    pub fn start(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let options = SessionOptions {
            promiscuous: config.promiscuous,
        };
        let session = CaptureSession::open(&config.interface, &config.ring, &options)?;
        let tracker = Tracker::start(&config.interface, &config.flow_table)?;
        info!(
            interface = %config.interface,
            flow_table = tracker.table.as_ref().map_or("off", FlowTable::source),
            "flow capture started"
        );
        Ok(Self {
            session,
            reader: Reader::default(),
            tracker,
        })
    }

    pub fn interface(&self) -> &str {
        self.session.interface()
    }

    /// Next keyed frame, waiting up to `timeout` (`None` waits until stopped).
    ///
    /// The block behind the previous frame is released here, so the returned
    /// view must be dropped before polling again.
    pub async fn poll(&mut self, timeout: Option<Duration>) -> Result<Polled<'_>, CaptureError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.session.is_closed() {
                self.reader.release_held(self.session.ring_mut());
                return Err(CaptureError::Closed);
            }

            let flows = self.tracker.table.as_ref();
            if let Some((key, slot)) = self.reader.next(self.session.ring_mut(), flows) {
                let frame = self.session.ring_mut().frame(&slot);
                return Ok(Polled::Frame(CapturedFrame {
                    key,
                    data: frame.data(),
                    timestamp_ns: frame.timestamp_ns(),
                    wire_len: frame.wire_len(),
                }));
            }

            match self.session.wait(deadline).await? {
                Wake::Readable => continue,
                Wake::Timeout => return Ok(Polled::Empty),
                Wake::Stopped => continue,
            }
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    /// Delivery and skip counts, with fresh kernel socket counters.
    pub fn stats(&mut self) -> Result<CaptureStats, CaptureError> {
        let kernel = self.session.kernel_stats()?;
        Ok(CaptureStats {
            kernel,
            ..self.reader.stats
        })
    }

    /// Read handle for concurrent flow queries, if tracking is on.
    pub fn flow_table(&self) -> Option<FlowTable> {
        self.tracker.table.clone()
    }

    /// `Ok(None)` when the flow has never been seen.
    pub fn query_flow(&self, key: &FlowKey) -> Result<Option<FlowRecord>, CaptureError> {
        let table = self.tracker.table.as_ref().ok_or(FlowTableError::Disabled)?;
        Ok(table.query(key)?)
    }

    /// Stop capturing and return the final counters. Flow tables obtained
    /// from [`FlowCapture::flow_table`] stay readable.
    pub fn stop(mut self) -> CaptureStats {
        self.session.stop_handle().stop();
        self.reader.release_held(self.session.ring_mut());
        if let Some(kernel) = self.tracker.kernel.take() {
            if let Err(err) = kernel.detach() {
                warn!(interface = %self.session.interface(), error = %err, "failed to detach xdp flow tracker");
            }
        }
        match self.stats() {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "failed to read final socket statistics");
                self.reader.stats
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::testing::{tcp_frame, udp_frame};
    use crate::ring::testing::small_geometry;

    fn drain(reader: &mut Reader, ring: &mut PacketRing, flows: Option<&FlowTable>) -> Vec<FlowKey> {
        let mut keys = Vec::new();
        while let Some((key, _)) = reader.next(ring, flows) {
            keys.push(key);
        }
        keys
    }

    #[test]
    fn keyed_frames_are_delivered_and_skips_counted() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let tcp = tcp_frame([10, 0, 0, 1], 4444, [10, 0, 0, 2], 80);
        let udp = udp_frame([192, 168, 1, 10], 5000, [192, 168, 1, 20], 53);
        let mut ipv6 = tcp.clone();
        ipv6[12..14].copy_from_slice(&[0x86, 0xdd]);
        ring.kernel_fill(0, &[&tcp, &tcp[..20], &ipv6, &udp]);

        let mut reader = Reader::default();
        let keys = drain(&mut reader, &mut ring, None);

        assert_eq!(keys.len(), 2);
        assert_eq!((keys[0].src_port, keys[0].dst_port, keys[0].protocol), (4444, 80, 6));
        assert_eq!((keys[1].src_port, keys[1].dst_port, keys[1].protocol), (5000, 53, 17));
        assert_eq!(reader.stats.frames_delivered, 2);
        assert_eq!(reader.stats.skipped_truncated, 1);
        assert_eq!(reader.stats.skipped_unsupported, 1);
        assert_eq!(reader.stats.skipped(), 2);
        assert_eq!(reader.stats.blocks_released, 1);
        assert_eq!(ring.block_status(0), libc::TP_STATUS_KERNEL);
    }

    #[test]
    fn block_is_held_until_the_next_call() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        ring.kernel_fill(0, &[&frame]);

        let mut reader = Reader::default();
        let (_, slot) = reader.next(&mut ring, None).unwrap();
        assert_eq!(ring.held(), Some(0), "view's block stays user-owned");
        assert_eq!(ring.frame(&slot).data(), &frame[..]);

        assert!(reader.next(&mut ring, None).is_none());
        assert_eq!(ring.held(), None);
        assert_eq!(ring.block_status(0), libc::TP_STATUS_KERNEL);
    }

    #[test]
    fn empty_and_all_skipped_blocks_are_released() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[]);
        ring.kernel_fill(1, &[b"short"]);
        let frame = udp_frame([10, 0, 0, 1], 7, [10, 0, 0, 2], 8);
        ring.kernel_fill(2, &[&frame]);

        let mut reader = Reader::default();
        assert_eq!(drain(&mut reader, &mut ring, None).len(), 1);
        assert_eq!(reader.stats.blocks_released, 3);
        for idx in 0..3 {
            assert_eq!(ring.block_status(idx), libc::TP_STATUS_KERNEL);
        }
    }

    #[test]
    fn software_table_counts_delivered_frames() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let frame = udp_frame([192, 168, 1, 10], 5000, [192, 168, 1, 20], 53);
        ring.kernel_fill(0, &[&frame, &frame, &frame[..10]]);
        ring.kernel_fill(1, &[&frame]);

        let table = FlowTable::software(16).unwrap();
        let mut reader = Reader::default();
        let keys = drain(&mut reader, &mut ring, Some(&table));
        assert_eq!(keys.len(), 3);

        let record = table.query(&keys[0]).unwrap().expect("flow recorded");
        assert_eq!(record.packet_count, 3);
        assert_eq!(record.byte_count, 3 * (frame.len() as u64 + 4));
        assert!(record.last_seen_ns >= record.first_seen_ns);
        assert_eq!(table.counters().unwrap().skipped_truncated, 1);
    }

    #[test]
    fn outgoing_frames_are_neither_delivered_nor_counted() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let frame = udp_frame([192, 168, 1, 10], 5000, [192, 168, 1, 20], 53);
        // A frame sent on `lo` shows up once as outgoing and once as received.
        ring.kernel_fill_typed(0, &[(&frame, libc::PACKET_OUTGOING), (&frame, libc::PACKET_HOST)]);

        let table = FlowTable::software(16).unwrap();
        let mut reader = Reader::default();
        let keys = drain(&mut reader, &mut ring, Some(&table));

        assert_eq!(keys.len(), 1);
        assert_eq!(reader.stats.frames_delivered, 1);
        assert_eq!(reader.stats.outgoing_ignored, 1);
        assert_eq!(reader.stats.skipped(), 0);
        let record = table.query(&keys[0]).unwrap().expect("flow recorded");
        assert_eq!(record.packet_count, 1);
        assert_eq!(record.byte_count, frame.len() as u64 + 4);
    }

    #[test]
    fn release_held_returns_block_once() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        ring.kernel_fill(0, &[&frame, &frame]);

        let mut reader = Reader::default();
        reader.next(&mut ring, None).unwrap();
        reader.release_held(&mut ring);
        reader.release_held(&mut ring);
        assert_eq!(reader.stats.blocks_released, 1);
        assert!(reader.next(&mut ring, None).is_none(), "released frames are not redelivered");
    }
}
