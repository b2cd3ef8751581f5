//! TPACKET_V3 receive ring.
//!
//! The mapped region is split into `block_count` blocks. Each block starts
//! with a `tpacket_block_desc` whose `block_status` word says who owns it:
//! the kernel fills blocks while they are `TP_STATUS_KERNEL`, flips them to
//! `TP_STATUS_USER` when they retire (full or timed out), and we flip them
//! back once every frame has been read. That word is the only
//! synchronization with the kernel, so it is read with `Acquire` semantics
//! before touching a block and written with `Release` semantics after.

use std::{
    io, mem,
    os::fd::RawFd,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{fence, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CaptureError;

pub const DEFAULT_BLOCK_SIZE: u32 = 64 << 10; // 64 KiB
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_RING_SIZE: u32 = 4 << 20; // 4 MiB
pub const DEFAULT_RETIRE_TIMEOUT_MS: u32 = 100;

const fn tpacket_align(len: usize) -> usize {
    let align = libc::TPACKET_ALIGNMENT as usize;
    (len + align - 1) & !(align - 1)
}

/// The kernel writes a `sockaddr_ll` right after the aligned frame header.
const SOCKADDR_LL_OFFSET: usize = tpacket_align(mem::size_of::<libc::tpacket3_hdr>());

/// Smallest frame the kernel accepts: aligned frame header + link address.
const TPACKET3_HDRLEN: usize = SOCKADDR_LL_OFFSET + mem::size_of::<libc::sockaddr_ll>();

/// Ring sizing. The block count is derived from the total ring size.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingGeometry {
    pub block_size: u32,
    pub frame_size: u32,
    pub ring_size: u32,
    pub retire_timeout_ms: u32,
}

impl Default for RingGeometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            frame_size: DEFAULT_FRAME_SIZE,
            ring_size: DEFAULT_RING_SIZE,
            retire_timeout_ms: DEFAULT_RETIRE_TIMEOUT_MS,
        }
    }
}

impl RingGeometry {
    pub fn block_count(&self) -> u32 {
        self.ring_size.checked_div(self.block_size).unwrap_or(0)
    }

    pub fn frames_per_block(&self) -> u32 {
        self.block_size.checked_div(self.frame_size).unwrap_or(0)
    }

    pub fn frame_count(&self) -> u32 {
        self.frames_per_block().saturating_mul(self.block_count())
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        self.validate_for_page(page_size())
    }

    fn validate_for_page(&self, page: u32) -> Result<(), CaptureError> {
        let invalid = |msg: String| Err(CaptureError::InvalidGeometry(msg));

        if self.block_size == 0 || self.frame_size == 0 || self.ring_size == 0 {
            return invalid("ring parameters must be non-zero".to_string());
        }
        if !self.block_size.is_power_of_two() || self.block_size % page != 0 {
            return invalid(format!(
                "block size {} must be a power of two and a multiple of the {page}-byte page",
                self.block_size
            ));
        }
        let alignment = libc::TPACKET_ALIGNMENT as u32;
        if self.frame_size % alignment != 0 {
            return invalid(format!(
                "frame size {} must be aligned to {alignment} bytes",
                self.frame_size
            ));
        }
        if (self.frame_size as usize) < TPACKET3_HDRLEN {
            return invalid(format!(
                "frame size {} is smaller than the {TPACKET3_HDRLEN}-byte frame header",
                self.frame_size
            ));
        }
        if self.frame_size > self.block_size {
            return invalid("frame size must be <= block size".to_string());
        }
        if self.block_size % self.frame_size != 0 {
            return invalid("block size must be a multiple of frame size".to_string());
        }
        if self.ring_size % self.block_size != 0 {
            return invalid("ring size must be a multiple of block size".to_string());
        }
        if self.block_count() < 2 {
            return invalid("ring needs at least two blocks".to_string());
        }
        Ok(())
    }

    fn to_req(self) -> libc::tpacket_req3 {
        libc::tpacket_req3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count(),
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count(),
            tp_retire_blk_tov: self.retire_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: libc::TP_FT_REQ_FILL_RXHASH,
        }
    }
}

fn page_size() -> u32 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as u32 }
}

/// Memory behind the ring. Unmapped exactly once, on drop.
struct Region {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

enum Backing {
    Mmap,
    #[cfg(test)]
    Heap(#[allow(dead_code)] Vec<u64>),
}

impl Drop for Region {
    fn drop(&mut self) {
        if matches!(self.backing, Backing::Mmap) {
            unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Read position inside a held block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockCursor {
    pub(crate) block: u32,
    remaining: u32,
    offset: usize,
}

/// Location and metadata of one validated frame inside a held block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameSlot {
    block: u32,
    data_offset: usize,
    snaplen: usize,
    wire_len: u32,
    sec: u32,
    nsec: u32,
    mac: u16,
    net: u16,
    pkt_type: u8,
}

impl FrameSlot {
    pub(crate) fn wire_len(&self) -> u32 {
        self.wire_len
    }

    /// Sent by this host rather than received.
    pub(crate) fn is_outgoing(&self) -> bool {
        self.pkt_type == libc::PACKET_OUTGOING
    }
}

pub(crate) struct PacketRing {
    region: Region,
    geometry: RingGeometry,
    current_block: u32,
    held: Option<u32>,
}

// Each PacketRing belongs to a single CaptureSession, which is driven by one
// consumer at a time.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    /// Request the ring on `fd` and map it. The caller owns `fd`; closing it
    /// also tears down a ring that was configured but never mapped.
    pub(crate) fn map(fd: RawFd, geometry: RingGeometry, iface: &str) -> Result<Self, CaptureError> {
        geometry.validate()?;
        let req = geometry.to_req();

        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const _ as *const libc::c_void,
                mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CaptureError::ring(iface, "PACKET_RX_RING", io::Error::last_os_error()));
        }

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| CaptureError::InvalidGeometry("ring mmap length overflow".to_string()))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED,
                fd,
                0,
            )
        };
        let base = if base == libc::MAP_FAILED {
            // MAP_LOCKED fails under RLIMIT_MEMLOCK; retry unlocked.
            let retry = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if retry == libc::MAP_FAILED {
                return Err(CaptureError::ring(iface, "mmap", io::Error::last_os_error()));
            }
            retry
        } else {
            base
        };
        let base = NonNull::new(base as *mut u8)
            .ok_or_else(|| CaptureError::ring(iface, "mmap", io::Error::from(io::ErrorKind::Other)))?;

        Ok(Self {
            region: Region {
                base,
                len,
                backing: Backing::Mmap,
            },
            geometry,
            current_block: 0,
            held: None,
        })
    }

    pub(crate) fn geometry(&self) -> &RingGeometry {
        &self.geometry
    }

    fn block_size(&self) -> usize {
        self.geometry.block_size as usize
    }

    fn block_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.geometry.block_count());
        unsafe { self.region.base.as_ptr().add(idx as usize * self.block_size()) }
    }

    fn desc(&self, idx: u32) -> *mut libc::tpacket_block_desc {
        self.block_ptr(idx) as *mut libc::tpacket_block_desc
    }

    fn status(&self, idx: u32) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.desc(idx)).hdr.bh1.block_status)) }
    }

    pub(crate) fn held(&self) -> Option<u32> {
        self.held
    }

    /// Whether the next block in ring order is ready for us.
    pub(crate) fn has_user_block(&self) -> bool {
        self.held.is_none() && self.status(self.current_block) & libc::TP_STATUS_USER != 0
    }

    /// Take ownership of the next block if the kernel has retired it.
    ///
    /// Blocks are consumed strictly in ring order; only one is held at a time.
    pub(crate) fn try_acquire(&mut self) -> Option<u32> {
        if !self.has_user_block() {
            return None;
        }
        fence(Ordering::Acquire);
        let idx = self.current_block;
        self.current_block = (self.current_block + 1) % self.geometry.block_count().max(1);
        self.held = Some(idx);
        debug!(block = idx, frames = self.cursor(idx).remaining, "acquired ring block");
        Some(idx)
    }

    /// Hand a block back to the kernel. Releasing a block that is not held
    /// is a no-op and returns `false`.
    pub(crate) fn release(&mut self, idx: u32) -> bool {
        if self.held != Some(idx) {
            return false;
        }
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*self.desc(idx)).hdr.bh1.block_status),
                libc::TP_STATUS_KERNEL,
            );
        }
        self.held = None;
        true
    }

    pub(crate) fn cursor(&self, idx: u32) -> BlockCursor {
        let (num_pkts, first) = unsafe {
            let bh1 = ptr::addr_of!((*self.desc(idx)).hdr.bh1);
            (
                ptr::read(ptr::addr_of!((*bh1).num_pkts)),
                ptr::read(ptr::addr_of!((*bh1).offset_to_first_pkt)),
            )
        };
        BlockCursor {
            block: idx,
            remaining: num_pkts,
            offset: first as usize,
        }
    }

    /// Validate the frame under `cursor` and advance past it.
    ///
    /// Any offset that would leave the block ends the walk.
    pub(crate) fn next_slot(&self, cursor: &mut BlockCursor) -> Option<FrameSlot> {
        if cursor.remaining == 0 || self.held != Some(cursor.block) {
            return None;
        }
        let block_size = self.block_size();
        let offset = cursor.offset;
        if offset < mem::size_of::<libc::tpacket_block_desc>() || offset + TPACKET3_HDRLEN > block_size {
            cursor.remaining = 0;
            return None;
        }

        let (hdr, addr) = unsafe {
            let frame = self.block_ptr(cursor.block).add(offset);
            (
                ptr::read_unaligned(frame as *const libc::tpacket3_hdr),
                ptr::read_unaligned(frame.add(SOCKADDR_LL_OFFSET) as *const libc::sockaddr_ll),
            )
        };
        let snaplen = hdr.tp_snaplen as usize;
        let data_offset = offset + hdr.tp_mac as usize;
        if snaplen == 0 || data_offset + snaplen > block_size {
            cursor.remaining = 0;
            return None;
        }

        cursor.remaining -= 1;
        match hdr.tp_next_offset as usize {
            0 => cursor.remaining = 0,
            next => cursor.offset = offset + next,
        }

        Some(FrameSlot {
            block: cursor.block,
            data_offset,
            snaplen,
            wire_len: hdr.tp_len,
            sec: hdr.tp_sec,
            nsec: hdr.tp_nsec,
            mac: hdr.tp_mac,
            net: hdr.tp_net,
            pkt_type: addr.sll_pkttype,
        })
    }

    /// Borrow the bytes described by `slot`.
    pub(crate) fn frame(&self, slot: &FrameSlot) -> Frame<'_> {
        debug_assert_eq!(self.held, Some(slot.block));
        let data = unsafe {
            slice::from_raw_parts(self.block_ptr(slot.block).add(slot.data_offset), slot.snaplen)
        };
        Frame {
            data,
            wire_len: slot.wire_len,
            sec: slot.sec,
            nsec: slot.nsec,
            mac: slot.mac,
            net: slot.net,
            outgoing: slot.is_outgoing(),
        }
    }
}

/// A user-owned block. Dropping it hands the block back to the kernel.
pub struct Block<'a> {
    ring: &'a mut PacketRing,
    index: u32,
}

impl<'a> Block<'a> {
    pub(crate) fn new(ring: &'a mut PacketRing, index: u32) -> Self {
        Self { ring, index }
    }

    /// Number of frames the kernel wrote into this block; may be zero.
    pub fn len(&self) -> usize {
        self.ring.cursor(self.index).remaining as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames in arrival order. Each frame borrows the block.
    pub fn frames(&self) -> Frames<'_> {
        let ring: &PacketRing = &*self.ring;
        Frames {
            ring,
            cursor: ring.cursor(self.index),
        }
    }

    /// Return the block to the kernel. Consuming `self` makes a second
    /// release of the same acquisition impossible.
    pub fn release(self) {}
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        self.ring.release(self.index);
    }
}

pub struct Frames<'a> {
    ring: &'a PacketRing,
    cursor: BlockCursor,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Frame<'a>> {
        let slot = self.ring.next_slot(&mut self.cursor)?;
        Some(self.ring.frame(&slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.cursor.remaining as usize))
    }
}

/// One captured frame, read in place from the ring.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    data: &'a [u8],
    wire_len: u32,
    sec: u32,
    nsec: u32,
    mac: u16,
    net: u16,
    outgoing: bool,
}

impl<'a> Frame<'a> {
    /// Captured bytes, starting at the link-layer header.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn capture_len(&self) -> usize {
        self.data.len()
    }

    /// Length of the packet on the wire.
    pub fn wire_len(&self) -> u32 {
        self.wire_len
    }

    pub fn is_truncated(&self) -> bool {
        (self.data.len() as u64) < self.wire_len as u64
    }

    /// Kernel receive timestamp, nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> u64 {
        self.sec as u64 * 1_000_000_000 + self.nsec as u64
    }

    /// Offset of the network header within [`Frame::data`].
    pub fn network_offset(&self) -> Option<usize> {
        self.net.checked_sub(self.mac).map(usize::from)
    }

    /// Looped back from this host's own transmit path.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const FIRST_PKT_OFFSET: usize = tpacket_align(mem::size_of::<libc::tpacket_block_desc>());
    pub const MAC_OFFSET: u16 = 80;

    /// Small ring geometry that passes validation on 4 KiB pages.
    pub fn small_geometry() -> RingGeometry {
        RingGeometry {
            block_size: 4096,
            frame_size: 2048,
            ring_size: 4096 * 4,
            retire_timeout_ms: 10,
        }
    }

    impl PacketRing {
        /// Heap-backed ring for exercising the consumer without a socket.
        pub(crate) fn in_memory(geometry: RingGeometry) -> Self {
            let len = geometry.ring_size as usize;
            let mut words = vec![0u64; len / mem::size_of::<u64>()];
            let base = NonNull::new(words.as_mut_ptr() as *mut u8).unwrap();
            Self {
                region: Region {
                    base,
                    len,
                    backing: Backing::Heap(words),
                },
                geometry,
                current_block: 0,
                held: None,
            }
        }

        /// Act as the kernel: lay received `frames` out in block `idx` and
        /// retire it.
        pub(crate) fn kernel_fill(&mut self, idx: u32, frames: &[&[u8]]) {
            let frames: Vec<_> = frames.iter().map(|data| (*data, libc::PACKET_HOST)).collect();
            self.kernel_fill_typed(idx, &frames);
        }

        /// Like [`PacketRing::kernel_fill`], with an explicit `sll_pkttype`
        /// per frame.
        pub(crate) fn kernel_fill_typed(&mut self, idx: u32, frames: &[(&[u8], u8)]) {
            assert_eq!(self.status(idx) & libc::TP_STATUS_USER, 0, "block still user-owned");
            let block = self.block_ptr(idx);
            let mut offset = FIRST_PKT_OFFSET;
            for (n, &(data, pkt_type)) in frames.iter().enumerate() {
                let span = tpacket_align(MAC_OFFSET as usize + data.len());
                let last = n + 1 == frames.len();
                unsafe {
                    let mut hdr: libc::tpacket3_hdr = mem::zeroed();
                    hdr.tp_next_offset = if last { 0 } else { span as u32 };
                    hdr.tp_sec = 1_700_000_000;
                    hdr.tp_nsec = n as u32;
                    hdr.tp_snaplen = data.len() as u32;
                    hdr.tp_len = data.len() as u32 + 4;
                    hdr.tp_status = libc::TP_STATUS_USER;
                    hdr.tp_mac = MAC_OFFSET;
                    hdr.tp_net = MAC_OFFSET + 14;
                    ptr::write_unaligned(block.add(offset) as *mut libc::tpacket3_hdr, hdr);
                    let mut addr: libc::sockaddr_ll = mem::zeroed();
                    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
                    addr.sll_pkttype = pkt_type;
                    ptr::write_unaligned(
                        block.add(offset + SOCKADDR_LL_OFFSET) as *mut libc::sockaddr_ll,
                        addr,
                    );
                    ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        block.add(offset + MAC_OFFSET as usize),
                        data.len(),
                    );
                }
                offset += span;
            }
            unsafe {
                let bh1 = ptr::addr_of_mut!((*self.desc(idx)).hdr.bh1);
                (*bh1).num_pkts = frames.len() as u32;
                (*bh1).offset_to_first_pkt = FIRST_PKT_OFFSET as u32;
                ptr::write_volatile(ptr::addr_of_mut!((*bh1).block_status), libc::TP_STATUS_USER);
            }
        }

        pub(crate) fn block_status(&self, idx: u32) -> u32 {
            self.status(idx)
        }

        pub(crate) fn frame_header_mut(&mut self, idx: u32, offset: usize) -> *mut libc::tpacket3_hdr {
            unsafe { self.block_ptr(idx).add(offset) as *mut libc::tpacket3_hdr }
        }

        pub(crate) fn set_num_pkts(&mut self, idx: u32, num_pkts: u32) {
            unsafe {
                (*self.desc(idx)).hdr.bh1.num_pkts = num_pkts;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn collect(ring: &mut PacketRing) -> Vec<Vec<u8>> {
        let idx = ring.try_acquire().expect("user block");
        let block = Block::new(ring, idx);
        let frames = block.frames().map(|f| f.data().to_vec()).collect();
        block.release();
        frames
    }

    #[test]
    fn reference_geometry_is_valid() {
        let geometry = RingGeometry::default();
        geometry.validate_for_page(4096).unwrap();
        assert_eq!(geometry.block_count(), 64);
        assert_eq!(geometry.frames_per_block(), 32);
        assert_eq!(geometry.frame_count(), 2048);
    }

    #[test]
    fn invalid_geometries_are_rejected() {
        let base = RingGeometry::default();
        let cases = [
            RingGeometry { block_size: 0, ..base },
            RingGeometry { block_size: 3 * 4096, ring_size: 3 * 4096 * 8, ..base },
            RingGeometry { block_size: 2048, frame_size: 1024, ring_size: 2048 * 8, ..base },
            RingGeometry { frame_size: 2050, ..base },
            RingGeometry { frame_size: 32, ..base },
            RingGeometry { frame_size: 128 << 10, ..base },
            RingGeometry { frame_size: 48 * 16, ..base },
            RingGeometry { ring_size: (4 << 20) + 4096, ..base },
            RingGeometry { ring_size: 64 << 10, ..base },
        ];
        for geometry in cases {
            assert!(
                matches!(geometry.validate_for_page(4096), Err(CaptureError::InvalidGeometry(_))),
                "accepted {geometry:?}"
            );
        }
    }

    #[test]
    fn kernel_owned_blocks_are_not_acquired() {
        let mut ring = PacketRing::in_memory(small_geometry());
        assert!(!ring.has_user_block());
        assert_eq!(ring.try_acquire(), None);
    }

    #[test]
    fn frames_come_out_in_arrival_order() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"first-frame-.....", b"second", b"third-frame"]);

        let frames = collect(&mut ring);
        assert_eq!(
            frames,
            vec![b"first-frame-.....".to_vec(), b"second".to_vec(), b"third-frame".to_vec()]
        );
        assert_eq!(ring.block_status(0), libc::TP_STATUS_KERNEL);
    }

    #[test]
    fn frame_metadata_is_exposed() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"0123456789abcdefghij"]);
        let idx = ring.try_acquire().unwrap();
        let block = Block::new(&mut ring, idx);
        let frame = block.frames().next().unwrap();

        assert_eq!(frame.capture_len(), 20);
        assert_eq!(frame.wire_len(), 24);
        assert!(frame.is_truncated());
        assert_eq!(frame.network_offset(), Some(14));
        assert!(!frame.is_outgoing());
        assert_eq!(frame.timestamp_ns(), 1_700_000_000 * 1_000_000_000);
    }

    #[test]
    fn blocks_are_consumed_in_ring_order_and_wrap() {
        let mut ring = PacketRing::in_memory(small_geometry());
        let count = ring.geometry().block_count();
        for round in 0..2u8 {
            for idx in 0..count {
                let tag = [round, idx as u8];
                ring.kernel_fill(idx, &[&tag]);
                assert_eq!(collect(&mut ring), vec![tag.to_vec()]);
            }
        }
    }

    #[test]
    fn double_release_is_a_noop() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"once"]);
        let idx = ring.try_acquire().unwrap();

        assert!(ring.release(idx));
        assert!(!ring.release(idx));
        assert_eq!(ring.try_acquire(), None, "frames must not be delivered twice");

        // The kernel refilling the block is a new acquisition.
        ring.kernel_fill(1, &[b"next"]);
        assert_eq!(collect(&mut ring), vec![b"next".to_vec()]);
    }

    #[test]
    fn only_one_block_is_held_at_a_time() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"a"]);
        ring.kernel_fill(1, &[b"b"]);
        let first = ring.try_acquire().unwrap();
        assert_eq!(ring.try_acquire(), None);
        assert!(ring.release(first));
        assert_eq!(ring.try_acquire(), Some(1));
    }

    #[test]
    fn empty_retired_block_is_still_released() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[]);
        let idx = ring.try_acquire().unwrap();
        let block = Block::new(&mut ring, idx);
        assert!(block.is_empty());
        assert_eq!(block.frames().count(), 0);
        drop(block);
        assert_eq!(ring.block_status(0), libc::TP_STATUS_KERNEL);
        assert_eq!(ring.held(), None);
    }

    #[test]
    fn corrupt_offsets_end_the_walk() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"good", b"bad"]);
        let second = FIRST_PKT_OFFSET + tpacket_align(MAC_OFFSET as usize + 4);
        unsafe {
            (*ring.frame_header_mut(0, second)).tp_snaplen = 1 << 20;
        }
        assert_eq!(collect(&mut ring), vec![b"good".to_vec()]);
    }

    #[test]
    fn overstated_packet_count_stops_at_last_frame() {
        let mut ring = PacketRing::in_memory(small_geometry());
        ring.kernel_fill(0, &[b"only"]);
        ring.set_num_pkts(0, 50);
        assert_eq!(collect(&mut ring), vec![b"only".to_vec()]);
    }
}
