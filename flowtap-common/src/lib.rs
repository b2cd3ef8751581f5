#![cfg_attr(not(test), no_std)]

// Types shared between the XDP flow tracker and userspace.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

use core::{
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

/// Ethernet/IPv4/L4 header geometry used by both parsers.
pub mod hdr {
    pub const ETH_HDR_LEN: usize = 14;
    pub const ETH_TYPE_OFFSET: usize = 12;
    pub const ETH_P_IPV4: u16 = 0x0800;

    pub const IPV4_MIN_HDR_LEN: usize = 20;
    pub const IPV4_FRAG_OFFSET: usize = 6;
    pub const IPV4_PROTO_OFFSET: usize = 9;
    pub const IPV4_SRC_OFFSET: usize = 12;
    pub const IPV4_DST_OFFSET: usize = 16;
    /// Low 13 bits of the flags/fragment-offset word.
    pub const IPV4_FRAG_MASK: u16 = 0x1fff;

    pub const TCP_HDR_LEN: usize = 20;
    pub const UDP_HDR_LEN: usize = 8;

    pub const PROTO_ICMP: u8 = 1;
    pub const PROTO_TCP: u8 = 6;
    pub const PROTO_UDP: u8 = 17;
}

/// Map names as they appear in the compiled object.
pub const FLOW_TABLE_MAP: &str = "FLOW_TABLE";
pub const FLOW_COUNTERS_MAP: &str = "FLOW_COUNTERS";
pub const XDP_PROGRAM: &str = "flowtap";

/// Default flow table capacity. Key 16 bytes + value 40 bytes per entry.
pub const FLOW_TABLE_MAX_ENTRIES: u32 = 65536;

/// Slots of the per-CPU counter array kept next to the flow table.
pub const SLOT_INSERTED: u32 = 0;
pub const SLOT_UPDATED: u32 = 1;
pub const SLOT_REJECTED_FULL: u32 = 2;
pub const SLOT_SKIP_TRUNCATED: u32 = 3;
pub const SLOT_SKIP_UNSUPPORTED: u32 = 4;
pub const SLOT_SKIP_MALFORMED: u32 = 5;
pub const SLOT_SKIP_FRAGMENT: u32 = 6;
pub const COUNTER_SLOTS: u32 = 7;

/// Coarse L7 tags. Port hints only: payload is never inspected here.
pub const L7_UNKNOWN: u32 = 0;
pub const L7_DNS: u32 = 1;
pub const L7_HTTP: u32 = 2;
pub const L7_TLS: u32 = 3;
pub const L7_SSH: u32 = 4;

/// IPv4 5-tuple. Every field is in host byte order.
///
/// Direction is not normalized: A->B and B->A are different keys.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub pad: [u8; 3],
}

impl FlowKey {
    #[inline(always)]
    pub const fn new(
        src_addr: u32,
        dst_addr: u32,
        src_port: u16,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
            pad: [0; 3],
        }
    }
}

/// Per-flow counters. Timestamps come from the kernel monotonic clock.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    pub l7_tag: u32,
    pub pad: u32,
}

impl FlowStats {
    #[inline(always)]
    pub fn first_packet(key: &FlowKey, len: u64, now_ns: u64) -> Self {
        Self {
            packet_count: 1,
            byte_count: len,
            first_seen_ns: now_ns,
            last_seen_ns: now_ns,
            l7_tag: coarse_l7_tag(key),
            pad: 0,
        }
    }

    #[inline(always)]
    pub fn observe(&mut self, len: u64, now_ns: u64) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.byte_count = self.byte_count.wrapping_add(len);
        self.last_seen_ns = now_ns;
    }

    /// [`FlowStats::observe`] for an entry that other CPUs update at the
    /// same time. Counts are atomic adds; `last_seen_ns` is last writer wins.
    ///
    /// # Safety
    ///
    /// `stats` must point to a live, 8-byte aligned `FlowStats` that is only
    /// written through this function while it is shared.
    #[inline(always)]
    pub unsafe fn observe_shared(stats: *mut FlowStats, len: u64, now_ns: u64) {
        let packets = &*(ptr::addr_of_mut!((*stats).packet_count) as *const AtomicU64);
        let bytes = &*(ptr::addr_of_mut!((*stats).byte_count) as *const AtomicU64);
        let last_seen = &*(ptr::addr_of_mut!((*stats).last_seen_ns) as *const AtomicU64);
        packets.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(len, Ordering::Relaxed);
        last_seen.store(now_ns, Ordering::Relaxed);
    }
}

const _: () = assert!(core::mem::size_of::<FlowKey>() == 16);
const _: () = assert!(core::mem::size_of::<FlowStats>() == 40);

/// Placeholder classifier: tags a flow by well-known port, nothing more.
#[inline(always)]
pub fn coarse_l7_tag(key: &FlowKey) -> u32 {
    if key.protocol != hdr::PROTO_TCP && key.protocol != hdr::PROTO_UDP {
        return L7_UNKNOWN;
    }
    let tag = port_hint(key.dst_port);
    if tag != L7_UNKNOWN {
        return tag;
    }
    port_hint(key.src_port)
}

#[inline(always)]
fn port_hint(port: u16) -> u32 {
    match port {
        53 => L7_DNS,
        80 | 8080 => L7_HTTP,
        443 | 8443 => L7_TLS,
        22 => L7_SSH,
        _ => L7_UNKNOWN,
    }
}

/// Why an insert into a fixed-capacity table did not happen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertError {
    /// Capacity reached; existing entries are never evicted.
    Full,
    /// Another writer inserted the key first.
    Exists,
}

/// Storage contract of the flow table: update-in-place or insert, no removal.
pub trait FlowStore {
    /// Count one packet on an existing entry. `false` if `key` is absent.
    fn observe(&mut self, key: &FlowKey, len: u64, now_ns: u64) -> bool;
    fn insert_new(&mut self, key: &FlowKey, stats: &FlowStats) -> Result<(), InsertError>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlowUpdate {
    Inserted,
    Updated,
    Rejected,
}

impl FlowUpdate {
    pub const fn counter_slot(self) -> u32 {
        match self {
            FlowUpdate::Inserted => SLOT_INSERTED,
            FlowUpdate::Updated => SLOT_UPDATED,
            FlowUpdate::Rejected => SLOT_REJECTED_FULL,
        }
    }
}

/// Account one packet of `len` bytes for `key`.
///
/// Loop-free so it can run inside the XDP program unchanged.
#[inline(always)]
pub fn record_packet<S: FlowStore>(
    store: &mut S,
    key: &FlowKey,
    len: u64,
    now_ns: u64,
) -> FlowUpdate {
    if store.observe(key, len, now_ns) {
        return FlowUpdate::Updated;
    }

    let fresh = FlowStats::first_packet(key, len, now_ns);
    match store.insert_new(key, &fresh) {
        Ok(()) => FlowUpdate::Inserted,
        Err(InsertError::Exists) if store.observe(key, len, now_ns) => FlowUpdate::Updated,
        Err(InsertError::Exists) | Err(InsertError::Full) => FlowUpdate::Rejected,
    }
}

// With the `user` feature the map types can be read through aya's typed maps.
// Kept behind a feature so the eBPF side never pulls in userspace crates.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{FlowKey, FlowStats};
    use aya::Pod;

    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowStats {}
}
