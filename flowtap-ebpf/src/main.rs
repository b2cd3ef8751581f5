#![no_std]
#![no_main]

// XDP flow tracker: derives the IPv4 5-tuple of every received frame and
// accounts it in FLOW_TABLE. Never drops or rewrites anything.

mod maps;

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::xdp;
use aya_ebpf::programs::XdpContext;
use flowtap_common::{
    FlowKey, SLOT_SKIP_FRAGMENT, SLOT_SKIP_MALFORMED, SLOT_SKIP_TRUNCATED,
    SLOT_SKIP_UNSUPPORTED, hdr, record_packet,
};

use maps::{KernelFlowTable, bump};

enum Skip {
    Truncated,
    Unsupported,
    Malformed,
    Fragment,
}

impl Skip {
    #[inline(always)]
    fn slot(self) -> u32 {
        match self {
            Skip::Truncated => SLOT_SKIP_TRUNCATED,
            Skip::Unsupported => SLOT_SKIP_UNSUPPORTED,
            Skip::Malformed => SLOT_SKIP_MALFORMED,
            Skip::Fragment => SLOT_SKIP_FRAGMENT,
        }
    }
}

#[xdp]
pub fn flowtap(ctx: XdpContext) -> u32 {
    let data = ctx.data() as *const u8;
    let data_end = ctx.data_end() as *const u8;

    match flow_key(data, data_end) {
        Ok(key) => {
            let len = (data_end as usize).saturating_sub(data as usize) as u64;
            let now = unsafe { bpf_ktime_get_ns() };
            let update = record_packet(&mut KernelFlowTable, &key, len, now);
            bump(update.counter_slot());
        }
        Err(skip) => bump(skip.slot()),
    }
    xdp_action::XDP_PASS
}

#[inline(always)]
fn fits(data: *const u8, data_end: *const u8, len: usize) -> bool {
    unsafe { data.add(len) <= data_end }
}

#[inline(always)]
fn read_u8(data: *const u8, offset: usize) -> u8 {
    unsafe { *data.add(offset) }
}

#[inline(always)]
fn read_be16(data: *const u8, offset: usize) -> u16 {
    unsafe { u16::from_be(core::ptr::read_unaligned(data.add(offset) as *const u16)) }
}

#[inline(always)]
fn read_be32(data: *const u8, offset: usize) -> u32 {
    unsafe { u32::from_be(core::ptr::read_unaligned(data.add(offset) as *const u32)) }
}

// Mirrors flowtap::extract, with explicit data_end checks for the verifier.
#[inline(always)]
fn flow_key(data: *const u8, data_end: *const u8) -> Result<FlowKey, Skip> {
    if !fits(data, data_end, hdr::ETH_HDR_LEN) {
        return Err(Skip::Truncated);
    }
    if read_be16(data, hdr::ETH_TYPE_OFFSET) != hdr::ETH_P_IPV4 {
        return Err(Skip::Unsupported);
    }

    let ip = hdr::ETH_HDR_LEN;
    if !fits(data, data_end, ip + hdr::IPV4_MIN_HDR_LEN) {
        return Err(Skip::Truncated);
    }
    let version_ihl = read_u8(data, ip);
    if version_ihl >> 4 != 4 {
        return Err(Skip::Malformed);
    }
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < hdr::IPV4_MIN_HDR_LEN {
        return Err(Skip::Malformed);
    }
    if !fits(data, data_end, ip + ihl) {
        return Err(Skip::Truncated);
    }
    if read_be16(data, ip + hdr::IPV4_FRAG_OFFSET) & hdr::IPV4_FRAG_MASK != 0 {
        return Err(Skip::Fragment);
    }

    let protocol = read_u8(data, ip + hdr::IPV4_PROTO_OFFSET);
    let src = read_be32(data, ip + hdr::IPV4_SRC_OFFSET);
    let dst = read_be32(data, ip + hdr::IPV4_DST_OFFSET);

    let l4 = ip + ihl;
    let l4_len = match protocol {
        hdr::PROTO_TCP => hdr::TCP_HDR_LEN,
        hdr::PROTO_UDP => hdr::UDP_HDR_LEN,
        _ => return Ok(FlowKey::new(src, dst, 0, 0, protocol)),
    };
    if !fits(data, data_end, l4 + l4_len) {
        return Err(Skip::Truncated);
    }

    let src_port = read_be16(data, l4);
    let dst_port = read_be16(data, l4 + 2);
    Ok(FlowKey::new(src, dst, src_port, dst_port, protocol))
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
