//! Flow key extraction from raw Ethernet frames.
//!
//! Every header read is preceded by a length check against the captured
//! bytes, which may be shorter than the frame on the wire. Anything that does
//! not yield a key is a [`SkipReason`], not an error.

use std::fmt;

use flowtap_common::{
    FlowKey, SLOT_SKIP_FRAGMENT, SLOT_SKIP_MALFORMED, SLOT_SKIP_TRUNCATED, SLOT_SKIP_UNSUPPORTED,
    hdr,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SkipReason {
    /// A header ends past the captured length.
    Truncated,
    /// Not IPv4 at L2 (IPv6, VLAN tags, ARP, ...).
    UnsupportedL2,
    /// IPv4 header with a bad version or IHL.
    Malformed,
    /// Non-first IPv4 fragment, which carries no transport header.
    Fragment,
}

impl SkipReason {
    /// Flow table counter slot for this skip, shared with the XDP program.
    pub const fn counter_slot(self) -> u32 {
        match self {
            SkipReason::Truncated => SLOT_SKIP_TRUNCATED,
            SkipReason::UnsupportedL2 => SLOT_SKIP_UNSUPPORTED,
            SkipReason::Malformed => SLOT_SKIP_MALFORMED,
            SkipReason::Fragment => SLOT_SKIP_FRAGMENT,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Truncated => "truncated",
            SkipReason::UnsupportedL2 => "unsupported_l2_proto",
            SkipReason::Malformed => "malformed",
            SkipReason::Fragment => "fragment",
        };
        f.write_str(reason)
    }
}

/// Derive the 5-tuple of an Ethernet/IPv4 frame, in host byte order.
pub fn extract(frame: &[u8]) -> Result<FlowKey, SkipReason> {
    if frame.len() < hdr::ETH_HDR_LEN {
        return Err(SkipReason::Truncated);
    }
    let ether_type = u16::from_be_bytes([
        frame[hdr::ETH_TYPE_OFFSET],
        frame[hdr::ETH_TYPE_OFFSET + 1],
    ]);
    if ether_type != hdr::ETH_P_IPV4 {
        return Err(SkipReason::UnsupportedL2);
    }
    parse_ipv4(&frame[hdr::ETH_HDR_LEN..])
}

fn parse_ipv4(packet: &[u8]) -> Result<FlowKey, SkipReason> {
    if packet.len() < hdr::IPV4_MIN_HDR_LEN {
        return Err(SkipReason::Truncated);
    }
    let version_ihl = packet[0];
    if version_ihl >> 4 != 4 {
        return Err(SkipReason::Malformed);
    }
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < hdr::IPV4_MIN_HDR_LEN {
        return Err(SkipReason::Malformed);
    }
    if packet.len() < ihl {
        return Err(SkipReason::Truncated);
    }

    let frag = be16(packet, hdr::IPV4_FRAG_OFFSET).ok_or(SkipReason::Truncated)?;
    if frag & hdr::IPV4_FRAG_MASK != 0 {
        return Err(SkipReason::Fragment);
    }

    let protocol = packet[hdr::IPV4_PROTO_OFFSET];
    let src = be32(packet, hdr::IPV4_SRC_OFFSET).ok_or(SkipReason::Truncated)?;
    let dst = be32(packet, hdr::IPV4_DST_OFFSET).ok_or(SkipReason::Truncated)?;

    let l4_len = match protocol {
        hdr::PROTO_TCP => hdr::TCP_HDR_LEN,
        hdr::PROTO_UDP => hdr::UDP_HDR_LEN,
        _ => return Ok(FlowKey::new(src, dst, 0, 0, protocol)),
    };
    let l4 = packet.get(ihl..ihl + l4_len).ok_or(SkipReason::Truncated)?;
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    Ok(FlowKey::new(src, dst, src_port, dst_port, protocol))
}

fn be16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw = bytes.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

fn be32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(raw.try_into().ok()?))
}


#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::testing::*;
    use super::*;

    #[test]
    fn tcp_frame_yields_exact_tuple() {
        let frame = tcp_frame([10, 0, 0, 1], 4444, [10, 0, 0, 2], 80);
        let key = extract(&frame).expect("tcp key");

        assert_eq!(Ipv4Addr::from(key.src_addr), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(Ipv4Addr::from(key.dst_addr), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(key.src_port, 4444);
        assert_eq!(key.dst_port, 80);
        assert_eq!(key.protocol, 6);
        assert_eq!(key.pad, [0; 3]);
    }

    #[test]
    fn udp_frame_yields_exact_tuple() {
        let frame = udp_frame([192, 168, 1, 10], 5000, [192, 168, 1, 20], 53);
        let key = extract(&frame).expect("udp key");
        assert_eq!(
            key,
            FlowKey::new(0xc0a8_010a, 0xc0a8_0114, 5000, 53, hdr::PROTO_UDP)
        );
    }

    #[test]
    fn every_prefix_shorter_than_eth_and_ipv4_is_truncated() {
        let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        for len in 0..hdr::ETH_HDR_LEN + hdr::IPV4_MIN_HDR_LEN {
            assert_eq!(
                extract(&frame[..len]),
                Err(SkipReason::Truncated),
                "prefix of {len} bytes"
            );
        }
    }

    #[test]
    fn truncated_transport_header_is_skipped() {
        let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        let cut = hdr::ETH_HDR_LEN + hdr::IPV4_MIN_HDR_LEN + hdr::TCP_HDR_LEN - 1;
        assert_eq!(extract(&frame[..cut]), Err(SkipReason::Truncated));
        assert!(extract(&frame[..cut + 1]).is_ok());
    }

    #[test]
    fn udp_needs_only_eight_bytes() {
        let frame = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        let end = hdr::ETH_HDR_LEN + hdr::IPV4_MIN_HDR_LEN + hdr::UDP_HDR_LEN;
        assert!(extract(&frame[..end]).is_ok());
        assert_eq!(extract(&frame[..end - 1]), Err(SkipReason::Truncated));
    }

    #[test]
    fn icmp_gets_zero_ports() {
        let frame = ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 9),
            hdr::PROTO_ICMP,
            &[8, 0, 0, 0],
            5,
        );
        let key = extract(&frame).unwrap();
        assert_eq!((key.src_port, key.dst_port, key.protocol), (0, 0, 1));
    }

    #[test]
    fn ip_options_shift_transport_header() {
        let frame = ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            hdr::PROTO_TCP,
            &tcp_header(4444, 80),
            6,
        );
        let key = extract(&frame).unwrap();
        assert_eq!((key.src_port, key.dst_port), (4444, 80));
    }

    #[test]
    fn ipv6_and_vlan_are_unsupported() {
        let mut frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        frame[12..14].copy_from_slice(&[0x86, 0xdd]);
        assert_eq!(extract(&frame), Err(SkipReason::UnsupportedL2));
        frame[12..14].copy_from_slice(&[0x81, 0x00]);
        assert_eq!(extract(&frame), Err(SkipReason::UnsupportedL2));
    }

    #[test]
    fn bad_version_or_ihl_is_malformed() {
        let mut frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        frame[14] = 0x65;
        assert_eq!(extract(&frame), Err(SkipReason::Malformed));
        frame[14] = 0x44;
        assert_eq!(extract(&frame), Err(SkipReason::Malformed));
    }

    #[test]
    fn ihl_longer_than_capture_is_truncated() {
        let mut frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        frame[14] = 0x4f;
        frame.truncate(hdr::ETH_HDR_LEN + 40);
        assert_eq!(extract(&frame), Err(SkipReason::Truncated));
    }

    #[test]
    fn non_first_fragment_is_skipped() {
        let mut frame = udp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        frame[14 + 6..14 + 8].copy_from_slice(&0x00b9u16.to_be_bytes());
        assert_eq!(extract(&frame), Err(SkipReason::Fragment));

        // More-fragments on the first fragment still has ports.
        frame[14 + 6..14 + 8].copy_from_slice(&0x2000u16.to_be_bytes());
        assert!(extract(&frame).is_ok());
    }

    #[test]
    fn reverse_direction_is_a_distinct_key() {
        let fwd = extract(&tcp_frame([10, 0, 0, 1], 4444, [10, 0, 0, 2], 80)).unwrap();
        let rev = extract(&tcp_frame([10, 0, 0, 2], 80, [10, 0, 0, 1], 4444)).unwrap();
        assert_ne!(fwd, rev);
    }
}
