use std::{fmt, net::Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use flowtap_common::{
    COUNTER_SLOTS, FlowKey, FlowStats, L7_DNS, L7_HTTP, L7_SSH, L7_TLS, SLOT_INSERTED,
    SLOT_REJECTED_FULL, SLOT_SKIP_FRAGMENT, SLOT_SKIP_MALFORMED, SLOT_SKIP_TRUNCATED,
    SLOT_SKIP_UNSUPPORTED, SLOT_UPDATED,
};

/// Coarse application hint derived from well-known ports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum L7Protocol {
    Unknown,
    Dns,
    Http,
    Tls,
    Ssh,
}

impl From<u32> for L7Protocol {
    fn from(tag: u32) -> Self {
        match tag {
            L7_DNS => L7Protocol::Dns,
            L7_HTTP => L7Protocol::Http,
            L7_TLS => L7Protocol::Tls,
            L7_SSH => L7Protocol::Ssh,
            _ => L7Protocol::Unknown,
        }
    }
}

impl fmt::Display for L7Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            L7Protocol::Unknown => "unknown",
            L7Protocol::Dns => "dns",
            L7Protocol::Http => "http",
            L7Protocol::Tls => "tls",
            L7Protocol::Ssh => "ssh",
        };
        f.write_str(name)
    }
}

/// One flow table entry in export form. Values are host order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FlowRecord {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub packet_count: u64,
    pub byte_count: u64,
    pub l7: L7Protocol,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
}

impl FlowRecord {
    pub fn new(key: &FlowKey, stats: &FlowStats) -> Self {
        Self {
            src_addr: Ipv4Addr::from(key.src_addr),
            dst_addr: Ipv4Addr::from(key.dst_addr),
            src_port: key.src_port,
            dst_port: key.dst_port,
            protocol: key.protocol,
            packet_count: stats.packet_count,
            byte_count: stats.byte_count,
            l7: L7Protocol::from(stats.l7_tag),
            first_seen_ns: stats.first_seen_ns,
            last_seen_ns: stats.last_seen_ns,
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(
            u32::from(self.src_addr),
            u32::from(self.dst_addr),
            self.src_port,
            self.dst_port,
            self.protocol,
        )
    }

    fn tuple(&self) -> (Ipv4Addr, Ipv4Addr, u16, u16, u8) {
        (self.src_addr, self.dst_addr, self.src_port, self.dst_port, self.protocol)
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto:{} packets:{} bytes:{} l7:{}",
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.protocol,
            self.packet_count,
            self.byte_count,
            self.l7
        )
    }
}

/// Flow table event counters, summed across CPUs for the kernel table.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FlowTableCounters {
    pub inserted: u64,
    pub updated: u64,
    pub rejected_full: u64,
    pub skipped_truncated: u64,
    pub skipped_unsupported: u64,
    pub skipped_malformed: u64,
    pub skipped_fragment: u64,
}

impl FlowTableCounters {
    pub fn from_slots(slots: &[u64; COUNTER_SLOTS as usize]) -> Self {
        let slot = |idx: u32| slots[idx as usize];
        Self {
            inserted: slot(SLOT_INSERTED),
            updated: slot(SLOT_UPDATED),
            rejected_full: slot(SLOT_REJECTED_FULL),
            skipped_truncated: slot(SLOT_SKIP_TRUNCATED),
            skipped_unsupported: slot(SLOT_SKIP_UNSUPPORTED),
            skipped_malformed: slot(SLOT_SKIP_MALFORMED),
            skipped_fragment: slot(SLOT_SKIP_FRAGMENT),
        }
    }
}

/// JSON document written by `flowtap flows`.
#[derive(Clone, Debug, Serialize)]
pub struct FlowDump {
    pub interface: String,
    pub captured_at: String,
    pub source: &'static str,
    pub counters: FlowTableCounters,
    pub flows: Vec<FlowRecord>,
}

impl FlowDump {
    pub fn new(
        interface: &str,
        at: DateTime<Utc>,
        source: &'static str,
        counters: FlowTableCounters,
        mut flows: Vec<FlowRecord>,
    ) -> Self {
        flows.sort_by(|a, b| {
            b.byte_count
                .cmp(&a.byte_count)
                .then_with(|| a.tuple().cmp(&b.tuple()))
        });
        Self {
            interface: interface.to_string(),
            captured_at: at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            source,
            counters,
            flows,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(bytes: u64, sport: u16) -> FlowRecord {
        let key = FlowKey::new(0x0a00_0001, 0x0a00_0002, sport, 443, 6);
        let mut stats = FlowStats::first_packet(&key, bytes, 10);
        stats.observe(0, 25);
        FlowRecord::new(&key, &stats)
    }

    #[test]
    fn record_converts_addresses_and_tag() {
        let rec = record(100, 4444);
        assert_eq!(rec.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(rec.l7, L7Protocol::Tls);
        assert_eq!(rec.packet_count, 2);
        assert_eq!(rec.last_seen_ns - rec.first_seen_ns, 15);
        assert_eq!(rec.key(), FlowKey::new(0x0a00_0001, 0x0a00_0002, 4444, 443, 6));
        assert_eq!(rec.to_string(), "10.0.0.1:4444 -> 10.0.0.2:443 proto:6 packets:2 bytes:100 l7:tls");
    }

    #[test]
    fn record_serializes_flat() {
        let json = serde_json::to_value(record(64, 1)).unwrap();
        assert_eq!(json["src_addr"], "10.0.0.1");
        assert_eq!(json["dst_port"], 443);
        assert_eq!(json["l7"], "tls");
        assert_eq!(json["byte_count"], 64);
    }

    #[test]
    fn dump_orders_heaviest_flows_first() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let dump = FlowDump::new(
            "eth0",
            at,
            "software",
            FlowTableCounters::default(),
            vec![record(10, 1), record(500, 2), record(10, 0)],
        );
        assert_eq!(dump.captured_at, "2024-05-01T12:00:00Z");
        let ports: Vec<u16> = dump.flows.iter().map(|f| f.src_port).collect();
        assert_eq!(ports, vec![2, 0, 1]);
    }

    #[test]
    fn counters_map_slots_by_index() {
        let counters = FlowTableCounters::from_slots(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(counters.inserted, 1);
        assert_eq!(counters.rejected_full, 3);
        assert_eq!(counters.skipped_fragment, 7);
    }
}
