//! Flow accounting: the XDP-backed kernel table and its user-space twin.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{HashMap, MapData, MapError, PerCpuArray},
    programs::{Xdp, XdpFlags, xdp::XdpLinkId},
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flowtap_common::{
    COUNTER_SLOTS, FLOW_COUNTERS_MAP, FLOW_TABLE_MAP, FLOW_TABLE_MAX_ENTRIES, FlowKey, FlowStats,
    FlowUpdate, XDP_PROGRAM,
};

use crate::{
    error::FlowTableError,
    model::{FlowRecord, FlowTableCounters},
    store::BoundedFlowTable,
};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/flowtap"));

/// Where flows are accounted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowTableMode {
    /// XDP program on the interface; fails if it cannot be attached.
    Kernel,
    /// Counted in user space from the frames `poll` delivers.
    Software,
    /// Kernel, falling back to software with a warning.
    #[default]
    Auto,
    Off,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    #[default]
    Skb,
    Driver,
    Hw,
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTableConfig {
    pub mode: FlowTableMode,
    pub capacity: u32,
    pub xdp_mode: XdpMode,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            mode: FlowTableMode::default(),
            capacity: FLOW_TABLE_MAX_ENTRIES,
            xdp_mode: XdpMode::default(),
        }
    }
}

struct KernelMaps {
    flows: HashMap<MapData, FlowKey, FlowStats>,
    counters: PerCpuArray<MapData, u64>,
    capacity: u32,
}

/// The XDP flow tracker attached to one interface. Dropping it detaches the
/// program; [`FlowTable`] handles keep the maps readable afterwards.
pub struct KernelFlowTable {
    bpf: Ebpf,
    link: Option<XdpLinkId>,
    interface: String,
    maps: Arc<KernelMaps>,
}

impl KernelFlowTable {
    pub fn attach(interface: &str, capacity: u32, mode: XdpMode) -> Result<Self, FlowTableError> {
        if capacity == 0 {
            return Err(FlowTableError::ZeroCapacity);
        }
        if EBPF_BYTES.is_empty() {
            return Err(FlowTableError::Unavailable);
        }

        let mut loader = EbpfLoader::new();
        #[allow(deprecated)]
        {
            // `set_max_entries` is currently the only stable API across our Aya pin.
            loader.set_max_entries(FLOW_TABLE_MAP, capacity);
        }
        let mut bpf = loader.load(EBPF_BYTES)?;

        let flows = bpf
            .take_map(FLOW_TABLE_MAP)
            .ok_or(FlowTableError::MissingMap(FLOW_TABLE_MAP))?;
        let flows = HashMap::<_, FlowKey, FlowStats>::try_from(flows)?;
        let counters = bpf
            .take_map(FLOW_COUNTERS_MAP)
            .ok_or(FlowTableError::MissingMap(FLOW_COUNTERS_MAP))?;
        let counters = PerCpuArray::<_, u64>::try_from(counters)?;

        let program: &mut Xdp = bpf
            .program_mut(XDP_PROGRAM)
            .ok_or(FlowTableError::MissingProgram(XDP_PROGRAM))?
            .try_into()?;
        program.load()?;
        let link = program
            .attach(interface, xdp_flags(mode))
            .map_err(|source| FlowTableError::Attach {
                interface: interface.to_string(),
                source,
            })?;

        info!(%interface, capacity, ?mode, "xdp flow tracker attached");
        Ok(Self {
            bpf,
            link: Some(link),
            interface: interface.to_string(),
            maps: Arc::new(KernelMaps {
                flows,
                counters,
                capacity,
            }),
        })
    }

    pub fn table(&self) -> FlowTable {
        FlowTable {
            backend: Backend::Kernel(self.maps.clone()),
        }
    }

    pub fn detach(mut self) -> Result<(), FlowTableError> {
        self.detach_link()
    }

    fn detach_link(&mut self) -> Result<(), FlowTableError> {
        let Some(id) = self.link.take() else {
            return Ok(());
        };
        let program: &mut Xdp = self
            .bpf
            .program_mut(XDP_PROGRAM)
            .ok_or(FlowTableError::MissingProgram(XDP_PROGRAM))?
            .try_into()?;
        program.detach(id)?;
        info!(interface = %self.interface, "xdp flow tracker detached");
        Ok(())
    }
}

impl Drop for KernelFlowTable {
    fn drop(&mut self) {
        if let Err(err) = self.detach_link() {
            warn!(interface = %self.interface, error = %err, "failed to detach xdp flow tracker");
        }
    }
}

#[derive(Clone)]
enum Backend {
    Kernel(Arc<KernelMaps>),
    Software(Arc<Mutex<BoundedFlowTable>>),
}

/// Cloneable read handle onto whichever table is accounting flows.
#[derive(Clone)]
pub struct FlowTable {
    backend: Backend,
}

impl FlowTable {
    pub fn software(capacity: u32) -> Result<Self, FlowTableError> {
        let table = BoundedFlowTable::new(capacity as usize)?;
        Ok(Self {
            backend: Backend::Software(Arc::new(Mutex::new(table))),
        })
    }

    /// `"kernel"` or `"software"`.
    pub fn source(&self) -> &'static str {
        match self.backend {
            Backend::Kernel(_) => "kernel",
            Backend::Software(_) => "software",
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.backend {
            Backend::Kernel(maps) => maps.capacity as usize,
            Backend::Software(table) => lock(table).capacity(),
        }
    }

    /// Copy of the entry for `key`, or `None` if the flow was never inserted.
    pub fn query(&self, key: &FlowKey) -> Result<Option<FlowRecord>, FlowTableError> {
        match &self.backend {
            Backend::Kernel(maps) => match maps.flows.get(key, 0) {
                Ok(stats) => Ok(Some(FlowRecord::new(key, &stats))),
                Err(MapError::KeyNotFound) => Ok(None),
                Err(err) => Err(err.into()),
            },
            Backend::Software(table) => Ok(lock(table).get(key).map(|s| FlowRecord::new(key, &s))),
        }
    }

    pub fn snapshot(&self) -> Result<Vec<FlowRecord>, FlowTableError> {
        match &self.backend {
            Backend::Kernel(maps) => {
                let mut records = Vec::new();
                for item in maps.flows.iter() {
                    let (key, stats) = item?;
                    records.push(FlowRecord::new(&key, &stats));
                }
                Ok(records)
            }
            Backend::Software(table) => Ok(lock(table)
                .snapshot()
                .iter()
                .map(|(key, stats)| FlowRecord::new(key, stats))
                .collect()),
        }
    }

    pub fn counters(&self) -> Result<FlowTableCounters, FlowTableError> {
        match &self.backend {
            Backend::Kernel(maps) => {
                let mut slots = [0u64; COUNTER_SLOTS as usize];
                for (slot, total) in slots.iter_mut().enumerate() {
                    let per_cpu = maps.counters.get(&(slot as u32), 0)?;
                    *total = sum_per_cpu(per_cpu.iter());
                }
                Ok(FlowTableCounters::from_slots(&slots))
            }
            Backend::Software(table) => Ok(lock(table).counters()),
        }
    }

    /// Feed a delivered frame to the software table. The kernel table is
    /// fed by the XDP program, so this is a no-op there.
    pub(crate) fn observe(&self, key: &FlowKey, len: u64, now_ns: u64) -> Option<FlowUpdate> {
        match &self.backend {
            Backend::Kernel(_) => None,
            Backend::Software(table) => Some(lock(table).record(key, len, now_ns)),
        }
    }

    pub(crate) fn observe_skip(&self, slot: u32) {
        if let Backend::Software(table) = &self.backend {
            lock(table).bump(slot);
        }
    }
}

fn lock(table: &Mutex<BoundedFlowTable>) -> MutexGuard<'_, BoundedFlowTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sum_per_cpu<'a, I>(values: I) -> u64
where
    I: IntoIterator<Item = &'a u64>,
{
    values.into_iter().fold(0u64, |acc, v| acc.wrapping_add(*v))
}

/// Flow accounting chosen at capture start.
pub(crate) struct Tracker {
    // Attached until `FlowCapture::stop` detaches it, or until dropped.
    pub(crate) kernel: Option<KernelFlowTable>,
    pub(crate) table: Option<FlowTable>,
}

impl Tracker {
    pub(crate) fn start(interface: &str, config: &FlowTableConfig) -> Result<Self, FlowTableError> {
        let software = || -> Result<Self, FlowTableError> {
            Ok(Self {
                kernel: None,
                table: Some(FlowTable::software(config.capacity)?),
            })
        };
        match config.mode {
            FlowTableMode::Off => Ok(Self {
                kernel: None,
                table: None,
            }),
            FlowTableMode::Software => software(),
            FlowTableMode::Kernel => {
                let kernel = KernelFlowTable::attach(interface, config.capacity, config.xdp_mode)?;
                Ok(Self {
                    table: Some(kernel.table()),
                    kernel: Some(kernel),
                })
            }
            FlowTableMode::Auto => {
                match KernelFlowTable::attach(interface, config.capacity, config.xdp_mode) {
                    Ok(kernel) => Ok(Self {
                        table: Some(kernel.table()),
                        kernel: Some(kernel),
                    }),
                    Err(FlowTableError::ZeroCapacity) => Err(FlowTableError::ZeroCapacity),
                    Err(err) => {
                        warn!(%interface, error = %err, "xdp flow tracker unavailable, counting flows in user space");
                        software()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(0xc0a8_010a, 0xc0a8_0114, port, 53, 17)
    }

    #[test]
    fn sum_per_cpu_accumulates_and_wraps() {
        assert_eq!(sum_per_cpu([100u64, 50, 0].iter()), 150);
        assert_eq!(sum_per_cpu([u64::MAX, 2].iter()), 1);
    }

    #[test]
    fn software_table_query_and_snapshot() {
        let table = FlowTable::software(4).unwrap();
        assert_eq!(table.source(), "software");
        assert_eq!(table.query(&key(5000)).unwrap(), None);

        for _ in 0..3 {
            table.observe(&key(5000), 100, 7);
        }
        let record = table.query(&key(5000)).unwrap().unwrap();
        assert_eq!(record.packet_count, 3);
        assert_eq!(record.byte_count, 300);
        assert_eq!(record.key(), key(5000));
        assert_eq!(table.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn clones_share_the_software_table() {
        let table = FlowTable::software(4).unwrap();
        let reader = table.clone();
        table.observe(&key(1), 64, 1);
        table.observe_skip(flowtap_common::SLOT_SKIP_TRUNCATED);
        assert!(reader.query(&key(1)).unwrap().is_some());
        let counters = reader.counters().unwrap();
        assert_eq!(counters.inserted, 1);
        assert_eq!(counters.skipped_truncated, 1);
    }

    #[test]
    fn tracker_modes_without_kernel() {
        let off = Tracker::start("lo", &FlowTableConfig {
            mode: FlowTableMode::Off,
            ..FlowTableConfig::default()
        })
        .unwrap();
        assert!(off.table.is_none() && off.kernel.is_none());

        let software = Tracker::start("lo", &FlowTableConfig {
            mode: FlowTableMode::Software,
            capacity: 8,
            ..FlowTableConfig::default()
        })
        .unwrap();
        assert_eq!(software.table.unwrap().capacity(), 8);
    }

    #[test]
    fn zero_capacity_is_rejected_in_every_tracking_mode() {
        for mode in [FlowTableMode::Kernel, FlowTableMode::Software, FlowTableMode::Auto] {
            let config = FlowTableConfig {
                mode,
                capacity: 0,
                ..FlowTableConfig::default()
            };
            assert!(
                matches!(Tracker::start("lo", &config), Err(FlowTableError::ZeroCapacity)),
                "{mode:?}"
            );
        }
    }
}
