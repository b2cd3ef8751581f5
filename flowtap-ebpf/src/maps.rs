// Maps shared with userspace. Names must match the constants in
// flowtap_common, since the loader looks them up by name.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{HashMap, PerCpuArray};
use flowtap_common::{
    COUNTER_SLOTS, FLOW_TABLE_MAX_ENTRIES, FlowKey, FlowStats, FlowStore, InsertError,
};

/// Fixed-capacity flow table. Plain hash, not LRU: once full, new keys are
/// rejected and existing entries keep counting. Userspace may resize it
/// before load with `EbpfLoader::set_max_entries`.
#[map(name = "FLOW_TABLE")]
pub static FLOW_TABLE: HashMap<FlowKey, FlowStats> =
    HashMap::<FlowKey, FlowStats>::with_max_entries(FLOW_TABLE_MAX_ENTRIES, 0);

/// Per-CPU event counters, indexed by the `SLOT_*` constants.
#[map(name = "FLOW_COUNTERS")]
pub static FLOW_COUNTERS: PerCpuArray<u64> =
    PerCpuArray::<u64>::with_max_entries(COUNTER_SLOTS, 0);

const BPF_NOEXIST: u64 = 1;
const EEXIST: i64 = 17;

/// `FlowStore` view over `FLOW_TABLE`.
pub struct KernelFlowTable;

impl FlowStore for KernelFlowTable {
    #[inline(always)]
    fn observe(&mut self, key: &FlowKey, len: u64, now_ns: u64) -> bool {
        match FLOW_TABLE.get_ptr_mut(key) {
            // Entries are shared across CPUs; the map value is 8-byte aligned.
            Some(ptr) => {
                unsafe { FlowStats::observe_shared(ptr, len, now_ns) };
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert_new(&mut self, key: &FlowKey, stats: &FlowStats) -> Result<(), InsertError> {
        match FLOW_TABLE.insert(key, stats, BPF_NOEXIST) {
            Ok(()) => Ok(()),
            Err(code) if code == -EEXIST => Err(InsertError::Exists),
            Err(_) => Err(InsertError::Full),
        }
    }
}

#[inline(always)]
pub fn bump(slot: u32) {
    if let Some(ptr) = FLOW_COUNTERS.get_ptr_mut(slot) {
        unsafe {
            *ptr = (*ptr).wrapping_add(1);
        }
    }
}
