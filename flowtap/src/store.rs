use std::collections::HashMap;

use flowtap_common::{
    COUNTER_SLOTS, FlowKey, FlowStats, FlowStore, FlowUpdate, InsertError, record_packet,
};

use crate::{error::FlowTableError, model::FlowTableCounters};

/// User-space flow table with the kernel map's rules: fixed capacity, new
/// keys rejected once full, no eviction.
pub struct BoundedFlowTable {
    capacity: usize,
    entries: HashMap<FlowKey, FlowStats>,
    slots: [u64; COUNTER_SLOTS as usize],
}

impl BoundedFlowTable {
    pub fn new(capacity: usize) -> Result<Self, FlowTableError> {
        if capacity == 0 {
            return Err(FlowTableError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            // Grows on demand; a full-size table up front would cost ~4 MiB.
            entries: HashMap::with_capacity(capacity.min(4096)),
            slots: [0; COUNTER_SLOTS as usize],
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowStats> {
        self.entries.get(key).copied()
    }

    /// Account one packet of `len` bytes observed at `now_ns`.
    pub fn record(&mut self, key: &FlowKey, len: u64, now_ns: u64) -> FlowUpdate {
        let update = record_packet(self, key, len, now_ns);
        self.bump(update.counter_slot());
        update
    }

    pub fn bump(&mut self, slot: u32) {
        if let Some(count) = self.slots.get_mut(slot as usize) {
            *count = count.wrapping_add(1);
        }
    }

    pub fn snapshot(&self) -> Vec<(FlowKey, FlowStats)> {
        self.entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn counters(&self) -> FlowTableCounters {
        FlowTableCounters::from_slots(&self.slots)
    }
}

impl FlowStore for BoundedFlowTable {
    fn observe(&mut self, key: &FlowKey, len: u64, now_ns: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(stats) => {
                stats.observe(len, now_ns);
                true
            }
            None => false,
        }
    }

    fn insert_new(&mut self, key: &FlowKey, stats: &FlowStats) -> Result<(), InsertError> {
        if self.entries.contains_key(key) {
            return Err(InsertError::Exists);
        }
        if self.entries.len() >= self.capacity {
            return Err(InsertError::Full);
        }
        self.entries.insert(*key, *stats);
        Ok(())
    }
}
