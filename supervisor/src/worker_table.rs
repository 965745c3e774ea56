//! Process-local bookkeeping the supervisor keeps alongside the shared
//! record table: one control-channel endpoint per slot (spec §4.B, §6
//! "Control socketpair").

use std::sync::Arc;

use supervisor_proto::{ControlChannel, WorkerId};

use crate::shared_mem::SharedRegion;

/// Everything the supervisor needs to know about one slot that isn't in
/// the shared record: the parent's end of the control socketpair, and
/// whether that end has already been closed (spec §5: "the parent closes
/// its end of a slot's pair when that slot's pid is permanently gone").
pub struct SlotHandle {
    pub id: WorkerId,
    pub cpu: i32,
    pub channel: Option<ControlChannel>,
}

pub struct WorkerTable {
    region: Arc<SharedRegion>,
    slots: Vec<SlotHandle>,
}

impl WorkerTable {
    /// `ids_and_cpus` must already include the two reserved slots and be in
    /// slot order (spec §4.B: "fixed-length contiguous array ... lookups by
    /// slot index are O(1)").
    pub fn new(region: Arc<SharedRegion>, ids_and_cpus: &[(WorkerId, i32)]) -> Self {
        assert_eq!(region.slot_count(), ids_and_cpus.len());
        let slots = ids_and_cpus
            .iter()
            .enumerate()
            .map(|(i, &(id, cpu))| {
                region.record(i).init(id, cpu);
                SlotHandle {
                    id,
                    cpu,
                    channel: None,
                }
            })
            .collect();
        Self { region, slots }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index_of(&self, id: WorkerId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    pub fn slot_index_of_pid(&self, pid: i32) -> Option<usize> {
        (0..self.slots.len()).find(|&i| self.region.record(i).pid() == pid)
    }

    pub fn record(&self, slot: usize) -> &supervisor_proto::WorkerRecord {
        self.region.record(slot)
    }

    pub fn lock_region(&self) -> &supervisor_proto::AcceptLockRegion {
        self.region.lock_region()
    }

    pub fn set_channel(&mut self, slot: usize, channel: ControlChannel) {
        self.slots[slot].channel = Some(channel);
    }

    pub fn channel(&self, slot: usize) -> Option<&ControlChannel> {
        self.slots[slot].channel.as_ref()
    }

    pub fn channel_mut(&mut self, slot: usize) -> Option<&mut ControlChannel> {
        self.slots[slot].channel.as_mut()
    }

    /// Every slot that currently has an open channel, for the supervisor's
    /// poll-based relay loop.
    pub fn open_channels_mut(&mut self) -> impl Iterator<Item = (usize, &mut ControlChannel)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.channel.as_mut().map(|c| (i, c)))
    }

    /// Close and drop the parent's end once the slot's pid is permanently
    /// gone (not being restarted), per spec §5.
    pub fn close_channel(&mut self, slot: usize) {
        self.slots[slot].channel = None;
    }

    pub fn slot(&self, slot: usize) -> &SlotHandle {
        &self.slots[slot]
    }

    pub fn all_pids(&self) -> Vec<i32> {
        (0..self.slots.len())
            .map(|i| self.region.record(i).pid())
            .filter(|&pid| pid != 0)
            .collect()
    }

    /// True once every slot reports `running=false` (spec §3 lifecycle: the
    /// shared region is unlinked only after this holds).
    pub fn all_stopped(&self) -> bool {
        (0..self.slots.len()).all(|i| !self.region.record(i).running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_mem::SharedRegion;
    use supervisor_proto::{WORKER_ID_ACME, WORKER_ID_KEYMGR};

    fn make_table(n_network: usize) -> WorkerTable {
        let region = Arc::new(SharedRegion::allocate(n_network + 2).unwrap());
        let mut ids = vec![(WORKER_ID_KEYMGR, 0), (WORKER_ID_ACME, 0)];
        ids.extend((1..=n_network as i32).map(|id| (id, (id - 1) % 4)));
        WorkerTable::new(region, &ids)
    }

    #[test]
    fn slot_lookup_by_id_and_pid() {
        let mut table = make_table(4);
        table.record(2).set_pid(999);
        assert_eq!(table.slot_index_of(WORKER_ID_KEYMGR), Some(0));
        assert_eq!(table.slot_index_of(WORKER_ID_ACME), Some(1));
        assert_eq!(table.slot_index_of(2), Some(3));
        assert_eq!(table.slot_index_of_pid(999), Some(2));
        assert_eq!(table.slot_index_of_pid(12345), None);
    }

    #[test]
    fn ids_and_cpus_are_stable_across_a_simulated_restart() {
        let table = make_table(2);
        let slot = table.slot_index_of(1).unwrap();
        let cpu_before = table.slot(slot).cpu;

        table.record(slot).set_pid(111);
        table.record(slot).set_running(true);
        // crash + restart of the same slot
        table.record(slot).set_running(false);
        table.record(slot).set_restarted(true);
        table.record(slot).set_pid(222);
        table.record(slot).set_running(true);

        assert_eq!(table.record(slot).id(), 1);
        assert_eq!(table.slot(slot).cpu, cpu_before);
    }
}
