//! Allocates the single shared-memory region backing the accept lock and
//! the worker record table (spec §4.A, §4.B, §6 layout), as one `mmap`
//! call per SPEC_FULL.md §4.B.1.

use memmap2::MmapMut;
use supervisor_proto::{AcceptLockRegion, WorkerRecord};

pub struct SharedRegion {
    mmap: MmapMut,
    slot_count: usize,
}

fn record_array_offset() -> usize {
    // Pad the lock region up to WorkerRecord's alignment (spec §6 layout:
    // "padding to sizeof(worker_record) alignment").
    let lock_size = std::mem::size_of::<AcceptLockRegion>();
    let align = std::mem::align_of::<WorkerRecord>();
    lock_size.div_ceil(align) * align
}

impl SharedRegion {
    /// Allocate, attach read-write, zero (spec §6 "Creation"). `slot_count`
    /// must already include the two reserved key-manager/ACME slots.
    pub fn allocate(slot_count: usize) -> std::io::Result<Self> {
        let record_size = std::mem::size_of::<WorkerRecord>();
        let total = record_array_offset() + slot_count * record_size;
        let mmap = MmapMut::map_anon(total)?;
        let region = Self { mmap, slot_count };
        // mmap_anon is already zero-filled by the kernel; the atomics'
        // all-zero bit pattern is their correct "free"/"empty" state.
        Ok(region)
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn lock_region(&self) -> &AcceptLockRegion {
        // SAFETY: the mapping is at least `size_of::<AcceptLockRegion>()`
        // bytes, properly aligned because it starts at a page boundary and
        // the struct's alignment is <= the page size.
        unsafe { &*(self.mmap.as_ptr() as *const AcceptLockRegion) }
    }

    pub fn record(&self, slot: usize) -> &WorkerRecord {
        assert!(slot < self.slot_count, "slot {slot} out of range");
        let base = unsafe { self.mmap.as_ptr().add(record_array_offset()) };
        let record_size = std::mem::size_of::<WorkerRecord>();
        unsafe { &*(base.add(slot * record_size) as *const WorkerRecord) }
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        (0..self.slot_count).map(move |i| self.record(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_region_is_zeroed_and_free() {
        let region = SharedRegion::allocate(5).expect("allocate");
        assert!(!region.lock_region().is_held());
        for rec in region.records() {
            assert!(!rec.running());
            assert_eq!(rec.pid(), 0);
        }
    }

    #[test]
    fn records_are_independently_addressable() {
        let region = SharedRegion::allocate(3).expect("allocate");
        region.record(0).init(supervisor_proto::WORKER_ID_KEYMGR, 0);
        region.record(1).init(supervisor_proto::WORKER_ID_ACME, 0);
        region.record(2).init(1, 0);

        assert_eq!(region.record(0).id(), supervisor_proto::WORKER_ID_KEYMGR);
        assert_eq!(region.record(1).id(), supervisor_proto::WORKER_ID_ACME);
        assert_eq!(region.record(2).id(), 1);
    }

    #[test]
    fn sized_for_cpu_count_plus_two_reserved_slots() {
        // Boundary behavior from spec §8: shared region sized
        // (cpu_count+2) * sizeof(worker_record) + sizeof(lock_region).
        let cpu_count = 4;
        let region = SharedRegion::allocate(cpu_count + 2).expect("allocate");
        assert_eq!(region.slot_count(), cpu_count + 2);
    }
}
