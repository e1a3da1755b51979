/* diosix scheduler cells
 *
 * The machine's pcpus are carved into fixed cells at boot. each
 * cell owns a set of pcpu slots, the vsmps placed on them, one
 * ready queue and one lock serializing every scheduling decision
 * inside the cell. nothing spans two cells under a single lock:
 * cross-cell moves drain the vsmp first.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::lock::Mutex;
use super::vcore::VcpuID;
use super::vsmp::Vsmp;
use super::tree::GroupID;
use super::hardware::{PcpuID, PcpuMask, CycleCount};
use super::world::WorldID;

pub type CellID = usize;

/* largest cell we'll build when the machine has no NUMA nodes to
   shape the partition */
pub const CELL_PCPUS_MAX: usize = 8;

/* one pcpu slot within a cell */
pub struct PcpuSlot
{
    pub pcpu: PcpuID,
    pub running: Option<(WorldID, VcpuID)>,
    /* accumulated idle time, and when running/idle last flipped */
    pub idle_cycles: CycleCount,
    pub last_change: CycleCount
}

impl PcpuSlot
{
    pub fn new(pcpu: PcpuID) -> PcpuSlot
    {
        PcpuSlot { pcpu, running: None, idle_cycles: 0, last_change: 0 }
    }

    pub fn is_idle(&self) -> bool { self.running.is_none() }

    /* idle time including the current idle stretch */
    pub fn idle_so_far(&self, now: CycleCount) -> CycleCount
    {
        if self.is_idle()
        {
            self.idle_cycles + now.saturating_sub(self.last_change)
        }
        else
        {
            self.idle_cycles
        }
    }

    /* the slot goes busy: bank the idle stretch */
    pub fn go_busy(&mut self, running: (WorldID, VcpuID), now: CycleCount)
    {
        if self.is_idle()
        {
            self.idle_cycles = self.idle_cycles + now.saturating_sub(self.last_change);
        }
        self.running = Some(running);
        self.last_change = now;
    }

    pub fn go_idle(&mut self, now: CycleCount)
    {
        self.running = None;
        self.last_change = now;
    }
}

/* cell counters, updated under the cell lock but readable from
   anywhere without it */
pub struct CellStats
{
    pub dispatches: AtomicU64,
    pub preemptions: AtomicU64,
    pub corun_starts: AtomicU64,
    pub costops: AtomicU64,
    pub lag_ahead: AtomicU64,
    pub lag_behind: AtomicU64,
    pub cell_migrates: AtomicU64,
    pub wakeups: AtomicU64
}

impl CellStats
{
    pub const fn new() -> CellStats
    {
        CellStats
        {
            dispatches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            corun_starts: AtomicU64::new(0),
            costops: AtomicU64::new(0),
            lag_ahead: AtomicU64::new(0),
            lag_behind: AtomicU64::new(0),
            cell_migrates: AtomicU64::new(0),
            wakeups: AtomicU64::new(0)
        }
    }

    pub fn bump(counter: &AtomicU64)
    {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/* plain-number copy of the counters for callers */
#[derive(Debug, Clone, Copy, Default)]
pub struct CellStatsSnapshot
{
    pub dispatches: u64,
    pub preemptions: u64,
    pub corun_starts: u64,
    pub costops: u64,
    pub lag_ahead: u64,
    pub lag_behind: u64,
    pub cell_migrates: u64,
    pub wakeups: u64
}

/* per-cell virtual time state of one group in the tree. created
   lazily when the first vsmp under the group lands in the cell */
#[derive(Debug, Clone, Copy)]
pub struct GroupVtime
{
    pub vt: u64,
    pub limit: u64,
    pub stride: u64,
    pub stride_limit: u64,
    /* cumulative run cycles charged to this group in this cell */
    pub run_cycles: CycleCount
}

/* everything a cell's lock protects */
pub struct CellSched
{
    pub id: CellID,
    pub slots: Vec<PcpuSlot>,
    pub vsmps: HashMap<WorldID, Vsmp>,
    /* vcores awaiting dispatch. selection is by virtual time, so
       this is scanned rather than popped in order */
    pub ready: Vec<(WorldID, VcpuID)>,
    /* the cell's global virtual time: high-water mark of dispatched
       entities, the reference point for bounded lag and rate caps */
    pub global_vt: u64,
    pub group_vt: HashMap<GroupID, GroupVtime>
}

impl CellSched
{
    pub fn new(id: CellID, pcpus: &[PcpuID]) -> CellSched
    {
        let mut slots = Vec::new();
        for pcpu in pcpus
        {
            slots.push(PcpuSlot::new(*pcpu));
        }

        CellSched
        {
            id,
            slots,
            vsmps: HashMap::new(),
            ready: Vec::new(),
            global_vt: 0,
            group_vt: HashMap::new()
        }
    }

    pub fn slot_of(&self, pcpu: PcpuID) -> Option<usize>
    {
        self.slots.iter().position(|slot| slot.pcpu == pcpu)
    }

    pub fn enqueue_ready(&mut self, world: WorldID, vcpu: VcpuID)
    {
        if !self.ready.iter().any(|entry| *entry == (world, vcpu))
        {
            self.ready.push((world, vcpu));
        }
    }

    pub fn dequeue_ready(&mut self, world: WorldID, vcpu: VcpuID)
    {
        self.ready.retain(|entry| *entry != (world, vcpu));
    }

    pub fn drop_world_from_queues(&mut self, world: WorldID)
    {
        self.ready.retain(|entry| entry.0 != world);
    }

    /* make sure a group path has virtual time entries, seeded at the
       cell's global virtual time so a fresh group neither starves nor
       monopolizes */
    pub fn ensure_group_vtimes(&mut self, strides: &[(GroupID, u64, u64)])
    {
        for (group, stride, stride_limit) in strides
        {
            let global_vt = self.global_vt;
            self.group_vt.entry(*group).or_insert(GroupVtime
            {
                vt: global_vt,
                limit: 0,
                stride: *stride,
                stride_limit: *stride_limit,
                run_cycles: 0
            });
        }
    }
}

/* a cell: its identity, pcpu mask for quick membership tests, the
   lock-protected scheduling state and the lock-free counters */
pub struct Cell
{
    pub id: CellID,
    pub pcpu_mask: PcpuMask,
    pub sched: Mutex<CellSched>,
    pub stats: CellStats
}

impl Cell
{
    pub fn stats_snapshot(&self) -> CellStatsSnapshot
    {
        CellStatsSnapshot
        {
            dispatches: self.stats.dispatches.load(Ordering::Relaxed),
            preemptions: self.stats.preemptions.load(Ordering::Relaxed),
            corun_starts: self.stats.corun_starts.load(Ordering::Relaxed),
            costops: self.stats.costops.load(Ordering::Relaxed),
            lag_ahead: self.stats.lag_ahead.load(Ordering::Relaxed),
            lag_behind: self.stats.lag_behind.load(Ordering::Relaxed),
            cell_migrates: self.stats.cell_migrates.load(Ordering::Relaxed),
            wakeups: self.stats.wakeups.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn idle_accounting_banks_stretches()
    {
        let mut slot = PcpuSlot::new(0);
        assert!(slot.is_idle());
        assert_eq!(slot.idle_so_far(100), 100);

        slot.go_busy((1, 0), 100);
        assert_eq!(slot.idle_so_far(500), 100);

        slot.go_idle(600);
        assert_eq!(slot.idle_so_far(700), 200);
    }

    #[test]
    fn ready_queue_is_a_set()
    {
        let mut cell = CellSched::new(0, &[0, 1]);
        cell.enqueue_ready(1, 0);
        cell.enqueue_ready(1, 0);
        cell.enqueue_ready(2, 0);
        assert_eq!(cell.ready.len(), 2);

        cell.drop_world_from_queues(1);
        assert_eq!(cell.ready.len(), 1);
        cell.dequeue_ready(2, 0);
        assert!(cell.ready.is_empty());
    }
}
