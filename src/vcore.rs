/* diosix scheduler virtual CPU state
 *
 * Per-vCPU record: the run-state machine, wait bookkeeping,
 * charge-cycle accounting and per-state meters. a vcore is owned
 * by exactly one vsmp and all mutation happens under the owning
 * cell's lock. the charge counters are additionally published
 * through versioned pairs so remote readers can snapshot them
 * without that lock.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use alloc::sync::Arc;
use alloc::vec::Vec;
use super::seqcount::SeqCount;
use super::history::HistoryRing;
use super::lock::{Mutex, Rank};
use super::hardware::{self, PcpuID, PcpuMask, CycleCount};
use super::world::WorldID;

/* a vcore's ID within its vsmp */
pub type VcpuID = usize;

/* events vcpus wait on and wake by. allocated by the embedder,
   opaque to the scheduler */
pub type EventID = u64;

/* bits in the action-wakeup mask */
pub type ActionMask = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState
{
    New = 0,
    Zombie,
    Run,
    Ready,
    ReadyCorun,
    ReadyCostop,
    Wait,
    BusyWait,
    Dead
}

pub const RUN_STATES: usize = RunState::Dead as usize + 1;

/* what a waiting vcpu is waiting for */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason
{
    Io,
    Lock,
    Memory,
    SwapSlots,
    Debugger,
    Halt,
    Action
}

/* why a waiting vcpu came back */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult
{
    Event,
    Timeout,
    Interrupted,
    Action
}

/* per-state meter: stay count, total cycles in state, and a
   log2-bucketed histogram of stay lengths in milliseconds */
pub const METER_BUCKETS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct StateMeter
{
    pub count: u64,
    pub elapsed_cycles: CycleCount,
    pub histogram: [u64; METER_BUCKETS]
}

impl StateMeter
{
    const fn new() -> StateMeter
    {
        StateMeter { count: 0, elapsed_cycles: 0, histogram: [0; METER_BUCKETS] }
    }

    fn record_stay(&mut self, cycles: CycleCount)
    {
        self.elapsed_cycles = self.elapsed_cycles + cycles;
        let ms = hardware::cycles_to_ms(cycles);
        let bucket = core::cmp::min((64 - ms.leading_zeros()) as usize, METER_BUCKETS - 1);
        self.histogram[bucket] = self.histogram[bucket] + 1;
    }
}

/* action-wakeup mask, guarded by its own lock so notify can pair
   with the waiter's sleep decision */
struct ActionWakeup
{
    wanted: ActionMask,
    pending: ActionMask
}

pub struct Vcore
{
    pub world: WorldID,
    pub vcpu: VcpuID,

    state: RunState,
    state_entered_at: CycleCount,
    meters: [StateMeter; RUN_STATES],

    /* wait bookkeeping */
    wait_reason: Option<WaitReason>,
    wait_event: Option<EventID>,
    wait_deadline: Option<CycleCount>,
    wake_result: Option<WakeResult>,

    /* placement */
    pub affinity: PcpuMask,
    pub current_pcpu: Option<PcpuID>,
    pub handoff_pcpu: Option<PcpuID>,

    /* charge-cycle accounting: two independent versioned pairs.
       run_cycles is the authoritative copy under the cell lock */
    pub run_cycles: CycleCount,
    charge_start_seq: SeqCount,
    charge_start: AtomicU64,
    charge_total_seq: SeqCount,
    charge_total: AtomicU64,

    /* per-pcpu run time */
    pub run_per_pcpu: Vec<CycleCount>,

    /* interrupt/kernel time attributed by the system-time sampler.
       shared with the sampler registry so it can be bumped with no lock */
    pub sys_cycles: Arc<AtomicU64>,

    /* run cycles since this vcore last co-started, for skew tracking */
    pub corun_cycles: CycleCount,

    /* hyperthread interference events with fast and slow decay */
    pub ht_events_fast: u64,
    pub ht_events_slow: u64,

    action: Mutex<ActionWakeup>,

    pub quantum_expire_at: CycleCount,

    pub history: HistoryRing,
    pub last_sample_run: CycleCount,
    pub last_sample_ready: CycleCount
}

impl Vcore
{
    pub fn new(world: WorldID, vcpu: VcpuID, affinity: PcpuMask, now: CycleCount) -> Vcore
    {
        let pcpus = hardware::topology().pcpu_count;
        let mut run_per_pcpu = Vec::new();
        run_per_pcpu.resize(pcpus, 0);

        Vcore
        {
            world,
            vcpu,
            state: RunState::New,
            state_entered_at: now,
            meters: [StateMeter::new(); RUN_STATES],
            wait_reason: None,
            wait_event: None,
            wait_deadline: None,
            wake_result: None,
            affinity,
            current_pcpu: None,
            handoff_pcpu: None,
            run_cycles: 0,
            charge_start_seq: SeqCount::new(),
            charge_start: AtomicU64::new(0),
            charge_total_seq: SeqCount::new(),
            charge_total: AtomicU64::new(0),
            run_per_pcpu,
            sys_cycles: Arc::new(AtomicU64::new(0)),
            corun_cycles: 0,
            ht_events_fast: 0,
            ht_events_slow: 0,
            action: Mutex::new("vcpu action wakeup", Rank::VcpuAction, ActionWakeup { wanted: 0, pending: 0 }),
            quantum_expire_at: 0,
            history: HistoryRing::new(),
            last_sample_run: 0,
            last_sample_ready: 0
        }
    }

    pub fn state(&self) -> RunState { self.state }

    pub fn meter(&self, state: RunState) -> &StateMeter { &self.meters[state as usize] }

    /* move to a new run state, metering the stay in the old one */
    pub fn set_state(&mut self, new: RunState, now: CycleCount)
    {
        if new == self.state
        {
            return;
        }

        let stay = now.saturating_sub(self.state_entered_at);
        self.meters[self.state as usize].record_stay(stay);
        self.meters[new as usize].count = self.meters[new as usize].count + 1;
        self.state = new;
        self.state_entered_at = now;

        if new != RunState::Wait && new != RunState::BusyWait
        {
            self.wait_reason = None;
            self.wait_event = None;
            self.wait_deadline = None;
        }
    }

    /* true if this vcore is in one of the queued, runnable states */
    pub fn is_ready(&self) -> bool
    {
        match self.state
        {
            RunState::Ready | RunState::ReadyCorun | RunState::ReadyCostop => true,
            _ => false
        }
    }

    pub fn is_running(&self) -> bool { self.state == RunState::Run }

    /* ---- waiting --------------------------------------------------- */

    /* mark this vcore waiting on an event.
       => reason = what the vcore is blocked on
          event = event to wake on, or None for timeout/action-only sleeps
          deadline = absolute cycle count to time out at, or None
          busy = true for busy-wait accounting
          now = current cycle count */
    pub fn begin_wait(&mut self, reason: WaitReason, event: Option<EventID>,
        deadline: Option<CycleCount>, busy: bool, now: CycleCount)
    {
        self.set_state(if busy { RunState::BusyWait } else { RunState::Wait }, now);
        self.wait_reason = Some(reason);
        self.wait_event = event;
        self.wait_deadline = deadline;
        self.wake_result = None;
    }

    pub fn wait_reason(&self) -> Option<WaitReason> { self.wait_reason }
    pub fn wait_event(&self) -> Option<EventID> { self.wait_event }
    pub fn wait_deadline(&self) -> Option<CycleCount> { self.wait_deadline }

    pub fn is_waiting(&self) -> bool
    {
        self.state == RunState::Wait || self.state == RunState::BusyWait
    }

    /* complete a wait: back to ready with the given result.
       a wake after the waiter already transitioned is a no-op,
       which is what makes cancellation idempotent */
    pub fn complete_wait(&mut self, result: WakeResult, now: CycleCount) -> bool
    {
        if !self.is_waiting()
        {
            return false;
        }
        self.wake_result = Some(result);
        self.set_state(RunState::Ready, now);
        true
    }

    /* why the last wait ended. reading consumes the result */
    pub fn take_wake_result(&mut self) -> Option<WakeResult>
    {
        self.wake_result.take()
    }

    /* ---- action wakeups -------------------------------------------- */

    /* declare which action bits a coming wait cares about */
    pub fn set_wanted_actions(&mut self, mask: ActionMask)
    {
        self.action.lock().wanted = mask;
    }

    /* post an action. returns true if the vcore was waiting for it
       and should be made ready by the caller */
    pub fn post_action(&mut self, bits: ActionMask) -> bool
    {
        let mut action = self.action.lock();
        action.pending = action.pending | bits;
        self.wait_reason == Some(WaitReason::Action) && action.pending & action.wanted != 0
    }

    /* collect and clear pending action bits that were waited for */
    pub fn take_actions(&mut self) -> ActionMask
    {
        let mut action = self.action.lock();
        let taken = action.pending & action.wanted;
        action.pending = action.pending & !taken;
        taken
    }

    pub fn pending_actions(&self) -> ActionMask
    {
        self.action.lock().pending
    }

    /* ---- charge accounting ----------------------------------------- */

    /* dispatch: stamp the charge start. single writer, under the cell lock */
    pub fn begin_charge(&mut self, now: CycleCount, pcpu: PcpuID)
    {
        self.charge_start_seq.begin_write();
        self.charge_start.store(now, Ordering::Relaxed);
        self.charge_start_seq.end_write();
        self.current_pcpu = Some(pcpu);
    }

    /* deschedule: fold the run into the totals.
       <= cycles charged for this run */
    pub fn end_charge(&mut self, now: CycleCount) -> CycleCount
    {
        let started = self.charge_start.load(Ordering::Relaxed);
        let ran = now.saturating_sub(started);

        self.run_cycles = self.run_cycles + ran;
        self.corun_cycles = self.corun_cycles + ran;
        if let Some(pcpu) = self.current_pcpu
        {
            self.run_per_pcpu[pcpu] = self.run_per_pcpu[pcpu] + ran;
        }
        self.current_pcpu = None;

        self.charge_total_seq.begin_write();
        self.charge_total.store(self.run_cycles, Ordering::Relaxed);
        self.charge_total_seq.end_write();
        ran
    }

    /* lock-free reader: cumulative run cycles including the current
       run if the vcore is on a pcpu right now */
    pub fn charged_cycles(&self, now: CycleCount) -> CycleCount
    {
        let total = self.charge_total_seq.read(|| self.charge_total.load(Ordering::Relaxed));
        let started = self.charge_start_seq.read(|| self.charge_start.load(Ordering::Relaxed));

        if self.state == RunState::Run && now > started
        {
            total + (now - started)
        }
        else
        {
            total
        }
    }

    /* cycles spent queued ready (all three ready flavours), including
       the current stay */
    pub fn ready_cycles(&self, now: CycleCount) -> CycleCount
    {
        let mut total = self.meters[RunState::Ready as usize].elapsed_cycles
            + self.meters[RunState::ReadyCorun as usize].elapsed_cycles
            + self.meters[RunState::ReadyCostop as usize].elapsed_cycles;
        if self.is_ready()
        {
            total = total + now.saturating_sub(self.state_entered_at);
        }
        total
    }

    /* cycles spent blocked, including the current stay */
    pub fn wait_cycles(&self, now: CycleCount) -> CycleCount
    {
        let mut total = self.meters[RunState::Wait as usize].elapsed_cycles
            + self.meters[RunState::BusyWait as usize].elapsed_cycles;
        if self.is_waiting()
        {
            total = total + now.saturating_sub(self.state_entered_at);
        }
        total
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testsupport;

    #[test]
    fn state_machine_meters_stays()
    {
        testsupport::tiny_machine();
        let mut vcore = Vcore::new(1, 0, !0, 0);
        assert_eq!(vcore.state(), RunState::New);

        vcore.set_state(RunState::Ready, 1000);
        vcore.set_state(RunState::Run, 3000);
        vcore.set_state(RunState::Ready, 8000);

        /* one completed stay in ready of 2000 cycles, one in run of 5000 */
        assert_eq!(vcore.meter(RunState::Run).count, 1);
        assert_eq!(vcore.meter(RunState::Run).elapsed_cycles, 5000);
        assert_eq!(vcore.meter(RunState::Ready).elapsed_cycles, 2000);
        assert_eq!(vcore.meter(RunState::Ready).count, 2);
    }

    #[test]
    fn charge_pairs_snapshot_current_run()
    {
        testsupport::tiny_machine();
        let mut vcore = Vcore::new(1, 0, !0, 0);

        vcore.set_state(RunState::Run, 100);
        vcore.begin_charge(100, 0);
        assert_eq!(vcore.charged_cycles(600), 500);

        vcore.set_state(RunState::Ready, 1100);
        let ran = vcore.end_charge(1100);
        assert_eq!(ran, 1000);
        assert_eq!(vcore.charged_cycles(9999), 1000);
        assert_eq!(vcore.run_per_pcpu[0], 1000);
    }

    #[test]
    fn waits_complete_once()
    {
        testsupport::tiny_machine();
        let mut vcore = Vcore::new(1, 0, !0, 0);
        vcore.set_state(RunState::Run, 0);

        vcore.begin_wait(WaitReason::Io, Some(55), None, false, 10);
        assert!(vcore.is_waiting());
        assert_eq!(vcore.wait_event(), Some(55));

        assert!(vcore.complete_wait(WakeResult::Event, 20));
        /* second wake is a no-op */
        assert!(!vcore.complete_wait(WakeResult::Interrupted, 30));
        assert_eq!(vcore.take_wake_result(), Some(WakeResult::Event));
        assert_eq!(vcore.take_wake_result(), None);
    }

    #[test]
    fn action_bits_wake_action_waiters_only()
    {
        testsupport::tiny_machine();
        let mut vcore = Vcore::new(1, 0, !0, 0);
        vcore.set_state(RunState::Run, 0);

        vcore.set_wanted_actions(0b0110);
        vcore.begin_wait(WaitReason::Action, None, None, false, 10);

        /* a bit outside the wanted mask leaves the vcore asleep */
        assert!(!vcore.post_action(0b0001));
        /* a wanted bit wakes it */
        assert!(vcore.post_action(0b0100));
        assert!(vcore.complete_wait(WakeResult::Action, 20));
        assert_eq!(vcore.take_actions(), 0b0100);
        /* the unwanted bit stays pending */
        assert_eq!(vcore.pending_actions(), 0b0001);
    }
}
