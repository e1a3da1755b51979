/* diosix virtual CPU scheduler
 *
 * Proportional-share virtual-time scheduler with hierarchical
 * group accounting and co-scheduling of multi-vcpu VMs. each
 * entity carries a virtual time advanced by a stride inversely
 * proportional to its shares; dispatch picks the eligible entity
 * with the smallest virtual time, descending the group tree level
 * by level. bounded lag keeps any entity's virtual time inside a
 * window around the cell's global virtual time, and a second
 * clock enforces hard max-rate ceilings independently of the
 * shares competition.
 *
 * The embedder drives everything: timer_tick() from its timer
 * interrupt, reschedule() at its context-switch points. both take
 * the calling pcpu and the current cycle count.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Once;
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::cell::{Cell, CellID, CellSched, CellStats, CellStatsSnapshot, CELL_PCPUS_MAX};
use super::vcore::{VcpuID, EventID, ActionMask, RunState, WaitReason, WakeResult};
use super::vsmp::{Vsmp, VsmpConfig, HtSharing, CoRunState, stride_for_shares, stride_for_max, COSCHED_SKEW_MS};
use super::tree::{self, GroupID, CpuAlloc, SCHED_NODE_DEPTH_MAX};
use super::hardware::{self, PcpuID, CycleCount, NodeID, NUMA_NODES_MAX};
use super::history::{self, HistoryRing, HistorySummary};
use super::fixedpoint::LoadAverages;
use super::seqcount::SeqCount;
use super::lock::{Mutex, Rank};
use super::systime;
use super::world::WorldID;

/* how long a vcpu may hold a pcpu before a mandatory scheduling
   decision */
pub const QUANTUM_MS: u64 = 50;

/* bounded lag: an entity's virtual time is kept within this many
   milliseconds-worth of its own stride either side of the cell's
   global virtual time */
const LAG_WINDOW_MS: u64 = 100;

static CELLS: Once<Vec<Cell>> = Once::new();
static PCPU_CELLS: Once<Vec<CellID>> = Once::new();
static RESCHED: Once<Vec<AtomicBool>> = Once::new();

lazy_static!
{
    /* which cell each world's vsmp lives in. consulted briefly and
       released before the cell lock is taken */
    static ref WORLD_CELLS: spin::Mutex<HashMap<WorldID, CellID>> = spin::Mutex::new(HashMap::new());

    /* per-group load history rings, fed by the sampling pass */
    static ref GROUP_HISTORY: spin::Mutex<HashMap<GroupID, HistoryRing>> = spin::Mutex::new(HashMap::new());

    /* load averages fed by the metrics timer */
    static ref LOAD_AVGS: spin::Mutex<LoadAverages> = spin::Mutex::new(LoadAverages::new());
}

/* global load metrics published through a versioned pair so
   GetLoadMetrics never takes a cell lock */
static METRICS_SEQ: SeqCount = SeqCount::new();
static METRIC_VCPUS: AtomicU64 = AtomicU64::new(0);
static METRIC_VSMPS: AtomicU64 = AtomicU64::new(0);
static METRIC_SHARES: AtomicU64 = AtomicU64::new(0);
static METRICS_WRITE: Mutex<()> = Mutex::new("load metrics writer", Rank::Timer, ());

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadMetrics
{
    pub active_vcpus: u64,
    pub active_vsmps: u64,
    pub total_base_shares: u64,
    pub averages: LoadAverages
}

/* ---- initialization ---------------------------------------------- */

/* carve the machine into scheduler cells. one cell per NUMA node
   when nodes are described, otherwise fixed-size runs of pcpus.
   call once at boot after the topology is registered */
pub fn init() -> Result<(), Cause>
{
    let topology = hardware::topology();

    let mut partitions: Vec<Vec<PcpuID>> = Vec::new();
    if topology.nodes.len() > 1
    {
        for node in topology.nodes.iter()
        {
            let mut pcpus = Vec::new();
            for pcpu in 0..topology.pcpu_count
            {
                if node.pcpus & (1 << pcpu) != 0
                {
                    pcpus.push(pcpu);
                }
            }
            partitions.push(pcpus);
        }
    }
    else
    {
        let mut pcpus: Vec<PcpuID> = (0..topology.pcpu_count).collect();
        while !pcpus.is_empty()
        {
            let take = core::cmp::min(CELL_PCPUS_MAX, pcpus.len());
            partitions.push(pcpus.drain(..take).collect());
        }
    }

    CELLS.call_once(||
    {
        let mut cells = Vec::new();
        for (id, pcpus) in partitions.iter().enumerate()
        {
            let mask = pcpus.iter().fold(0u64, |mask, pcpu| mask | (1 << pcpu));
            cells.push(Cell
            {
                id,
                pcpu_mask: mask,
                sched: Mutex::new("cpu scheduler cell", Rank::CpuschedCell, CellSched::new(id, pcpus)),
                stats: CellStats::new()
            });
        }
        cells
    });

    PCPU_CELLS.call_once(||
    {
        let mut map = Vec::new();
        map.resize(topology.pcpu_count, 0);
        for cell in cells().iter()
        {
            for pcpu in 0..topology.pcpu_count
            {
                if cell.pcpu_mask & (1 << pcpu) != 0
                {
                    map[pcpu] = cell.id;
                }
            }
        }
        map
    });

    RESCHED.call_once(||
    {
        let mut flags = Vec::new();
        for _ in 0..topology.pcpu_count
        {
            flags.push(AtomicBool::new(false));
        }
        flags
    });

    hvlog!("scheduler up: {} cells over {} pcpus", cells().len(), topology.pcpu_count);
    Ok(())
}

fn cells() -> &'static Vec<Cell>
{
    CELLS.get().expect("scheduler used before init")
}

fn cell_of_pcpu(pcpu: PcpuID) -> Option<&'static Cell>
{
    let map = PCPU_CELLS.get()?;
    cells().get(*map.get(pcpu)?)
}

fn cell_by_id(id: CellID) -> Option<&'static Cell>
{
    cells().get(id)
}

pub fn cell_count() -> usize
{
    cells().len()
}

pub fn cell_stats(id: CellID) -> Option<CellStatsSnapshot>
{
    Some(cell_by_id(id)?.stats_snapshot())
}

/* the cell covering a NUMA node. cells are built one per node on
   NUMA machines, so this is an identity map when it matters */
pub fn cell_for_node(node: NodeID) -> Option<CellID>
{
    let topology = hardware::topology();
    let spec = topology.nodes.get(node)?;
    cells().iter().find(|cell| cell.pcpu_mask & spec.pcpus != 0).map(|cell| cell.id)
}

fn world_cell(world: WorldID) -> Option<CellID>
{
    WORLD_CELLS.lock().get(&world).copied()
}

/* ---- reschedule requests ------------------------------------------ */

/* ask for a context switch at the next safe point on that pcpu.
   callable from interrupt context: it only pokes an atomic flag.
   the embedder may additionally send a cross-processor interrupt;
   a lost one is retried by the next timer tick there */
pub fn mark_reschedule(pcpu: PcpuID)
{
    if let Some(flags) = RESCHED.get()
    {
        if let Some(flag) = flags.get(pcpu)
        {
            flag.store(true, Ordering::Release);
        }
    }
}

/* true if someone asked this pcpu to reschedule. cleared by reschedule() */
pub fn reschedule_pending(pcpu: PcpuID) -> bool
{
    match RESCHED.get()
    {
        Some(flags) => flags[pcpu].load(Ordering::Acquire),
        None => false
    }
}

/* ---- world admission and removal ---------------------------------- */

/* register a world's vsmp with the scheduler.
   => world = VM's group-leader world ID
      config = the VM's shape, already joined to its group
      home = NUMA home node chosen by initial placement, or None
      running = pcpu the leader vcpu is already executing on, or
                None to start everything queued ready
      now = current cycle count
   <= Ok, or error code with nothing admitted */
pub fn add(world: WorldID, config: &VsmpConfig, home: Option<NodeID>,
    running: Option<PcpuID>, now: CycleCount) -> Result<(), Cause>
{
    if world_cell(world).is_some()
    {
        return Err(Cause::SchedWorldExists);
    }

    let (path, path_len) = tree::path_of(config.group)?;

    /* admission: the group must be able to guarantee the minimum.
       every later failure path must hand this back */
    tree::reserve_vm_cpu(config.group, config.alloc.min)?;

    let mut vsmp = match Vsmp::new(world, config, path, path_len, now)
    {
        Ok(vsmp) => vsmp,
        Err(e) =>
        {
            tree::unreserve_vm_cpu(config.group, config.alloc.min);
            return Err(e);
        }
    };
    vsmp.numa.home = home;

    /* pick the cell: the home node's cell if one was assigned, else
       the cell with the fewest vcpus that intersects the affinity */
    let affinity = vsmp.affinity_union();
    let target = match home.and_then(cell_for_node)
    {
        Some(cell) => cell,
        None =>
        {
            let mut best: Option<(CellID, usize)> = None;
            for cell in cells().iter()
            {
                if cell.pcpu_mask & affinity == 0
                {
                    continue;
                }
                let load = cell.sched.lock().vsmps.values().map(|v| v.vcpu_count()).sum::<usize>();
                match best
                {
                    Some((_, current)) if current <= load => (),
                    _ => best = Some((cell.id, load))
                }
            }
            match best
            {
                Some((id, _)) => id,
                None =>
                {
                    tree::unreserve_vm_cpu(config.group, config.alloc.min);
                    return Err(Cause::SchedBadAffinity);
                }
            }
        }
    };

    /* group virtual-time strides along the path */
    let mut strides = Vec::new();
    for at in 0..path_len
    {
        let alloc = tree::cpu_alloc_of(path[at])?;
        strides.push((path[at], stride_for_shares(alloc.shares), stride_for_max(alloc.max)));
    }

    /* the system-time sampler gets lock-free handles to the
       per-vcpu counters */
    let sys_counters = vsmp.vcores.iter().map(|vcore| vcore.sys_cycles.clone()).collect();
    systime::register_world(world, sys_counters);

    let cell = cell_by_id(target).ok_or(Cause::SchedCellBadID)?;
    {
        let mut sched = cell.sched.lock();
        sched.ensure_group_vtimes(&strides);

        /* seed the vsmp's virtual time at the cell's global virtual
           time so it joins the competition fairly, and its limit
           clock at the present so the cap starts counting from now */
        vsmp.vtime.main = sched.global_vt;
        vsmp.vtime.limit = hardware::cycles_to_ms(now) * super::vsmp::STRIDE1;

        let count = vsmp.vcpu_count();
        for vcpu in 0..count
        {
            match running
            {
                Some(pcpu) if vcpu == 0 =>
                {
                    /* the leader is already executing there */
                    let slot = match sched.slot_of(pcpu)
                    {
                        Some(slot) if sched.slots[slot].is_idle() => slot,
                        _ =>
                        {
                            systime::unregister_world(world);
                            tree::unreserve_vm_cpu(config.group, config.alloc.min);
                            return Err(Cause::SchedBadState);
                        }
                    };
                    let vcore = &mut vsmp.vcores[0];
                    vcore.set_state(RunState::Ready, now);
                    vcore.set_state(RunState::Run, now);
                    vcore.begin_charge(now, pcpu);
                    vcore.quantum_expire_at = now + hardware::ms_to_cycles(QUANTUM_MS);
                    sched.slots[slot].go_busy((world, 0), now);
                },
                _ =>
                {
                    vsmp.vcores[vcpu].set_state(RunState::Ready, now);
                    sched.enqueue_ready(world, vcpu);
                }
            }
        }
        sched.vsmps.insert(world, vsmp);
    }
    WORLD_CELLS.lock().insert(world, target);

    metrics_update(config.vcpus as i64, 1, config.alloc.shares as i64);
    hvdebug!("admitted world {} ({} vcpus) to cell {}", world, config.vcpus, target);

    /* fresh ready vcpus may beat whatever is running */
    for pcpu in 0..hardware::topology().pcpu_count
    {
        if cell_by_id(target).unwrap().pcpu_mask & (1 << pcpu) != 0
        {
            mark_reschedule(pcpu);
        }
    }
    Ok(())
}

/* take a world out of the scheduler. idempotent: the second call
   reports not-found and changes nothing.
   => world = world to remove
      now = current cycle count */
pub fn remove(world: WorldID, now: CycleCount) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let (vcpus, shares, group, min) =
    {
        let mut sched = cell.sched.lock();
        let mut vsmp = match sched.vsmps.remove(&world)
        {
            Some(vsmp) => vsmp,
            None => return Err(Cause::SchedWorldNotFound)
        };

        /* no vcpu of this world may linger in a slot or a queue */
        for slot in sched.slots.iter_mut()
        {
            if let Some((w, _)) = slot.running
            {
                if w == world
                {
                    slot.go_idle(now);
                    mark_reschedule(slot.pcpu);
                }
            }
        }
        sched.drop_world_from_queues(world);

        for vcore in vsmp.vcores.iter_mut()
        {
            vcore.set_state(RunState::Zombie, now);
            vcore.set_state(RunState::Dead, now);
        }

        (vsmp.vcpu_count(), vsmp.alloc.shares, vsmp.group, vsmp.alloc.min)
    };

    WORLD_CELLS.lock().remove(&world);
    systime::unregister_world(world);
    tree::unreserve_vm_cpu(group, min);
    metrics_update(-(vcpus as i64), -1, -(shares as i64));
    hvdebug!("removed world {} from cell {}", world, cell_id);
    Ok(())
}

/* ---- the dispatch path --------------------------------------------- */

/* context-switch decision point. the embedder calls this at a safe
   point on the given pcpu, typically after reschedule_pending() went
   true, and switches to whatever vcpu is returned.
   => pcpu = calling pcpu
      now = current cycle count
   <= vcpu to run, or None to idle */
pub fn reschedule(pcpu: PcpuID, now: CycleCount) -> Option<(WorldID, VcpuID)>
{
    let cell = cell_of_pcpu(pcpu)?;

    if let Some(flags) = RESCHED.get()
    {
        flags[pcpu].store(false, Ordering::Release);
    }

    let choice;
    let mut migrated: Vec<(Vsmp, CellID)> = Vec::new();
    {
        let mut sched = cell.sched.lock();
        let slot = sched.slot_of(pcpu)?;

        charge_current(&mut sched, &cell.stats, slot, now);
        promote_costopped(&mut sched, now);

        choice = pick_next(&mut sched, pcpu, now);
        match choice
        {
            Some((world, vcpu)) => dispatch(&mut sched, &cell.stats, pcpu, world, vcpu, now),
            None =>
            {
                let slot = sched.slot_of(pcpu).unwrap();
                sched.slots[slot].go_idle(now);
            }
        }

        extract_pending_migrations(&mut sched, &mut migrated);
    }

    /* drained cross-cell moves finish outside the source cell's lock */
    for (vsmp, target) in migrated
    {
        finish_cell_migration(vsmp, target, now);
    }

    choice
}

/* per-pcpu timer interrupt work: quantum expiry and timed-wait
   deadlines. cheap enough to run every tick */
pub fn timer_tick(pcpu: PcpuID, now: CycleCount)
{
    let cell = match cell_of_pcpu(pcpu)
    {
        Some(cell) => cell,
        None => return
    };

    let mut wake_pcpus: Vec<PcpuID> = Vec::new();
    {
        let mut sched = cell.sched.lock();

        /* quantum expiry for whatever this pcpu is running */
        if let Some(slot) = sched.slot_of(pcpu)
        {
            if let Some((world, vcpu)) = sched.slots[slot].running
            {
                if let Some(vsmp) = sched.vsmps.get(&world)
                {
                    if vsmp.vcores[vcpu].quantum_expire_at <= now
                    {
                        mark_reschedule(pcpu);
                    }
                }
            }
        }

        /* expire timed waits across the cell. only the pcpu hosting
           the cell's lowest slot does this, so one cell doesn't scan
           once per pcpu per tick */
        if sched.slots.first().map(|slot| slot.pcpu) == Some(pcpu)
        {
            let mut expired: Vec<(WorldID, VcpuID)> = Vec::new();
            for (world, vsmp) in sched.vsmps.iter_mut()
            {
                for vcore in vsmp.vcores.iter_mut()
                {
                    if let Some(deadline) = vcore.wait_deadline()
                    {
                        if deadline <= now && vcore.complete_wait(WakeResult::Timeout, now)
                        {
                            expired.push((*world, vcore.vcpu));
                        }
                    }
                }
            }
            for (world, vcpu) in expired
            {
                sched.enqueue_ready(world, vcpu);
            }
            idle_pcpus(&sched, &mut wake_pcpus);
        }
    }

    for pcpu in wake_pcpus
    {
        mark_reschedule(pcpu);
    }
}

/* deschedule the slot's current occupant: charge its run, advance
   virtual times, check skew, and requeue it if still runnable */
fn charge_current(sched: &mut CellSched, stats: &CellStats, slot: usize, now: CycleCount)
{
    let (world, vcpu) = match sched.slots[slot].running
    {
        Some(entry) => entry,
        None => return
    };
    let pcpu = sched.slots[slot].pcpu;
    let global_vt = sched.global_vt;

    let mut requeue = false;
    let mut costop_pcpus: Vec<PcpuID> = Vec::new();
    let (path, path_len, ran, ms) =
    {
        let vsmp = match sched.vsmps.get_mut(&world)
        {
            Some(vsmp) => vsmp,
            None =>
            {
                /* world died while running; the slot just goes idle */
                sched.slots[slot].go_idle(now);
                return;
            }
        };

        let ran = vsmp.vcores[vcpu].end_charge(now);
        vsmp.vcores[vcpu].handoff_pcpu = Some(pcpu);
        let ms = hardware::cycles_to_ms(ran);
        vsmp.advance_vtime(ms);

        /* bounded lag, ahead side: an entity that consumed excess is
           pulled back to the window's edge; the count records that it
           raced ahead */
        let ceiling = global_vt + vsmp.vtime.stride * LAG_WINDOW_MS;
        if vsmp.vtime.main > ceiling
        {
            vsmp.vtime.main = ceiling;
            CellStats::bump(&stats.lag_ahead);
        }

        /* intra-vsmp skew: if the gang has spread too far, stop it
           and let it regather */
        if vsmp.coscheduled() && vsmp.co_state == CoRunState::Run
            && vsmp.skew_cycles() > hardware::ms_to_cycles(COSCHED_SKEW_MS)
        {
            vsmp.co_state = CoRunState::Stop;
            vsmp.costop_count = vsmp.costop_count + 1;
            CellStats::bump(&stats.costops);
            for other in vsmp.vcores.iter()
            {
                if let Some(running_on) = other.current_pcpu
                {
                    costop_pcpus.push(running_on);
                }
            }
        }

        let state = vsmp.vcores[vcpu].state();
        if state == RunState::Run
        {
            let next = if vsmp.co_state == CoRunState::Stop
            {
                RunState::ReadyCostop
            }
            else if vsmp.strict_cosched && vsmp.co_state == CoRunState::Run
                && vsmp.running_vcpus() > 1
            {
                /* strict gangs run all-or-nothing: losing this member
                   stops the ones still on pcpus */
                vsmp.co_state = CoRunState::Stop;
                vsmp.costop_count = vsmp.costop_count + 1;
                CellStats::bump(&stats.costops);
                for other in vsmp.vcores.iter()
                {
                    if let Some(running_on) = other.current_pcpu
                    {
                        costop_pcpus.push(running_on);
                    }
                }
                RunState::ReadyCostop
            }
            else
            {
                RunState::Ready
            };
            vsmp.vcores[vcpu].set_state(next, now);
            requeue = true;
        }
        else if vsmp.coscheduled() && vsmp.co_state == CoRunState::Run
            && vsmp.runnable_vcpus() < vsmp.required_quorum()
        {
            /* a gang member blocked and the quorum is gone */
            vsmp.co_state = CoRunState::Stop;
            vsmp.costop_count = vsmp.costop_count + 1;
            CellStats::bump(&stats.costops);
            for other in vsmp.vcores.iter()
            {
                if let Some(running_on) = other.current_pcpu
                {
                    costop_pcpus.push(running_on);
                }
            }
        }

        /* a gang with nobody left on a pcpu dissolves; it regathers
           through the quorum check like anyone else */
        if vsmp.coscheduled() && vsmp.co_state == CoRunState::Run && vsmp.running_vcpus() == 0
        {
            vsmp.co_state = CoRunState::None;
        }

        (vsmp.vtime.path, vsmp.vtime.path_len, ran, ms)
    };

    /* group accounting along the path */
    for at in 0..path_len
    {
        if let Some(gvt) = sched.group_vt.get_mut(&path[at])
        {
            gvt.vt = gvt.vt + gvt.stride * ms;
            if gvt.stride_limit != 0
            {
                gvt.limit = gvt.limit + gvt.stride_limit * ms;
            }
            gvt.run_cycles = gvt.run_cycles + ran;
        }
    }

    if requeue
    {
        sched.enqueue_ready(world, vcpu);
    }
    sched.slots[slot].go_idle(now);

    for other in costop_pcpus
    {
        if other != pcpu
        {
            mark_reschedule(other);
        }
    }
}

/* costopped gangs whose last member has left a pcpu may regather */
fn promote_costopped(sched: &mut CellSched, now: CycleCount)
{
    for vsmp in sched.vsmps.values_mut()
    {
        if vsmp.co_state == CoRunState::Stop && vsmp.running_vcpus() == 0
        {
            vsmp.co_state = CoRunState::None;
            for vcore in vsmp.vcores.iter_mut()
            {
                if vcore.state() == RunState::ReadyCostop
                {
                    vcore.set_state(RunState::Ready, now);
                }
            }
        }
    }
}

/* hyperthread placement rule: running this world's vcpu on pcpu must
   not violate the preference of anything on the package mates */
fn ht_allowed(sched: &CellSched, world: WorldID, sharing: HtSharing, pcpu: PcpuID) -> bool
{
    let mates = hardware::topology().package_mates(pcpu);
    if mates == 0
    {
        return true;
    }

    for slot in sched.slots.iter()
    {
        if mates & (1 << slot.pcpu) == 0
        {
            continue;
        }
        if let Some((other_world, _)) = slot.running
        {
            let other = match sched.vsmps.get(&other_world)
            {
                Some(other) => other,
                None => continue
            };

            /* the occupant's demands */
            if other.ht_sharing == HtSharing::None
            {
                return false;
            }
            if other.ht_sharing == HtSharing::Internal && other_world != world
            {
                return false;
            }

            /* our own demands */
            if sharing == HtSharing::None
            {
                return false;
            }
            if sharing == HtSharing::Internal && other_world != world
            {
                return false;
            }
        }
    }
    true
}

/* full eligibility of a queued vcore for this pcpu */
fn vcore_eligible(sched: &CellSched, world: WorldID, vcpu: VcpuID, pcpu: PcpuID, now_ms: u64) -> bool
{
    let vsmp = match sched.vsmps.get(&world)
    {
        Some(vsmp) => vsmp,
        None => return false
    };
    let vcore = match vsmp.vcores.get(vcpu)
    {
        Some(vcore) => vcore,
        None => return false
    };

    if !vcore.is_ready()
    {
        return false;
    }
    /* draining toward another cell: stay off the pcpus so the move
       can complete */
    if vsmp.pending_cell.is_some()
    {
        return false;
    }
    if !vsmp.vcpu_allowed_on(vcpu, pcpu)
    {
        return false;
    }
    if vsmp.rate_limited(now_ms)
    {
        return false;
    }
    if !ht_allowed(sched, world, vsmp.ht_sharing, pcpu)
    {
        return false;
    }

    if vsmp.coscheduled()
    {
        match vsmp.co_state
        {
            CoRunState::Stop => return false,
            CoRunState::Run => (),
            _ =>
            {
                if vsmp.runnable_vcpus() < vsmp.required_quorum()
                {
                    return false;
                }
            }
        }
    }
    true
}

struct Candidate
{
    world: WorldID,
    vcpu: VcpuID,
    path: [GroupID; SCHED_NODE_DEPTH_MAX],
    path_len: usize,
    vt: u64,
    corun: bool,
    handoff_here: bool
}

/* choose the next vcore for this pcpu: gang completion first, then
   hierarchical smallest-virtual-time descent */
fn pick_next(sched: &mut CellSched, pcpu: PcpuID, now: CycleCount) -> Option<(WorldID, VcpuID)>
{
    let now_ms = hardware::cycles_to_ms(now);

    let mut candidates: Vec<Candidate> = Vec::new();
    for (world, vcpu) in sched.ready.iter()
    {
        if !vcore_eligible(sched, *world, *vcpu, pcpu, now_ms)
        {
            continue;
        }
        let vsmp = &sched.vsmps[world];
        candidates.push(Candidate
        {
            world: *world,
            vcpu: *vcpu,
            path: vsmp.vtime.path,
            path_len: vsmp.vtime.path_len,
            vt: vsmp.vtime.main,
            corun: vsmp.co_state == CoRunState::Run
                && vsmp.vcores[*vcpu].state() == RunState::ReadyCorun,
            handoff_here: vsmp.vcores[*vcpu].handoff_pcpu == Some(pcpu)
        });
    }

    if candidates.is_empty()
    {
        return None;
    }

    /* a gang still gathering takes precedence: its stragglers must
       reach a pcpu before skew builds */
    if let Some(member) = candidates.iter().filter(|c| c.corun).min_by_key(|c| c.vcpu)
    {
        return Some((member.world, member.vcpu));
    }

    /* descend the group tree: at each level pick the entity with the
       smallest virtual time, then narrow to its candidates */
    let mut level = 1;
    loop
    {
        #[derive(Clone, Copy, PartialEq)]
        enum Entity
        {
            Group(GroupID),
            Leaf(WorldID)
        }

        let mut best: Option<(Entity, u64)> = None;
        for candidate in candidates.iter()
        {
            let (entity, vt, limited) = if candidate.path_len > level
            {
                let group = candidate.path[level];
                match sched.group_vt.get(&group)
                {
                    Some(gvt) => (Entity::Group(group), gvt.vt,
                        gvt.stride_limit != 0 && gvt.limit > now_ms * super::vsmp::STRIDE1),
                    None => (Entity::Group(group), candidate.vt, false)
                }
            }
            else
            {
                (Entity::Leaf(candidate.world), candidate.vt, false)
            };

            if limited
            {
                continue;
            }
            match best
            {
                Some((_, best_vt)) if best_vt <= vt => (),
                _ => best = Some((entity, vt))
            }
        }

        match best
        {
            Some((Entity::Group(group), _)) =>
            {
                candidates.retain(|c| c.path_len > level && c.path[level] == group);
                level = level + 1;
                if level > SCHED_NODE_DEPTH_MAX
                {
                    hvalert!("BUG: group descent exceeded depth bound in cell {}", sched.id);
                    return None;
                }
            },
            Some((Entity::Leaf(world), _)) =>
            {
                /* within the winning vsmp prefer the vcpu that last
                   ran here, then the lowest-numbered one */
                let mut pick: Option<&Candidate> = None;
                for candidate in candidates.iter().filter(|c| c.world == world)
                {
                    pick = match pick
                    {
                        Some(current) if current.handoff_here && !candidate.handoff_here => Some(current),
                        Some(current) if current.handoff_here == candidate.handoff_here
                            && current.vcpu <= candidate.vcpu => Some(current),
                        _ => Some(candidate)
                    };
                }
                return pick.map(|c| (c.world, c.vcpu));
            },
            None => return None
        }
    }
}

/* commit a pick: state transitions, charging, gang bookkeeping */
fn dispatch(sched: &mut CellSched, stats: &CellStats, pcpu: PcpuID,
    world: WorldID, vcpu: VcpuID, now: CycleCount)
{
    sched.dequeue_ready(world, vcpu);
    let global_vt = sched.global_vt;

    let mut gang_started = false;
    let mut new_global_vt = global_vt;
    {
        let vsmp = match sched.vsmps.get_mut(&world)
        {
            Some(vsmp) => vsmp,
            None => return
        };

        /* bounded lag, behind side: a starved or freshly woken entity
           may not carry ancient virtual time into the competition */
        let floor = global_vt.saturating_sub(vsmp.vtime.stride * LAG_WINDOW_MS);
        if vsmp.vtime.main < floor
        {
            vsmp.vtime.main = floor;
            CellStats::bump(&stats.lag_behind);
        }
        new_global_vt = core::cmp::max(global_vt, vsmp.vtime.main);

        let vcore = &mut vsmp.vcores[vcpu];
        vcore.set_state(RunState::Run, now);
        vcore.begin_charge(now, pcpu);
        vcore.quantum_expire_at = now + hardware::ms_to_cycles(QUANTUM_MS);

        if vsmp.coscheduled() && vsmp.co_state != CoRunState::Run
        {
            vsmp.co_state = CoRunState::Run;
            vsmp.reset_skew();
            vsmp.corun_count = vsmp.corun_count + 1;
            CellStats::bump(&stats.corun_starts);
            gang_started = true;

            /* the rest of the gang is now gathering */
            for other in vsmp.vcores.iter_mut()
            {
                if other.state() == RunState::Ready
                {
                    other.set_state(RunState::ReadyCorun, now);
                }
            }
        }
    }
    sched.global_vt = new_global_vt;

    let slot = sched.slot_of(pcpu).unwrap();
    sched.slots[slot].go_busy((world, vcpu), now);
    CellStats::bump(&stats.dispatches);

    if gang_started
    {
        /* wave the other pcpus in to pick up the siblings */
        for slot in sched.slots.iter()
        {
            if slot.pcpu != pcpu
            {
                mark_reschedule(slot.pcpu);
            }
        }
    }
}

/* collect this cell's idle pcpus for wakeup kicks */
fn idle_pcpus(sched: &CellSched, out: &mut Vec<PcpuID>)
{
    for slot in sched.slots.iter()
    {
        if slot.is_idle()
        {
            out.push(slot.pcpu);
        }
    }
}

/* ---- blocking and waking ------------------------------------------- */

/* mark a running vcpu as blocked. the pcpu keeps charging it until
   the embedder reschedules, which it is asked to do immediately.
   => world, vcpu = the blocking vcpu
      reason = what it is blocked on
      event = event that will wake it, or None
      deadline = absolute timeout, or None
      busy = busy-wait accounting
      now = current cycle count */
pub fn wait(world: WorldID, vcpu: VcpuID, reason: WaitReason, event: Option<EventID>,
    deadline: Option<CycleCount>, busy: bool, now: CycleCount) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let resched;
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        let vcore = vsmp.vcores.get_mut(vcpu).ok_or(Cause::BadArgument)?;

        if vcore.state() != RunState::Run
        {
            return Err(Cause::SchedBadState);
        }
        vcore.begin_wait(reason, event, deadline, busy, now);
        resched = vcore.current_pcpu;
    }

    if let Some(pcpu) = resched
    {
        mark_reschedule(pcpu);
    }
    Ok(())
}

/* wait variant that atomically releases a caller-held lock once the
   vcpu is marked blocked, closing the lost-wakeup window.
   => release = closure dropping the caller's lock */
pub fn wait_release<F: FnOnce()>(world: WorldID, vcpu: VcpuID, reason: WaitReason,
    event: Option<EventID>, release: F, now: CycleCount) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let resched;
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        let vcore = vsmp.vcores.get_mut(vcpu).ok_or(Cause::BadArgument)?;

        if vcore.state() != RunState::Run
        {
            return Err(Cause::SchedBadState);
        }
        vcore.begin_wait(reason, event, None, false, now);
        resched = vcore.current_pcpu;

        /* the wait is visible before the lock drops: a wakeup racing
           in after this will find the waiter */
        release();
    }

    if let Some(pcpu) = resched
    {
        mark_reschedule(pcpu);
    }
    Ok(())
}

/* wait until one of the given action bits is posted */
pub fn wait_for_actions(world: WorldID, vcpu: VcpuID, mask: ActionMask, now: CycleCount) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let mut resched: Option<PcpuID> = None;
    let mut already = false;
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        let vcore = vsmp.vcores.get_mut(vcpu).ok_or(Cause::BadArgument)?;

        if vcore.state() != RunState::Run
        {
            return Err(Cause::SchedBadState);
        }
        vcore.set_wanted_actions(mask);
        if vcore.pending_actions() & mask != 0
        {
            /* action already posted: don't sleep at all */
            already = true;
        }
        else
        {
            vcore.begin_wait(WaitReason::Action, None, None, false, now);
            resched = vcore.current_pcpu;
        }
    }

    if already
    {
        return Ok(());
    }
    if let Some(pcpu) = resched
    {
        mark_reschedule(pcpu);
    }
    Ok(())
}

/* voluntary halt: sleeps until an interrupt (force wakeup or action)
   or the timeout */
pub fn vcpu_halt(world: WorldID, vcpu: VcpuID, deadline: Option<CycleCount>, now: CycleCount) -> Result<(), Cause>
{
    wait(world, vcpu, WaitReason::Halt, None, deadline, false, now)
}

/* wake every vcpu waiting on the given event.
   <= true if any vcpu was woken. safe from interrupt context in the
      sense that it only takes cell locks */
pub fn wakeup(event: EventID, now: CycleCount) -> bool
{
    let mut woke_any = false;
    for cell in cells().iter()
    {
        let mut wake_pcpus: Vec<PcpuID> = Vec::new();
        {
            let mut sched = cell.sched.lock();
            let mut woken: Vec<(WorldID, VcpuID)> = Vec::new();
            for (world, vsmp) in sched.vsmps.iter_mut()
            {
                for vcore in vsmp.vcores.iter_mut()
                {
                    if vcore.wait_event() == Some(event)
                        && vcore.complete_wait(WakeResult::Event, now)
                    {
                        woken.push((*world, vcore.vcpu));
                    }
                }
            }
            for (world, vcpu) in woken.iter()
            {
                sched.enqueue_ready(*world, *vcpu);
                CellStats::bump(&cell.stats.wakeups);
                woke_any = true;
            }
            if !woken.is_empty()
            {
                idle_pcpus(&sched, &mut wake_pcpus);
            }
        }
        for pcpu in wake_pcpus
        {
            mark_reschedule(pcpu);
        }
    }
    woke_any
}

/* cancel a world's waits: every waiting vcpu comes back with
   `interrupted`. idempotent */
pub fn force_wakeup(world: WorldID, now: CycleCount) -> bool
{
    let cell_id = match world_cell(world)
    {
        Some(cell) => cell,
        None => return false
    };
    let cell = match cell_by_id(cell_id)
    {
        Some(cell) => cell,
        None => return false
    };

    let mut woke_any = false;
    let mut wake_pcpus: Vec<PcpuID> = Vec::new();
    {
        let mut sched = cell.sched.lock();
        let mut woken: Vec<VcpuID> = Vec::new();
        if let Some(vsmp) = sched.vsmps.get_mut(&world)
        {
            for vcore in vsmp.vcores.iter_mut()
            {
                if vcore.complete_wait(WakeResult::Interrupted, now)
                {
                    woken.push(vcore.vcpu);
                }
            }
        }
        for vcpu in woken.iter()
        {
            sched.enqueue_ready(world, *vcpu);
            CellStats::bump(&cell.stats.wakeups);
            woke_any = true;
        }
        if !woken.is_empty()
        {
            idle_pcpus(&sched, &mut wake_pcpus);
        }
    }
    for pcpu in wake_pcpus
    {
        mark_reschedule(pcpu);
    }
    woke_any
}

/* post action bits to a vcpu, waking it if it waits for one of them.
   <= true if the vcpu was woken */
pub fn action_notify(world: WorldID, vcpu: VcpuID, bits: ActionMask, now: CycleCount) -> Result<bool, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let mut woke = false;
    let mut wake_pcpus: Vec<PcpuID> = Vec::new();
    {
        let mut sched = cell.sched.lock();
        let should_wake;
        {
            let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
            let vcore = vsmp.vcores.get_mut(vcpu).ok_or(Cause::BadArgument)?;
            should_wake = vcore.post_action(bits) && vcore.complete_wait(WakeResult::Action, now);
        }
        if should_wake
        {
            sched.enqueue_ready(world, vcpu);
            CellStats::bump(&cell.stats.wakeups);
            idle_pcpus(&sched, &mut wake_pcpus);
            woke = true;
        }
    }
    for pcpu in wake_pcpus
    {
        mark_reschedule(pcpu);
    }
    Ok(woke)
}

/* why the vcpu's last wait ended. the embedder reads this when the
   vcpu next runs; reading consumes the result */
pub fn wake_result(world: WorldID, vcpu: VcpuID) -> Result<Option<WakeResult>, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let mut sched = cell.sched.lock();
    let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
    let vcore = vsmp.vcores.get_mut(vcpu).ok_or(Cause::BadArgument)?;
    Ok(vcore.take_wake_result())
}

/* ---- runtime control ----------------------------------------------- */

/* change a vcpu's hard affinity. the mask must leave the vcpu at
   least one pcpu inside its current cell */
pub fn set_affinity(world: WorldID, vcpu: VcpuID, mask: u64, now: CycleCount) -> Result<(), Cause>
{
    let _ = now;
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let mut evict: Option<PcpuID> = None;
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        if vsmp.vcores.get(vcpu).is_none()
        {
            return Err(Cause::BadArgument);
        }

        let machine = hardware::all_pcpus_mask(hardware::topology().pcpu_count);
        let effective = mask & machine;
        if effective == 0 || effective & cell.pcpu_mask == 0
        {
            return Err(Cause::SchedBadAffinity);
        }

        let vcore = &mut vsmp.vcores[vcpu];
        vcore.affinity = effective;
        if let Some(pcpu) = vcore.current_pcpu
        {
            if effective & (1 << pcpu) == 0
            {
                evict = Some(pcpu);
            }
        }
        vsmp.recompute_joint_affinity();
    }

    if let Some(pcpu) = evict
    {
        mark_reschedule(pcpu);
    }
    Ok(())
}

/* change a world's CPU allocation at runtime. re-admits the minimum
   against the group; on failure the old allocation stands */
pub fn set_alloc(world: WorldID, alloc: CpuAlloc) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    /* reserve the new min before dropping the old one so a failure
       leaves the previous reservation intact */
    let (group, old_min, old_shares);
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        group = vsmp.group;
        old_min = vsmp.alloc.min;
        old_shares = vsmp.alloc.shares;
    }

    tree::reserve_vm_cpu(group, alloc.min)?;
    tree::unreserve_vm_cpu(group, old_min);

    {
        let mut sched = cell.sched.lock();
        match sched.vsmps.get_mut(&world)
        {
            Some(vsmp) => vsmp.set_alloc(alloc),
            None =>
            {
                /* world vanished between locks: hand the new
                   reservation back */
                tree::unreserve_vm_cpu(group, alloc.min);
                return Err(Cause::SchedWorldNotFound);
            }
        }
    }
    metrics_update(0, 0, alloc.shares as i64 - old_shares as i64);
    Ok(())
}

/* the embedder observed cache interference against a vcpu from a
   hyperthread package-mate. feeds the quarantine estimators */
pub fn note_ht_interference(world: WorldID, vcpu: VcpuID) -> Result<(), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let mut sched = cell.sched.lock();
    let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
    if vcpu >= vsmp.vcpu_count()
    {
        return Err(Cause::BadArgument);
    }
    vsmp.ht_interference(vcpu);
    Ok(())
}

/* current effective hyperthread sharing and quarantine count */
pub fn ht_quarantine_state(world: WorldID) -> Result<(HtSharing, u64), Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let sched = cell.sched.lock();
    let vsmp = sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?;
    Ok((vsmp.ht_sharing, vsmp.ht_quarantine_count))
}

/* refresh a group's strides in every cell after its allocation
   changed in the tree */
pub fn group_alloc_changed(group: GroupID)
{
    let alloc = match tree::cpu_alloc_of(group)
    {
        Ok(alloc) => alloc,
        Err(_) => return
    };
    let stride = stride_for_shares(alloc.shares);
    let stride_limit = stride_for_max(alloc.max);

    for cell in cells().iter()
    {
        let mut sched = cell.sched.lock();
        if let Some(gvt) = sched.group_vt.get_mut(&group)
        {
            gvt.stride = stride;
            gvt.stride_limit = stride_limit;
        }
    }
}

/* ---- cross-cell migration ------------------------------------------ */

/* move a quiesced world to another cell. refuses if any vcpu is on
   a pcpu; callers drain first */
pub fn cell_migrate(world: WorldID, target: CellID, now: CycleCount) -> Result<(), Cause>
{
    let source_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    if source_id == target
    {
        return Ok(());
    }
    let source = cell_by_id(source_id).ok_or(Cause::SchedWorldNotFound)?;
    if cell_by_id(target).is_none()
    {
        return Err(Cause::SchedCellBadID);
    }

    /* lift the vsmp out of the source cell, never holding two cell
       locks at once */
    let vsmp;
    {
        let mut sched = source.sched.lock();
        {
            let candidate = sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?;
            if !candidate.is_quiesced()
            {
                return Err(Cause::SchedNotQuiesced);
            }
        }
        sched.drop_world_from_queues(world);
        vsmp = sched.vsmps.remove(&world).unwrap();
    }
    CellStats::bump(&source.stats.cell_migrates);

    finish_cell_migration(vsmp, target, now);
    Ok(())
}

/* second half of a migration: settle the vsmp into its new cell */
fn finish_cell_migration(mut vsmp: Vsmp, target: CellID, now: CycleCount)
{
    let world = vsmp.leader;
    let cell = match cell_by_id(target)
    {
        Some(cell) => cell,
        None => return
    };

    /* group strides for paths this cell hasn't seen yet */
    let mut strides = Vec::new();
    for at in 0..vsmp.vtime.path_len
    {
        if let Ok(alloc) = tree::cpu_alloc_of(vsmp.vtime.path[at])
        {
            strides.push((vsmp.vtime.path[at], stride_for_shares(alloc.shares), stride_for_max(alloc.max)));
        }
    }

    vsmp.pending_cell = None;
    let mut wake_pcpus: Vec<PcpuID> = Vec::new();
    {
        let mut sched = cell.sched.lock();
        sched.ensure_group_vtimes(&strides);

        /* rebase virtual time into the new cell's frame */
        vsmp.vtime.main = sched.global_vt;
        vsmp.vtime.limit = hardware::cycles_to_ms(now) * super::vsmp::STRIDE1;

        let count = vsmp.vcpu_count();
        for vcpu in 0..count
        {
            if vsmp.vcores[vcpu].is_ready()
            {
                sched.enqueue_ready(world, vcpu);
            }
        }
        sched.vsmps.insert(world, vsmp);
        idle_pcpus(&sched, &mut wake_pcpus);
    }
    WORLD_CELLS.lock().insert(world, target);

    for pcpu in wake_pcpus
    {
        mark_reschedule(pcpu);
    }
}

/* pull out vsmps whose drained migration can now happen */
fn extract_pending_migrations(sched: &mut CellSched, out: &mut Vec<(Vsmp, CellID)>)
{
    let movable: Vec<WorldID> = sched.vsmps.iter()
        .filter(|(_, vsmp)| vsmp.pending_cell.is_some() && vsmp.is_quiesced())
        .map(|(world, _)| *world)
        .collect();

    for world in movable
    {
        sched.drop_world_from_queues(world);
        if let Some(vsmp) = sched.vsmps.remove(&world)
        {
            let target = vsmp.pending_cell.unwrap();
            out.push((vsmp, target));
        }
    }
}

/* ---- NUMA support -------------------------------------------------- */

/* everything the placement controller needs to know about one vsmp,
   captured under the cell lock */
#[derive(Debug, Clone, Copy)]
pub struct VsmpNumaSample
{
    pub world: WorldID,
    pub cell: CellID,
    pub home: Option<NodeID>,
    pub mandatory_home: Option<NodeID>,
    pub manageable: bool,
    pub vcpus: usize,
    pub shares: u32,
    pub run_cycles: CycleCount,
    pub ready_cycles: CycleCount,
    pub wait_cycles: CycleCount,
    pub just_migrated: bool,
    pub long_term: [u32; NUMA_NODES_MAX],
    pub mig_rate: u32,
    pub last_mon_mig_mask: u64
}

/* snapshot every vsmp for the rebalancer, clearing each one's
   just-migrated flag as it goes (the flag means "migrated in the
   immediately prior period") */
pub fn numa_collect(now: CycleCount) -> Vec<VsmpNumaSample>
{
    let mut samples = Vec::new();
    for cell in cells().iter()
    {
        let mut sched = cell.sched.lock();
        let id = sched.id;
        for (world, vsmp) in sched.vsmps.iter_mut()
        {
            let manageable = vsmp.numa_manageable();
            let mut run = 0;
            let mut ready = 0;
            let mut wait = 0;
            for vcore in vsmp.vcores.iter()
            {
                run = run + vcore.charged_cycles(now);
                ready = ready + vcore.ready_cycles(now);
                wait = wait + vcore.wait_cycles(now);
            }

            samples.push(VsmpNumaSample
            {
                world: *world,
                cell: id,
                home: vsmp.numa.home,
                mandatory_home: manageable.clone().flatten(),
                manageable: manageable.is_some(),
                vcpus: vsmp.vcpu_count(),
                shares: vsmp.alloc.shares,
                run_cycles: run,
                ready_cycles: ready,
                wait_cycles: wait,
                just_migrated: vsmp.numa.just_migrated,
                long_term: vsmp.numa.long_term,
                mig_rate: vsmp.numa.mig_rate,
                last_mon_mig_mask: vsmp.numa.last_mon_mig_mask
            });
            vsmp.numa.just_migrated = false;
        }
    }
    samples
}

/* cumulative idle cycles across a node's pcpus */
pub fn node_idle_cycles(node: NodeID, now: CycleCount) -> CycleCount
{
    let cell_id = match cell_for_node(node)
    {
        Some(cell) => cell,
        None => return 0
    };
    let cell = match cell_by_id(cell_id)
    {
        Some(cell) => cell,
        None => return 0
    };

    let sched = cell.sched.lock();
    sched.slots.iter().map(|slot| slot.idle_so_far(now)).sum()
}

/* assign a world's home node. moves the vsmp to the node's cell,
   draining first if it is running anywhere.
   => world = world to re-home
      node = new home node
      now = current cycle count */
pub fn set_home_node(world: WorldID, node: NodeID, now: CycleCount) -> Result<(), Cause>
{
    let target = cell_for_node(node).ok_or(Cause::NumaBadNode)?;
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;

    let mut drain_pcpus: Vec<PcpuID> = Vec::new();
    let mut move_now = false;
    {
        let mut sched = cell.sched.lock();
        let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
        vsmp.numa.home = Some(node);
        vsmp.numa.just_migrated = true;

        if cell_id == target
        {
            vsmp.pending_cell = None;
        }
        else if vsmp.is_quiesced()
        {
            move_now = true;
        }
        else
        {
            /* drain: evict its running vcpus, reschedule() finishes
               the move once the last one is off a pcpu */
            vsmp.pending_cell = Some(target);
            for vcore in vsmp.vcores.iter()
            {
                if let Some(pcpu) = vcore.current_pcpu
                {
                    drain_pcpus.push(pcpu);
                }
            }
        }
    }

    if move_now
    {
        /* quiesced: do the two-step move immediately */
        let vsmp;
        {
            let mut sched = cell.sched.lock();
            sched.drop_world_from_queues(world);
            vsmp = sched.vsmps.remove(&world);
        }
        if let Some(vsmp) = vsmp
        {
            CellStats::bump(&cell.stats.cell_migrates);
            finish_cell_migration(vsmp, target, now);
        }
    }

    for pcpu in drain_pcpus
    {
        mark_reschedule(pcpu);
    }
    Ok(())
}

/* rebalancer bookkeeping hooks */
pub fn numa_record_balance_mig(world: WorldID)
{
    with_vsmp(world, |vsmp| vsmp.numa.n_balance_mig = vsmp.numa.n_balance_mig + 1);
}

pub fn numa_record_locality_swap(world: WorldID)
{
    with_vsmp(world, |vsmp| vsmp.numa.n_locality_swap = vsmp.numa.n_locality_swap + 1);
}

pub fn numa_set_mig_rate(world: WorldID, rate: u32)
{
    with_vsmp(world, |vsmp| vsmp.numa.mig_rate = rate);
}

pub fn numa_mark_mon_mig(world: WorldID, node: NodeID)
{
    with_vsmp(world, |vsmp| vsmp.numa.last_mon_mig_mask = vsmp.numa.last_mon_mig_mask | (1 << node));
}

pub fn numa_counters(world: WorldID) -> Option<(u64, u64)>
{
    let mut counters = None;
    with_vsmp(world, |vsmp| counters = Some((vsmp.numa.n_balance_mig, vsmp.numa.n_locality_swap)));
    counters
}

pub fn home_node(world: WorldID) -> Option<NodeID>
{
    let mut home = None;
    with_vsmp(world, |vsmp| home = vsmp.numa.home);
    home
}

fn with_vsmp<F: FnMut(&mut Vsmp)>(world: WorldID, mut update: F)
{
    if let Some(cell_id) = world_cell(world)
    {
        if let Some(cell) = cell_by_id(cell_id)
        {
            let mut sched = cell.sched.lock();
            if let Some(vsmp) = sched.vsmps.get_mut(&world)
            {
                update(vsmp);
            }
        }
    }
}

/* ---- metrics and history -------------------------------------------- */

fn metrics_update(vcpus: i64, vsmps: i64, shares: i64)
{
    let guard = METRICS_WRITE.lock();
    METRICS_SEQ.begin_write();
    METRIC_VCPUS.store((METRIC_VCPUS.load(Ordering::Relaxed) as i64 + vcpus) as u64, Ordering::Relaxed);
    METRIC_VSMPS.store((METRIC_VSMPS.load(Ordering::Relaxed) as i64 + vsmps) as u64, Ordering::Relaxed);
    METRIC_SHARES.store((METRIC_SHARES.load(Ordering::Relaxed) as i64 + shares) as u64, Ordering::Relaxed);
    METRICS_SEQ.end_write();
    drop(guard);
}

/* global load metrics without touching any cell lock */
pub fn get_load_metrics() -> LoadMetrics
{
    let (vcpus, vsmps, shares) = METRICS_SEQ.read(||
        (METRIC_VCPUS.load(Ordering::Relaxed),
         METRIC_VSMPS.load(Ordering::Relaxed),
         METRIC_SHARES.load(Ordering::Relaxed)));

    LoadMetrics
    {
        active_vcpus: vcpus,
        active_vsmps: vsmps,
        total_base_shares: shares,
        averages: *LOAD_AVGS.lock()
    }
}

/* periodic load-average update: sample = vcpus currently running or
   queued ready across the machine */
pub fn load_metrics_tick(_now: CycleCount)
{
    let mut demand = 0u64;
    for cell in cells().iter()
    {
        let sched = cell.sched.lock();
        for vsmp in sched.vsmps.values()
        {
            demand = demand + vsmp.vcores.iter()
                .filter(|vcore| vcore.is_running() || vcore.is_ready())
                .count() as u64;
        }
    }
    LOAD_AVGS.lock().update(demand);
}

/* periodic load-history sampling pass: append one (run, ready)
   sample per vcpu and per group, observe NUMA residency, and decay
   the hyperthread interference estimators */
pub fn sample_load_history(now: CycleCount)
{
    let topology = hardware::topology();
    let threads = core::cmp::max(topology.threads_per_package as u64, 1);
    let index = history::index();

    let mut group_deltas: HashMap<GroupID, (u64, u64)> = HashMap::new();

    for cell in cells().iter()
    {
        let mut sched = cell.sched.lock();
        let mut per_world: Vec<(WorldID, [GroupID; SCHED_NODE_DEPTH_MAX], usize, u64, u64)> = Vec::new();

        for (world, vsmp) in sched.vsmps.iter_mut()
        {
            let mut vsmp_run = 0u64;
            let mut vsmp_ready = 0u64;
            for vcore in vsmp.vcores.iter_mut()
            {
                let run_total = vcore.charged_cycles(now);
                let ready_total = vcore.ready_cycles(now);

                /* delta since the previous sample, in milliseconds,
                   divided by the logical thread count to compensate
                   for hyperthread sharing of the package */
                let run_ms = hardware::cycles_to_ms(run_total.saturating_sub(vcore.last_sample_run)) / threads;
                let ready_ms = hardware::cycles_to_ms(ready_total.saturating_sub(vcore.last_sample_ready)) / threads;
                vcore.last_sample_run = run_total;
                vcore.last_sample_ready = ready_total;

                vcore.history.append(index, run_ms as u32, ready_ms as u32);
                vsmp_run = vsmp_run + run_ms;
                vsmp_ready = vsmp_ready + ready_ms;
            }

            /* NUMA residency: where this VM's leader vcpu sits */
            let placed = vsmp.vcores[0].current_pcpu.or(vsmp.vcores[0].handoff_pcpu);
            if let Some(pcpu) = placed
            {
                if let Some(node) = topology.node_of_pcpu(pcpu)
                {
                    vsmp.numa.observe(node);
                }
            }

            vsmp.ht_decay();
            per_world.push((*world, vsmp.vtime.path, vsmp.vtime.path_len, vsmp_run, vsmp_ready));
        }

        for (_, path, path_len, run, ready) in per_world
        {
            for at in 0..path_len
            {
                let entry = group_deltas.entry(path[at]).or_insert((0, 0));
                entry.0 = entry.0 + run;
                entry.1 = entry.1 + ready;
            }
        }
    }

    let mut rings = GROUP_HISTORY.lock();
    for (group, (run, ready)) in group_deltas
    {
        rings.entry(group).or_insert_with(HistoryRing::new).append(index, run as u32, ready as u32);
    }
    drop(rings);

    history::advance_index();
}

/* three-timescale summary of one vcpu's load history */
pub fn history_summary(world: WorldID, vcpu: VcpuID) -> Result<Option<HistorySummary>, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let index = history::index();

    let sched = cell.sched.lock();
    let vsmp = sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?;
    let vcore = vsmp.vcores.get(vcpu).ok_or(Cause::BadArgument)?;
    Ok(vcore.history.summarize(index))
}

/* three-timescale summary of one group's load history */
pub fn group_history_summary(group: GroupID) -> Option<HistorySummary>
{
    let index = history::index();
    let rings = GROUP_HISTORY.lock();
    rings.get(&group)?.summarize(index)
}

/* ---- introspection -------------------------------------------------- */

pub fn vcpu_state(world: WorldID, vcpu: VcpuID) -> Result<RunState, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let sched = cell.sched.lock();
    let vsmp = sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?;
    Ok(vsmp.vcores.get(vcpu).ok_or(Cause::BadArgument)?.state())
}

pub fn vcpu_run_cycles(world: WorldID, vcpu: VcpuID, now: CycleCount) -> Result<CycleCount, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let sched = cell.sched.lock();
    let vsmp = sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?;
    Ok(vsmp.vcores.get(vcpu).ok_or(Cause::BadArgument)?.charged_cycles(now))
}

pub fn world_cell_of(world: WorldID) -> Option<CellID>
{
    world_cell(world)
}

pub fn world_alloc(world: WorldID) -> Result<CpuAlloc, Cause>
{
    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let sched = cell.sched.lock();
    Ok(sched.vsmps.get(&world).ok_or(Cause::SchedWorldNotFound)?.alloc)
}

/* the tree moved this world to another group: refresh the vsmp's
   path and make sure the new groups have virtual time entries */
pub fn world_group_changed(world: WorldID, group: GroupID) -> Result<(), Cause>
{
    let (path, path_len) = tree::path_of(group)?;
    let mut strides = Vec::new();
    for at in 0..path_len
    {
        let alloc = tree::cpu_alloc_of(path[at])?;
        strides.push((path[at], stride_for_shares(alloc.shares), stride_for_max(alloc.max)));
    }

    let cell_id = world_cell(world).ok_or(Cause::SchedWorldNotFound)?;
    let cell = cell_by_id(cell_id).ok_or(Cause::SchedWorldNotFound)?;
    let mut sched = cell.sched.lock();
    sched.ensure_group_vtimes(&strides);
    let vsmp = sched.vsmps.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;
    vsmp.group = group;
    vsmp.vtime.path = path;
    vsmp.vtime.path_len = path_len;
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testsupport;
    use alloc::vec;

    fn vm(group: GroupID, vcpus: usize, shares: u32, max: u32) -> VsmpConfig
    {
        vm_on(group, vcpus, shares, max, !0)
    }

    fn vm_on(group: GroupID, vcpus: usize, shares: u32, max: u32, mask: u64) -> VsmpConfig
    {
        VsmpConfig
        {
            vcpus,
            affinity: vec![mask],
            ht_sharing: HtSharing::Any,
            strict_cosched: false,
            alloc: CpuAlloc::new(0, max, shares),
            group,
            is_vm: true,
            mem_affinity: None
        }
    }

    #[test]
    fn single_pcpu_fairness()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("fair");
        let now = 0;

        tree::join_group(101, group).unwrap();
        tree::join_group(102, group).unwrap();

        /* pin both VMs to pcpu 0 so they compete for one pcpu */
        add(101, &vm_on(group, 1, 1000, 0, 0b0001), None, None, now).unwrap();
        add(102, &vm_on(group, 1, 1000, 0, 0b0001), None, None, now).unwrap();

        /* drive pcpu 0 for 10 simulated seconds in quantum steps */
        let quantum = hardware::ms_to_cycles(QUANTUM_MS);
        let mut now = 0;
        for _ in 0..200
        {
            reschedule(0, now);
            now = now + quantum;
        }
        reschedule(0, now);

        let a = vcpu_run_cycles(101, 0, now).unwrap();
        let b = vcpu_run_cycles(102, 0, now).unwrap();
        let spread = if a > b { a - b } else { b - a };
        assert!(a > 0 && b > 0);
        /* equal shares: within 10% of each other */
        assert!(spread * 10 <= core::cmp::max(a, b),
            "unfair split {} vs {}", a, b);

        remove(101, now).unwrap();
        remove(102, now).unwrap();
        tree::leave_group(101).unwrap();
        tree::leave_group(102).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn remove_is_idempotent()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("remove");
        tree::join_group(111, group).unwrap();
        add(111, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        remove(111, 100).unwrap();
        assert_eq!(remove(111, 200), Err(Cause::SchedWorldNotFound));
        assert_eq!(vcpu_state(111, 0), Err(Cause::SchedWorldNotFound));

        tree::leave_group(111).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn admission_denied_on_overcommitted_group()
    {
        let _serial = testsupport::sched_up();

        /* group guarantees 100 units; a VM wanting 150 can't fit */
        let group = tree::add_group(Some("tight"), tree::lookup_name("local").unwrap(), 0,
            CpuAlloc::new(100, 0, 1000), Default::default()).unwrap();
        tree::join_group(121, group).unwrap();

        let mut config = vm(group, 1, 1000, 0);
        config.alloc.min = 150;
        assert_eq!(add(121, &config, None, None, 0), Err(Cause::AdmissionDeniedCpu));
        /* nothing was admitted */
        assert_eq!(vcpu_state(121, 0), Err(Cause::SchedWorldNotFound));

        tree::leave_group(121).unwrap();
        tree::remove_group(group).unwrap();
    }

    #[test]
    fn wait_and_wakeup_round_trip()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("waits");
        tree::join_group(131, group).unwrap();
        add(131, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        /* dispatch it, then block it on an event */
        let running = reschedule(0, 0);
        assert_eq!(running, Some((131, 0)));
        wait(131, 0, WaitReason::Io, Some(900), None, false, 100).unwrap();
        assert!(reschedule_pending(0));
        reschedule(0, 200);
        assert_eq!(vcpu_state(131, 0).unwrap(), RunState::Wait);

        /* wrong event wakes nothing; right event readies it */
        assert!(!wakeup(901, 300));
        assert!(wakeup(900, 400));
        assert_eq!(vcpu_state(131, 0).unwrap(), RunState::Ready);
        assert_eq!(wake_result(131, 0).unwrap(), Some(WakeResult::Event));

        /* a second wakeup finds nobody */
        assert!(!wakeup(900, 500));

        remove(131, 600).unwrap();
        tree::leave_group(131).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn timed_wait_expires()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("timeouts");
        tree::join_group(141, group).unwrap();
        add(141, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        assert_eq!(reschedule(0, 0), Some((141, 0)));
        wait(141, 0, WaitReason::Io, Some(77), Some(5000), false, 100).unwrap();
        reschedule(0, 200);

        /* before the deadline: still waiting */
        timer_tick(0, 4000);
        assert_eq!(vcpu_state(141, 0).unwrap(), RunState::Wait);

        /* past the deadline: woken with timeout */
        timer_tick(0, 5000);
        assert_eq!(vcpu_state(141, 0).unwrap(), RunState::Ready);
        assert_eq!(wake_result(141, 0).unwrap(), Some(WakeResult::Timeout));

        remove(141, 6000).unwrap();
        tree::leave_group(141).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn max_rate_throttles()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("capped");
        tree::join_group(151, group).unwrap();

        /* a 50% cap on an otherwise idle pcpu */
        add(151, &vm(group, 1, 1000, 50), None, None, 0).unwrap();

        let quantum = hardware::ms_to_cycles(QUANTUM_MS);
        let mut now = 0;
        for _ in 0..40
        {
            reschedule(0, now);
            now = now + quantum;
        }
        reschedule(0, now);

        let ran = vcpu_run_cycles(151, 0, now).unwrap();
        /* 40 quanta elapsed, at most ~half may be consumed (plus one
           quantum of slack for boundary effects) */
        assert!(ran <= quantum * 21, "cap exceeded: ran {} of {}", ran, quantum * 40);
        assert!(ran >= quantum * 10, "cap starved the vcpu: {}", ran);

        remove(151, now).unwrap();
        tree::leave_group(151).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn action_notify_wakes_waiter()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("actions");
        tree::join_group(161, group).unwrap();
        add(161, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        assert_eq!(reschedule(0, 0), Some((161, 0)));
        wait_for_actions(161, 0, 0b1000, 100).unwrap();
        reschedule(0, 200);
        assert_eq!(vcpu_state(161, 0).unwrap(), RunState::Wait);

        assert_eq!(action_notify(161, 0, 0b1000, 300), Ok(true));
        assert_eq!(vcpu_state(161, 0).unwrap(), RunState::Ready);
        assert_eq!(wake_result(161, 0).unwrap(), Some(WakeResult::Action));

        remove(161, 400).unwrap();
        tree::leave_group(161).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn halt_wakes_on_interrupt_or_timeout()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("halts");
        tree::join_group(181, group).unwrap();
        add(181, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        assert_eq!(reschedule(0, 0), Some((181, 0)));
        vcpu_halt(181, 0, Some(9000), 100).unwrap();
        reschedule(0, 200);
        assert_eq!(vcpu_state(181, 0).unwrap(), RunState::Wait);

        /* a forced wakeup interrupts the halt before the deadline */
        assert!(force_wakeup(181, 300));
        assert_eq!(wake_result(181, 0).unwrap(), Some(WakeResult::Interrupted));
        /* cancellation is idempotent */
        assert!(!force_wakeup(181, 400));

        /* halt again and let the deadline fire instead */
        assert_eq!(reschedule(0, 500), Some((181, 0)));
        vcpu_halt(181, 0, Some(1000), 600).unwrap();
        reschedule(0, 700);
        timer_tick(0, 1000);
        assert_eq!(wake_result(181, 0).unwrap(), Some(WakeResult::Timeout));

        remove(181, 1100).unwrap();
        tree::leave_group(181).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn wait_release_drops_caller_lock()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("release");
        tree::join_group(191, group).unwrap();
        add(191, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        assert_eq!(reschedule(0, 0), Some((191, 0)));

        let mut released = false;
        wait_release(191, 0, WaitReason::Lock, Some(333), || released = true, 100).unwrap();
        assert!(released, "caller lock not released");
        reschedule(0, 200);
        assert_eq!(vcpu_state(191, 0).unwrap(), RunState::Wait);

        assert!(wakeup(333, 300));
        remove(191, 400).unwrap();
        tree::leave_group(191).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn ht_interference_feeds_quarantine()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("quarantine");
        tree::join_group(201, group).unwrap();
        add(201, &vm(group, 1, 1000, 0), None, None, 0).unwrap();

        let (sharing, count) = ht_quarantine_state(201).unwrap();
        assert_eq!(sharing, HtSharing::Any);
        assert_eq!(count, 0);

        for _ in 0..100
        {
            note_ht_interference(201, 0).unwrap();
        }
        let (sharing, count) = ht_quarantine_state(201).unwrap();
        assert_eq!(sharing, HtSharing::Internal);
        assert_eq!(count, 1);

        remove(201, 100).unwrap();
        tree::leave_group(201).unwrap();
        testsupport::drop_group(group);
    }

    #[test]
    fn load_metrics_track_admission()
    {
        let _serial = testsupport::sched_up();
        let group = testsupport::test_group("metrics");
        tree::join_group(171, group).unwrap();

        let before = get_load_metrics();
        add(171, &vm(group, 2, 3000, 0), None, None, 0).unwrap();
        let during = get_load_metrics();
        assert_eq!(during.active_vcpus, before.active_vcpus + 2);
        assert_eq!(during.active_vsmps, before.active_vsmps + 1);
        assert_eq!(during.total_base_shares, before.total_base_shares + 3000);

        remove(171, 100).unwrap();
        let after = get_load_metrics();
        assert_eq!(after.active_vcpus, before.active_vcpus);
        assert_eq!(after.active_vsmps, before.active_vsmps);

        tree::leave_group(171).unwrap();
        testsupport::drop_group(group);
    }
}
