/* diosix NUMA placement controller
 *
 * On machines with more than one memory node, every manageable VM
 * gets a home node. a periodic pass reconciles fairness with
 * locality: compute what each VM was entitled to against what it
 * received, migrate a VM from the most under-served node to the
 * most over-served one when the imbalance is worth it, or swap the
 * homes of two VMs whose pages mostly live on each other's nodes.
 * the pass also steers the external page-migration rate and asks
 * the VMM to migrate page mappings toward a stable home.
 *
 * one lock protects the snapshot and thresholds; it ranks below
 * the cell locks, which the home-node changes take internally.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::lock::{Mutex, Rank};
use super::config::{self, Tunable};
use super::timer::{self, TimerID};
use super::scheduler::{self, VsmpNumaSample};
use super::hardware::{self, CycleCount, NodeID, NUMA_NODES_MAX};
use super::world::WorldID;

/* a VM already holding at least this many pages on some node is
   placed there at start rather than by policy */
pub const MIN_INITIALNODE_PAGES: u64 = 1024;

/* page-migration rate policy. a VM's rate is taken from the last
   row whose predicate it does NOT satisfy. rows run from cautious
   to aggressive */
struct MigRateRow
{
    free_page_thresh: u32,      /* node free memory, percent */
    pct_local_thresh: u32,      /* pages already local, percent */
    node_history_thresh: u32,   /* long-term home residency */
    rate: u32
}

const MIG_RATE_TABLE: [MigRateRow; 4] =
[
    MigRateRow { free_page_thresh: 5,  pct_local_thresh: 95, node_history_thresh: 4,  rate: 0 },
    MigRateRow { free_page_thresh: 10, pct_local_thresh: 90, node_history_thresh: 8,  rate: 50 },
    MigRateRow { free_page_thresh: 20, pct_local_thresh: 80, node_history_thresh: 16, rate: 100 },
    MigRateRow { free_page_thresh: 30, pct_local_thresh: 50, node_history_thresh: 32, rate: 200 }
];

#[derive(Clone, Copy, Default)]
struct PrevCycles
{
    run: CycleCount,
    ready: CycleCount,
    wait: CycleCount
}

struct NumaSched
{
    prev: HashMap<WorldID, PrevCycles>,
    prev_node_idle: [CycleCount; NUMA_NODES_MAX],
    last_rebalance: CycleCount,
    round_robin_next: usize,
    timer: Option<TimerID>,
    timer_pcpu: usize,
    /* passes skipped because snapshot memory was unavailable */
    pub skipped_passes: u64,
    pub passes: u64
}

lazy_static!
{
    static ref NUMASCHED: Mutex<NumaSched> = Mutex::new("NUMA placement", Rank::NumaSched, NumaSched
    {
        prev: HashMap::new(),
        prev_node_idle: [0; NUMA_NODES_MAX],
        last_rebalance: 0,
        round_robin_next: 0,
        timer: None,
        timer_pcpu: 0,
        skipped_passes: 0,
        passes: 0
    });
}

/* hook the rebalance pass onto the periodic timer. a single-node
   machine has nothing to balance and registers nothing */
pub fn init(now: CycleCount) -> Result<(), Cause>
{
    if hardware::topology().nodes.len() < 2
    {
        return Ok(());
    }

    /* register before taking our own lock: the timer table's lock
       ranks below the NUMA lock */
    let period = hardware::ms_to_cycles(config::get(Tunable::NumaRebalancePeriod) as u64);
    let id = timer::register(period, 0, now + period, rebalance_callback)?;

    let mut sched = NUMASCHED.lock();
    sched.last_rebalance = now;
    sched.timer = Some(id);
    sched.timer_pcpu = 0;
    Ok(())
}

/* timer entry point: run the pass, then walk the registration to
   the next pcpu round-robin and pick up any period change */
fn rebalance_callback(now: CycleCount)
{
    if config::enabled(Tunable::NumaRebalance)
    {
        rebalance(now);
    }

    let pcpus = hardware::topology().pcpu_count;
    let moved = {
        let mut sched = NUMASCHED.lock();
        match sched.timer
        {
            Some(id) =>
            {
                sched.timer_pcpu = (sched.timer_pcpu + 1) % pcpus;
                Some((id, sched.timer_pcpu))
            },
            None => None
        }
    };

    /* timer-table calls happen after the NUMA lock drops */
    if let Some((id, pcpu)) = moved
    {
        let _ = timer::migrate(id, pcpu);
        let _ = timer::set_period(id, hardware::ms_to_cycles(config::get(Tunable::NumaRebalancePeriod) as u64));
    }
}

/* fraction of a VM's pages sitting on the given node, percent */
fn pct_local(world: WorldID, node: NodeID) -> u64
{
    let memory = match hardware::memory()
    {
        Some(memory) => memory,
        None => return 0
    };

    let mut total = 0;
    for at in 0..hardware::topology().nodes.len()
    {
        total = total + memory.pages_on_node(world, at);
    }
    if total == 0
    {
        return 0;
    }
    memory.pages_on_node(world, node) * 100 / total
}

/* what one pass concluded about one VM */
struct Worksheet
{
    sample: VsmpNumaSample,
    home: NodeID,
    owed_ms: i64
}

/* one rebalance pass. takes the NUMA lock for the duration; the
   home-node changes inside acquire cell locks, which rank above it */
pub fn rebalance(now: CycleCount)
{
    let topology = hardware::topology();
    let nodes = topology.nodes.len();
    if nodes < 2
    {
        return;
    }

    let mut sched = NUMASCHED.lock();
    sched.passes = sched.passes + 1;

    let delta_ms = hardware::cycles_to_ms(now.saturating_sub(sched.last_rebalance));
    sched.last_rebalance = now;
    if delta_ms == 0
    {
        return;
    }

    /* 1. consistent snapshot of every vsmp and each node's idle time */
    let samples = scheduler::numa_collect(now);

    let mut sheets: Vec<Worksheet> = Vec::new();
    if sheets.try_reserve(samples.len()).is_err()
    {
        /* no memory for the snapshot: silently skip this period */
        sched.skipped_passes = sched.skipped_passes + 1;
        return;
    }

    let mut node_idle_ms = [0u64; NUMA_NODES_MAX];
    for node in 0..nodes
    {
        let idle = scheduler::node_idle_cycles(node, now);
        node_idle_ms[node] = hardware::cycles_to_ms(idle.saturating_sub(sched.prev_node_idle[node]));
        sched.prev_node_idle[node] = idle;
    }

    /* enforce mandatory homes before anything else */
    for sample in samples.iter()
    {
        if config::enabled(Tunable::NumaAutoMemAffinity)
        {
            if let Some(mandatory) = sample.mandatory_home
            {
                if sample.home != Some(mandatory)
                {
                    let _ = scheduler::set_home_node(sample.world, mandatory, now);
                }
            }
        }
    }

    /* 2. entitled and owed per vsmp, in milliseconds of pcpu time */
    let mut total_shares = 0u64;
    for sample in samples.iter()
    {
        if sample.manageable && sample.home.is_some()
        {
            total_shares = total_shares + sample.shares as u64;
        }
    }
    if total_shares == 0
    {
        prune_prev(&mut sched, &samples);
        return;
    }

    for sample in samples.iter()
    {
        let home = match (sample.manageable, sample.home)
        {
            (true, Some(home)) => home,
            _ => continue
        };

        let prev = sched.prev.get(&sample.world).copied().unwrap_or_default();
        let run_ms = hardware::cycles_to_ms(sample.run_cycles.saturating_sub(prev.run));
        let ready_ms = hardware::cycles_to_ms(sample.ready_cycles.saturating_sub(prev.ready));
        let wait_ms = hardware::cycles_to_ms(sample.wait_cycles.saturating_sub(prev.wait));

        let competed = run_ms + ready_ms;
        let entitled = core::cmp::min(
            sample.shares as u64 * (topology.pcpu_count as u64 * delta_ms) / total_shares,
            competed);

        /* what the VM is owed, corrected for cycles it declined to
           use: idle time on its node while it waited wasn't unfairness */
        let mut owed = entitled as i64 - run_ms as i64;
        let wasted = core::cmp::min(wait_ms, node_idle_ms[home]) as i64;
        if owed > 0
        {
            owed = core::cmp::max(0, owed - wasted);
        }
        else if owed < 0
        {
            owed = core::cmp::min(0, owed + wasted);
        }

        sheets.push(Worksheet
        {
            sample: *sample,
            home,
            owed_ms: owed
        });
    }

    /* remember this pass's cumulative counters */
    for sample in samples.iter()
    {
        sched.prev.insert(sample.world, PrevCycles
        {
            run: sample.run_cycles,
            ready: sample.ready_cycles,
            wait: sample.wait_cycles
        });
    }
    prune_prev(&mut sched, &samples);

    /* 3.-4. per-node owed sums and the extremes */
    let mut node_owed = [0i64; NUMA_NODES_MAX];
    for sheet in sheets.iter()
    {
        node_owed[sheet.home] = node_owed[sheet.home] + sheet.owed_ms;
    }

    let mut max_node = 0;
    let mut min_node = 0;
    for node in 1..nodes
    {
        /* compare per-pcpu imbalance so asymmetric nodes weigh fairly */
        let per_cpu = |n: usize| node_owed[n] / core::cmp::max(topology.node_pcpu_count(n), 1) as i64;
        if per_cpu(node) > per_cpu(max_node)
        {
            max_node = node;
        }
        if per_cpu(node) < per_cpu(min_node)
        {
            min_node = node;
        }
    }

    /* threshold is configured per second of rebalance interval */
    let threshold = (config::get(Tunable::NumaMigThreshold) as u64 * delta_ms / 1000) as i64;
    let max_owed = node_owed[max_node];
    let min_owed = node_owed[min_node];

    /* 5. load balance: move the best candidate off the starved node */
    let mut balanced = false;
    if max_node != min_node && max_owed - min_owed > threshold
    {
        let mut best: Option<(WorldID, i64)> = None;
        for sheet in sheets.iter()
        {
            if sheet.home != max_node || sheet.owed_ms <= 0 || sheet.sample.just_migrated
            {
                continue;
            }
            if sheet.sample.mandatory_home.is_some()
            {
                continue;
            }

            /* anti-thrash: the move must not overshoot the imbalance
               it is fixing */
            if min_owed + sheet.owed_ms > max_owed - sheet.owed_ms - threshold
            {
                continue;
            }
            if min_owed + 2 * sheet.owed_ms - max_owed >= max_owed - min_owed
            {
                continue;
            }

            /* of the eligible movers, prefer the one whose pages gain
               the most locality from the move */
            let gain = pct_local(sheet.sample.world, min_node) as i64
                - pct_local(sheet.sample.world, max_node) as i64;
            match best
            {
                Some((_, best_gain)) if best_gain >= gain => (),
                _ => best = Some((sheet.sample.world, gain))
            }
        }

        if let Some((world, _)) = best
        {
            if scheduler::set_home_node(world, min_node, now).is_ok()
            {
                scheduler::numa_record_balance_mig(world);
                hvlog!("NUMA balance: world {} rehomed {} -> {}", world, max_node, min_node);
                balanced = true;
            }
        }
    }

    /* 6. locality swap, only in a pass that moved nothing for load */
    if !balanced
    {
        let mut best_pair: Option<(WorldID, NodeID, WorldID, NodeID, i64)> = None;
        for a in 0..sheets.len()
        {
            for b in (a + 1)..sheets.len()
            {
                let (sa, sb) = (&sheets[a], &sheets[b]);
                if sa.home == sb.home
                    || sa.sample.mandatory_home.is_some() || sb.sample.mandatory_home.is_some()
                {
                    continue;
                }

                let crossed = pct_local(sa.sample.world, sb.home) as i64
                    + pct_local(sb.sample.world, sa.home) as i64;
                let settled = pct_local(sa.sample.world, sa.home) as i64
                    + pct_local(sb.sample.world, sb.home) as i64;
                let diff = crossed - settled;
                match best_pair
                {
                    Some((_, _, _, _, best_diff)) if best_diff >= diff => (),
                    _ => best_pair = Some((sa.sample.world, sa.home, sb.sample.world, sb.home, diff))
                }
            }
        }

        if let Some((world_a, home_a, world_b, home_b, diff)) = best_pair
        {
            if diff > config::get(Tunable::NumaSwapLocalityThreshold) as i64
            {
                if scheduler::set_home_node(world_a, home_b, now).is_ok()
                    && scheduler::set_home_node(world_b, home_a, now).is_ok()
                {
                    scheduler::numa_record_locality_swap(world_a);
                    scheduler::numa_record_locality_swap(world_b);
                    hvlog!("NUMA swap: worlds {} and {} exchanged homes {} <-> {}",
                        world_a, world_b, home_a, home_b);
                }
            }
        }
    }

    /* 7. page-migration rate, 8. monitor migration */
    if let Some(memory) = hardware::memory()
    {
        for sheet in sheets.iter()
        {
            let home = sheet.home;
            let node_pages = topology.nodes[home].total_pages;
            let free_pct = if node_pages > 0
            {
                memory.node_free_pages(home) * 100 / node_pages
            }
            else
            {
                0
            };
            let local_pct = pct_local(sheet.sample.world, home);
            let history = sheet.sample.long_term[home];

            if config::enabled(Tunable::NumaPageMig)
            {
                let rate = mig_rate_for(free_pct as u32, local_pct as u32, history);
                if rate != sheet.sample.mig_rate
                {
                    memory.set_mig_rate(sheet.sample.world, rate);
                    scheduler::numa_set_mig_rate(sheet.sample.world, rate);
                }
            }

            /* a VM that has been loyal to its home but whose pages
               haven't followed gets the VMM migrated toward it, once */
            if history as u32 > config::get(Tunable::NumaMonMigHistory)
                && (local_pct as u32) < config::get(Tunable::NumaMonMigLocality)
                && sheet.sample.last_mon_mig_mask & (1 << home) == 0
            {
                memory.numa_migrate_vmm(sheet.sample.world, home);
                scheduler::numa_mark_mon_mig(sheet.sample.world, home);
            }
        }
    }
}

/* apply the threshold table: the chosen rate belongs to the last
   row whose predicate does not hold */
fn mig_rate_for(free_pct: u32, local_pct: u32, history: u32) -> u32
{
    let mut rate = 0;
    for row in MIG_RATE_TABLE.iter()
    {
        let satisfied = free_pct < row.free_page_thresh
            || local_pct > row.pct_local_thresh
            || history < row.node_history_thresh;
        if !satisfied
        {
            rate = row.rate;
        }
    }
    rate
}

/* drop delta state for worlds that disappeared */
fn prune_prev(sched: &mut NumaSched, samples: &[VsmpNumaSample])
{
    let mut live = [false; 4096];
    let mut fallback: Vec<WorldID> = Vec::new();
    for sample in samples.iter()
    {
        if (sample.world as usize) < live.len()
        {
            live[sample.world as usize] = true;
        }
        else
        {
            fallback.push(sample.world);
        }
    }
    sched.prev.retain(|world, _|
    {
        if (*world as usize) < live.len()
        {
            live[*world as usize]
        }
        else
        {
            fallback.contains(world)
        }
    });
}

/* choose a starting home for a new VM.
   => world = the VM's leader world, for page queries
   <= home node, or None on single-node machines */
pub fn initial_home(world: WorldID) -> Option<NodeID>
{
    let topology = hardware::topology();
    let nodes = topology.nodes.len();
    if nodes < 2
    {
        return None;
    }

    /* a VM that already holds pages somewhere starts there */
    if let Some(memory) = hardware::memory()
    {
        let mut best = 0;
        let mut best_pages = 0;
        for node in 0..nodes
        {
            let pages = memory.pages_on_node(world, node);
            if pages > best_pages
            {
                best = node;
                best_pages = pages;
            }
        }
        if best_pages >= MIN_INITIALNODE_PAGES
        {
            return Some(best);
        }
    }

    if config::enabled(Tunable::NumaRoundRobin)
    {
        let mut sched = NUMASCHED.lock();
        let node = sched.round_robin_next % nodes;
        sched.round_robin_next = sched.round_robin_next + 1;
        return Some(node);
    }

    /* default: the node with the most free memory */
    match hardware::memory()
    {
        Some(memory) =>
        {
            let mut best = 0;
            let mut best_free = 0;
            for node in 0..nodes
            {
                let free = memory.node_free_pages(node);
                if free > best_free
                {
                    best = node;
                    best_free = free;
                }
            }
            Some(best)
        },
        None =>
        {
            /* no provider registered: fall back to round-robin */
            let mut sched = NUMASCHED.lock();
            let node = sched.round_robin_next % nodes;
            sched.round_robin_next = sched.round_robin_next + 1;
            Some(node)
        }
    }
}

pub fn pass_counts() -> (u64, u64)
{
    let sched = NUMASCHED.lock();
    (sched.passes, sched.skipped_passes)
}
