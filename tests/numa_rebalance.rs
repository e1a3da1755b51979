/* diosix scheduler integration tests: NUMA load-balance migration
 *
 * eight identical VMs piled onto node 0 of a two-node machine:
 * each rebalance period moves at most one VM toward node 1, and
 * within a handful of periods the nodes are even and the
 * controller goes quiet.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use std::collections::HashMap;
use std::sync::Mutex;
use sched::hardware::{Topology, NodeSpec, MemoryProvider, NodeID};
use sched::tree::{self, CpuAlloc, MemAlloc};
use sched::vsmp::HtSharing;
use sched::world::{self, WorldID, WorldSpec};
use sched::{scheduler, numa};

const CYCLES_PER_MS: u64 = 1000;
const PCPUS: usize = 8;
const VMS: u32 = 8;
const PERIOD_MS: u64 = 5000;

lazy_static::lazy_static!
{
    static ref PAGES: Mutex<HashMap<(WorldID, NodeID), u64>> = Mutex::new(HashMap::new());
}

struct SimMemory;

impl MemoryProvider for SimMemory
{
    fn free_pages(&self) -> u64 { 1_000_000 }
    fn low_watermark(&self) -> u64 { 1_000 }
    fn high_watermark(&self) -> u64 { 10_000 }
    fn node_free_pages(&self, _node: NodeID) -> u64 { 500_000 }
    fn pages_on_node(&self, world: WorldID, node: NodeID) -> u64
    {
        PAGES.lock().unwrap().get(&(world, node)).copied().unwrap_or(0)
    }
    fn set_mig_rate(&self, _world: WorldID, _rate: u32) {}
    fn numa_migrate_vmm(&self, _world: WorldID, _node: NodeID) {}
    fn reserve_mem(&self, _world: WorldID, _pages: u64) -> bool { true }
    fn unreserve_mem(&self, _world: WorldID, _pages: u64) {}
}

fn vm(group: tree::GroupID) -> WorldSpec
{
    WorldSpec
    {
        vcpus: 1,
        affinity: vec![!0],
        ht_sharing: HtSharing::Any,
        strict_cosched: false,
        cpu: CpuAlloc::new(0, 0, 1000),
        mem: MemAlloc::default(),
        group,
        mem_affinity: None
    }
}

fn total_balance_migs() -> u64
{
    (1..=VMS).map(|world| scheduler::numa_counters(world).unwrap().0).sum()
}

fn homes() -> (usize, usize)
{
    let mut counts = (0, 0);
    for world in 1..=VMS
    {
        match scheduler::home_node(world)
        {
            Some(0) => counts.0 = counts.0 + 1,
            Some(1) => counts.1 = counts.1 + 1,
            other => panic!("world {} has unexpected home {:?}", world, other)
        }
    }
    counts
}

#[test]
fn overloaded_node_drains_one_vm_per_period()
{
    /* two nodes of four pcpus each */
    sched::init(Topology
    {
        pcpu_count: PCPUS,
        threads_per_package: 1,
        packages: (0..PCPUS).map(|p| 1 << p).collect(),
        nodes: vec![
            NodeSpec { pcpus: 0x0f, total_pages: 1_000_000 },
            NodeSpec { pcpus: 0xf0, total_pages: 1_000_000 }],
        cycles_per_ms: CYCLES_PER_MS
    }, Some(Box::new(SimMemory)), 0).unwrap();

    let group = tree::add_group(Some("pile"), tree::lookup_name("local").unwrap(), 0,
        CpuAlloc::default(), MemAlloc::default()).unwrap();

    /* every VM already holds pages on node 0, so initial placement
       piles them all there */
    for world in 1..=VMS
    {
        PAGES.lock().unwrap().insert((world, 0), 4096);
        world::add(world, &vm(group), 0).unwrap();
        assert_eq!(scheduler::home_node(world), Some(0));
    }
    assert_eq!(homes(), (8, 0));

    /* run rebalance periods: drive every pcpu through the period,
       then let the controller look at the imbalance */
    let quantum = scheduler::QUANTUM_MS * CYCLES_PER_MS;
    let mut now = 0;
    let mut migrations_before = 0;
    let mut balanced_at = None;

    for period in 1..=10
    {
        let period_end = now + PERIOD_MS * CYCLES_PER_MS;
        while now < period_end
        {
            for pcpu in 0..PCPUS
            {
                scheduler::reschedule(pcpu, now);
            }
            now = now + quantum;
        }
        numa::rebalance(now);

        /* at most one load-balance migration per period */
        let migrations = total_balance_migs();
        assert!(migrations - migrations_before <= 1,
            "period {} migrated {} VMs at once", period, migrations - migrations_before);
        migrations_before = migrations;

        let (on_zero, on_one) = homes();
        assert_eq!(on_zero + on_one, VMS as usize);
        if on_zero == on_one && balanced_at.is_none()
        {
            balanced_at = Some(period);
        }
    }

    /* the pile leveled out within the expected number of periods */
    let balanced_at = balanced_at.expect("nodes never balanced");
    assert!(balanced_at <= 8, "took {} periods to balance", balanced_at);
    assert_eq!(homes(), (4, 4));

    /* and once even, the controller goes quiet */
    let settled = total_balance_migs();
    for _ in 0..2
    {
        let period_end = now + PERIOD_MS * CYCLES_PER_MS;
        while now < period_end
        {
            for pcpu in 0..PCPUS
            {
                scheduler::reschedule(pcpu, now);
            }
            now = now + quantum;
        }
        numa::rebalance(now);
    }
    assert_eq!(total_balance_migs(), settled, "rebalance not neutral when nodes are even");

    for world in 1..=VMS
    {
        world::remove(world, now).unwrap();
    }
}
