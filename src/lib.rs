/* diosix CPU and memory resource scheduler
 *
 * The part of the hypervisor that decides which virtual CPU runs
 * on which physical CPU, how memory capacity is divided among VMs,
 * and, on NUMA machines, where each VM should live for locality.
 *
 * This crate is a library: the embedding hypervisor registers the
 * machine topology and a memory provider at boot, then drives the
 * engines from its timer interrupts and context-switch points.
 * nothing in here touches hardware directly, which also means the
 * whole system can be exercised on a host with simulated time.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate lazy_static;
extern crate alloc;

/* debug macros first so everyone can use them */
#[macro_use]
pub mod debug;

pub mod error;
pub mod lock;
pub mod config;
pub mod timer;
pub mod fixedpoint;
pub mod seqcount;
pub mod staticlist;
pub mod history;
pub mod hardware;
pub mod tree;
pub mod memsched;
pub mod vcore;
pub mod vsmp;
pub mod cell;
pub mod scheduler;
pub mod numa;
pub mod systime;
pub mod world;

use alloc::boxed::Box;
use error::Cause;
use hardware::{Topology, MemoryProvider, CycleCount};
use config::Tunable;

/* period of the global load-average update */
const LOAD_METRICS_PERIOD_MS: u64 = 2000;

/* bring the whole scheduler up. call exactly once at hypervisor
   boot, before any vCPU exists.
   => topology = the machine as the embedder sees it
      memory = memory reclamation interface, or None if that side
               of the hypervisor isn't up yet
      now = current cycle count
   <= Ok, or error code */
pub fn init(topology: Topology, memory: Option<Box<dyn MemoryProvider>>, now: CycleCount) -> Result<(), Cause>
{
    hardware::register_topology(topology)?;
    if let Some(provider) = memory
    {
        hardware::register_memory_provider(provider);
    }

    /* order matters: the tree underpins admission, the cells hold
       the vsmps, the samplers hang off both */
    history::reset_index();
    tree::init()?;
    world::init()?;
    scheduler::init()?;
    systime::init();
    numa::init(now)?;

    /* periodic work: load averages and load history. the NUMA
       rebalancer registered its own timer above */
    timer::register(hardware::ms_to_cycles(LOAD_METRICS_PERIOD_MS), 0,
        now + hardware::ms_to_cycles(LOAD_METRICS_PERIOD_MS), scheduler::load_metrics_tick)?;

    let history_ms = config::get(Tunable::CpuLoadHistorySamplePeriod) as u64;
    timer::register(hardware::ms_to_cycles(history_ms), 0,
        now + hardware::ms_to_cycles(history_ms), scheduler::sample_load_history)?;

    hvlog!("resource scheduler initialized");
    Ok(())
}

/* wind the scheduler down at hypervisor shutdown. worlds should be
   gone by now; this stops the periodic machinery */
pub fn shutdown()
{
    world::cleanup();
    timer::reset();
    hvlog!("resource scheduler stopped");
}

/* shared plumbing for the unit tests: one topology, one simulated
   memory provider, and one big lock serializing tests that touch
   the global tree and cells */
#[cfg(test)]
pub mod testsupport
{
    extern crate std;
    use std::sync::{Mutex, MutexGuard, Once};
    use std::collections::HashMap;
    use crate::hardware::{self, Topology, NodeSpec, MemoryProvider, NodeID};
    use crate::world::WorldID;
    use crate::tree::{self, GroupID};
    use crate::{scheduler, systime};

    static SERIAL: Mutex<()> = Mutex::new(());

    /* tests mutating global state take turns; a panicking test must
       not poison the rest of the run */
    pub fn serialize() -> MutexGuard<'static, ()>
    {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    lazy_static!
    {
        static ref PAGES: Mutex<HashMap<(WorldID, NodeID), u64>> = Mutex::new(HashMap::new());
        static ref NODE_FREE: Mutex<Vec<u64>> = Mutex::new(vec![500_000, 500_000]);
        static ref MIG_RATES: Mutex<HashMap<WorldID, u32>> = Mutex::new(HashMap::new());
        static ref VMM_MIGRATES: Mutex<Vec<(WorldID, NodeID)>> = Mutex::new(Vec::new());
    }

    struct SimMemory;

    impl MemoryProvider for SimMemory
    {
        fn free_pages(&self) -> u64 { NODE_FREE.lock().unwrap().iter().sum() }
        fn low_watermark(&self) -> u64 { 10_000 }
        fn high_watermark(&self) -> u64 { 50_000 }
        fn node_free_pages(&self, node: NodeID) -> u64
        {
            NODE_FREE.lock().unwrap().get(node).copied().unwrap_or(0)
        }
        fn pages_on_node(&self, world: WorldID, node: NodeID) -> u64
        {
            PAGES.lock().unwrap().get(&(world, node)).copied().unwrap_or(0)
        }
        fn set_mig_rate(&self, world: WorldID, rate: u32)
        {
            MIG_RATES.lock().unwrap().insert(world, rate);
        }
        fn numa_migrate_vmm(&self, world: WorldID, node: NodeID)
        {
            VMM_MIGRATES.lock().unwrap().push((world, node));
        }
        fn reserve_mem(&self, _world: WorldID, _pages: u64) -> bool { true }
        fn unreserve_mem(&self, _world: WorldID, _pages: u64) {}
    }

    pub fn set_pages_on_node(world: WorldID, node: NodeID, pages: u64)
    {
        PAGES.lock().unwrap().insert((world, node), pages);
    }

    pub fn set_node_free(node: NodeID, pages: u64)
    {
        let mut free = NODE_FREE.lock().unwrap();
        if node < free.len()
        {
            free[node] = pages;
        }
    }

    pub fn mig_rate_of(world: WorldID) -> Option<u32>
    {
        MIG_RATES.lock().unwrap().get(&world).copied()
    }

    /* 4 pcpus: two packages of two threads, two NUMA nodes matching
       the packages, 1000 cycles per millisecond */
    pub fn tiny_machine()
    {
        let _ = hardware::register_topology(Topology
        {
            pcpu_count: 4,
            threads_per_package: 2,
            packages: vec![0b0011, 0b1100],
            nodes: vec![
                NodeSpec { pcpus: 0b0011, total_pages: 1_000_000 },
                NodeSpec { pcpus: 0b1100, total_pages: 1_000_000 }],
            cycles_per_ms: 1000
        });
        hardware::register_memory_provider(Box::new(SimMemory));
    }

    /* serialize, then make sure the machine, tree and scheduler are
       up. the tree is reset each time; each test makes its own
       groups and cleans up its own worlds */
    pub fn sched_up() -> MutexGuard<'static, ()>
    {
        let guard = serialize();
        tiny_machine();
        tree::init().unwrap();

        static BOOT: Once = Once::new();
        BOOT.call_once(||
        {
            scheduler::init().unwrap();
            systime::init();
        });
        guard
    }

    pub fn test_group(name: &str) -> GroupID
    {
        tree::add_group(Some(name), tree::lookup_name("local").unwrap(), 0,
            Default::default(), Default::default()).unwrap()
    }

    pub fn drop_group(group: GroupID)
    {
        let _ = tree::remove_group(group);
    }
}
