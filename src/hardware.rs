/* diosix scheduler hardware description and host services
 *
 * The scheduler core never touches hardware itself. at boot the
 * embedding hypervisor registers the machine's topology and an
 * implementation of the memory provider interface, and after that
 * every entry point is driven with explicit pcpu IDs and absolute
 * cycle counts. this keeps the engines deterministic and lets the
 * whole system run on a host for testing.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use spin::Once;
use alloc::boxed::Box;
use alloc::vec::Vec;
use super::error::Cause;
use super::world::WorldID;

/* physical CPU threads are identified by a linear ID from zero,
   assigned by the embedder at boot */
pub type PcpuID = usize;
pub type CycleCount = u64;

/* bitmask of pcpus. one bit per linear pcpu ID */
pub type PcpuMask = u64;
pub const PCPUS_MAX: usize = 64;

/* NUMA memory nodes, linear from zero */
pub type NodeID = usize;
pub const NUMA_NODES_MAX: usize = 8;

/* description of one NUMA node */
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec
{
    pub pcpus: PcpuMask,
    pub total_pages: u64
}

/* the machine as the embedder describes it at boot */
#[derive(Debug, Clone)]
pub struct Topology
{
    pub pcpu_count: usize,

    /* logical threads per physical package. load history divides
       measured cycles by this to compensate for hyperthreading */
    pub threads_per_package: usize,

    /* each package's pcpu mask, used by the hyperthread placement rules */
    pub packages: Vec<PcpuMask>,

    /* NUMA nodes. a single-node machine disables the placement controller */
    pub nodes: Vec<NodeSpec>,

    /* timestamp frequency */
    pub cycles_per_ms: u64
}

impl Topology
{
    /* basic validation before the topology is accepted */
    fn validate(&self) -> Result<(), Cause>
    {
        if self.pcpu_count == 0 || self.pcpu_count > PCPUS_MAX
            || self.threads_per_package == 0 || self.cycles_per_ms == 0
            || self.nodes.len() > NUMA_NODES_MAX
        {
            return Err(Cause::TopologyBad);
        }

        /* every pcpu must belong to exactly one node when nodes are described */
        if self.nodes.len() > 0
        {
            let mut seen: PcpuMask = 0;
            for node in self.nodes.iter()
            {
                if node.pcpus & seen != 0
                {
                    return Err(Cause::TopologyBad);
                }
                seen = seen | node.pcpus;
            }
            if seen != all_pcpus_mask(self.pcpu_count)
            {
                return Err(Cause::TopologyBad);
            }
        }
        Ok(())
    }

    /* which package a pcpu belongs to, or None if packages weren't described */
    pub fn package_of(&self, pcpu: PcpuID) -> Option<usize>
    {
        self.packages.iter().position(|mask| mask & (1 << pcpu) != 0)
    }

    /* pcpus sharing a package with the given pcpu, excluding it */
    pub fn package_mates(&self, pcpu: PcpuID) -> PcpuMask
    {
        match self.package_of(pcpu)
        {
            Some(package) => self.packages[package] & !(1 << pcpu),
            None => 0
        }
    }

    /* which node's pcpu set contains the given pcpu */
    pub fn node_of_pcpu(&self, pcpu: PcpuID) -> Option<NodeID>
    {
        self.nodes.iter().position(|node| node.pcpus & (1 << pcpu) != 0)
    }

    /* number of pcpus on the given node */
    pub fn node_pcpu_count(&self, node: NodeID) -> usize
    {
        match self.nodes.get(node)
        {
            Some(spec) => spec.pcpus.count_ones() as usize,
            None => 0
        }
    }

    /* pcpu count of the smallest node */
    pub fn smallest_node_pcpus(&self) -> usize
    {
        self.nodes.iter().map(|node| node.pcpus.count_ones() as usize).min().unwrap_or(0)
    }
}

/* mask covering the first count pcpus */
pub fn all_pcpus_mask(count: usize) -> PcpuMask
{
    if count >= 64 { !0 } else { (1 << count) - 1 }
}

/* commands the scheduler issues to, and state it queries from,
   the memory reclamation side of the hypervisor */
pub trait MemoryProvider: Send + Sync
{
    /* reclamation state queries */
    fn free_pages(&self) -> u64;
    fn low_watermark(&self) -> u64;
    fn high_watermark(&self) -> u64;
    fn node_free_pages(&self, node: NodeID) -> u64;
    fn pages_on_node(&self, world: WorldID, node: NodeID) -> u64;

    /* commands */
    fn set_mig_rate(&self, world: WorldID, rate: u32);
    fn numa_migrate_vmm(&self, world: WorldID, node: NodeID);
    fn reserve_mem(&self, world: WorldID, pages: u64) -> bool;
    fn unreserve_mem(&self, world: WorldID, pages: u64);
}

static TOPOLOGY: Once<Topology> = Once::new();
static MEMORY: Once<Box<dyn MemoryProvider>> = Once::new();

/* accept the machine description. first successful call wins: these are
   process-wide and must be in place before any vCPU exists */
pub fn register_topology(topology: Topology) -> Result<(), Cause>
{
    topology.validate()?;
    TOPOLOGY.call_once(|| topology);
    Ok(())
}

pub fn register_memory_provider(provider: Box<dyn MemoryProvider>)
{
    MEMORY.call_once(|| provider);
}

pub fn topology() -> &'static Topology
{
    TOPOLOGY.get().expect("scheduler used before topology registered")
}

pub fn memory() -> Option<&'static dyn MemoryProvider>
{
    match MEMORY.get()
    {
        Some(provider) => Some(provider.as_ref()),
        None => None
    }
}

/* timestamp conversions */
pub fn ms_to_cycles(ms: u64) -> CycleCount
{
    ms * topology().cycles_per_ms
}

pub fn cycles_to_ms(cycles: CycleCount) -> u64
{
    cycles / topology().cycles_per_ms
}

#[cfg(test)]
mod tests
{
    use super::*;
    use alloc::vec;

    #[test]
    fn bad_topologies_are_rejected()
    {
        let no_pcpus = Topology
        {
            pcpu_count: 0, threads_per_package: 1, packages: vec![],
            nodes: vec![], cycles_per_ms: 1000
        };
        assert_eq!(no_pcpus.validate(), Err(Cause::TopologyBad));

        /* overlapping node masks */
        let overlap = Topology
        {
            pcpu_count: 4, threads_per_package: 1, packages: vec![],
            nodes: vec![
                NodeSpec { pcpus: 0b0011, total_pages: 1000 },
                NodeSpec { pcpus: 0b0110, total_pages: 1000 }],
            cycles_per_ms: 1000
        };
        assert_eq!(overlap.validate(), Err(Cause::TopologyBad));
    }

    #[test]
    fn package_and_node_lookup()
    {
        let topo = Topology
        {
            pcpu_count: 4, threads_per_package: 2,
            packages: vec![0b0011, 0b1100],
            nodes: vec![
                NodeSpec { pcpus: 0b0011, total_pages: 1000 },
                NodeSpec { pcpus: 0b1100, total_pages: 1000 }],
            cycles_per_ms: 1000
        };
        assert!(topo.validate().is_ok());
        assert_eq!(topo.package_of(2), Some(1));
        assert_eq!(topo.package_mates(2), 0b1000);
        assert_eq!(topo.node_of_pcpu(1), Some(0));
        assert_eq!(topo.smallest_node_pcpus(), 2);
    }
}
