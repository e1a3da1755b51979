/* diosix world lifecycle
 *
 * A world is the hypervisor's name for a VM, identified by a
 * 32-bit ID whose group-leader world owns the vsmp. this module is
 * the front door: admitting a world threads it through the group
 * tree, the memory scheduler, initial NUMA placement and the CPU
 * scheduler, unwinding everything if any stage refuses.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use spin::Mutex;
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::tree::{self, GroupID, CpuAlloc, MemAlloc};
use super::vsmp::{VsmpConfig, HtSharing};
use super::scheduler;
use super::memsched;
use super::numa;
use super::config::{self, Tunable};
use super::hardware::{self, PcpuID, PcpuMask, CycleCount, NodeID};

pub type WorldID = u32;

/* everything the embedder specifies about a new VM */
#[derive(Clone)]
pub struct WorldSpec
{
    pub vcpus: usize,
    /* one mask for all vcpus, or one per vcpu */
    pub affinity: Vec<PcpuMask>,
    pub ht_sharing: HtSharing,
    pub strict_cosched: bool,
    pub cpu: CpuAlloc,
    pub mem: MemAlloc,
    pub group: GroupID,
    pub mem_affinity: Option<NodeID>
}

struct WorldInfo
{
    group: GroupID
}

lazy_static!
{
    static ref WORLDS: Mutex<HashMap<WorldID, WorldInfo>> = Mutex::new(HashMap::new());
}

/* bring the world table up. part of boot, before any VM starts */
pub fn init() -> Result<(), Cause>
{
    WORLDS.lock().clear();
    Ok(())
}

/* teardown: every world should already be gone; complain about
   stragglers rather than leak them silently */
pub fn cleanup()
{
    let worlds = WORLDS.lock();
    for (world, _) in worlds.iter()
    {
        hvalert!("world {} still registered at cleanup", world);
    }
}

/* derive the config the CPU scheduler wants from a world spec */
fn vsmp_config(spec: &WorldSpec) -> VsmpConfig
{
    VsmpConfig
    {
        vcpus: spec.vcpus,
        affinity: spec.affinity.clone(),
        ht_sharing: spec.ht_sharing,
        strict_cosched: spec.strict_cosched,
        alloc: spec.cpu,
        group: spec.group,
        is_vm: true,
        mem_affinity: spec.mem_affinity
    }
}

/* a hard CPU affinity confined to one node forces that node as the
   VM's home when the auto-memaffinity policy is on */
fn mandatory_home(spec: &WorldSpec) -> Option<NodeID>
{
    if !config::enabled(Tunable::NumaAutoMemAffinity)
    {
        return None;
    }

    let topology = hardware::topology();
    let machine = hardware::all_pcpus_mask(topology.pcpu_count);
    let union = spec.affinity.iter().fold(0, |mask, m| mask | m) & machine;
    if union == machine || union == 0
    {
        return None;
    }
    for (node, node_spec) in topology.nodes.iter().enumerate()
    {
        if union & !node_spec.pcpus == 0
        {
            return Some(node);
        }
    }
    None
}

fn admit(world: WorldID, spec: &WorldSpec, running: Option<PcpuID>, now: CycleCount) -> Result<(), Cause>
{
    if spec.vcpus == 0
    {
        return Err(Cause::BadArgument);
    }
    if WORLDS.lock().contains_key(&world)
    {
        return Err(Cause::SchedWorldExists);
    }

    /* each stage unwinds the ones before it on failure */
    tree::join_group(world, spec.group)?;

    if let Err(e) = memsched::register_client(world, spec.group, spec.mem)
    {
        let _ = tree::leave_group(world);
        return Err(e);
    }

    let home = match (spec.mem_affinity, mandatory_home(spec))
    {
        (Some(node), _) => Some(node),
        (None, Some(node)) => Some(node),
        (None, None) => numa::initial_home(world)
    };

    if let Err(e) = scheduler::add(world, &vsmp_config(spec), home, running, now)
    {
        memsched::unregister_client(world);
        let _ = tree::leave_group(world);
        return Err(e);
    }

    WORLDS.lock().insert(world, WorldInfo { group: spec.group });
    hvlog!("world {} admitted to group {:#x}", world, spec.group);
    Ok(())
}

/* admit a world whose vcpus all start queued ready.
   => world = new world's ID
      spec = the VM's shape
      now = current cycle count
   <= Ok, or error code with nothing changed */
pub fn add(world: WorldID, spec: &WorldSpec, now: CycleCount) -> Result<(), Cause>
{
    admit(world, spec, None, now)
}

/* admit a world whose leader vcpu is already executing on the
   given pcpu (the caller's own context) */
pub fn add_running(world: WorldID, spec: &WorldSpec, pcpu: PcpuID, now: CycleCount) -> Result<(), Cause>
{
    admit(world, spec, Some(pcpu), now)
}

/* tear a world down. idempotent: a second call reports not-found */
pub fn remove(world: WorldID, now: CycleCount) -> Result<(), Cause>
{
    if WORLDS.lock().remove(&world).is_none()
    {
        return Err(Cause::SchedWorldNotFound);
    }

    let _ = scheduler::remove(world, now);
    memsched::unregister_client(world);
    let _ = tree::leave_group(world);
    hvlog!("world {} removed", world);
    Ok(())
}

/* move a world to a new group, preserving its CPU allocation
   through the tree's scratch-group dance, then refresh the
   scheduler's view of its path */
pub fn change_group(world: WorldID, new_parent: GroupID) -> Result<(), Cause>
{
    let alloc = scheduler::world_alloc(world)?;

    /* the memory side admits first: its failure leaves the tree alone */
    memsched::change_client_group(world, new_parent)?;
    if let Err(e) = tree::change_group(world, new_parent, alloc)
    {
        let old = tree::group_of_world(world);
        if let Some(old) = old
        {
            let _ = memsched::change_client_group(world, old);
        }
        return Err(e);
    }
    scheduler::world_group_changed(world, new_parent)?;

    if let Some(info) = WORLDS.lock().get_mut(&world)
    {
        info.group = new_parent;
    }
    Ok(())
}

pub fn exists(world: WorldID) -> bool
{
    WORLDS.lock().contains_key(&world)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testsupport;
    use alloc::vec;

    fn spec(group: GroupID) -> WorldSpec
    {
        WorldSpec
        {
            vcpus: 1,
            affinity: vec![!0],
            ht_sharing: HtSharing::Any,
            strict_cosched: false,
            cpu: CpuAlloc::new(0, 0, 1000),
            mem: MemAlloc { min: 10, max: 0, shares: 1000, min_limit: 0, hard_max: 0 },
            group,
            mem_affinity: None
        }
    }

    #[test]
    fn lifecycle_threads_all_subsystems()
    {
        let _serial = testsupport::sched_up();
        memsched::reset();
        init().unwrap();
        let group = testsupport::test_group("worlds");

        add(701, &spec(group), 0).unwrap();
        assert!(exists(701));
        assert_eq!(tree::group_of_world(701), Some(group));
        assert_eq!(memsched::reserved_pages(701), Some(0));
        assert!(scheduler::world_cell_of(701).is_some());

        /* double add is refused */
        assert_eq!(add(701, &spec(group), 0), Err(Cause::SchedWorldExists));

        remove(701, 100).unwrap();
        assert!(!exists(701));
        assert_eq!(tree::group_of_world(701), None);
        assert_eq!(remove(701, 200), Err(Cause::SchedWorldNotFound));

        testsupport::drop_group(group);
    }

    #[test]
    fn failed_admission_unwinds()
    {
        let _serial = testsupport::sched_up();
        memsched::reset();
        init().unwrap();

        /* a group guaranteeing 50 pages cannot take a 100-page min */
        let local = tree::lookup_name("local").unwrap();
        let tight = tree::add_group(Some("tight-mem"), local, 0, CpuAlloc::default(),
            MemAlloc { min: 50, max: 0, shares: 1000, min_limit: 0, hard_max: 0 }).unwrap();

        let mut wants = spec(tight);
        wants.mem.min = 100;
        assert_eq!(add(711, &wants, 0), Err(Cause::AdmissionDeniedMem));

        /* fully unwound: not in the tree, not schedulable */
        assert!(!exists(711));
        assert_eq!(tree::group_of_world(711), None);
        assert!(scheduler::world_cell_of(711).is_none());

        tree::remove_group(tight).unwrap();
    }

    #[test]
    fn change_group_updates_scheduler_path()
    {
        let _serial = testsupport::sched_up();
        memsched::reset();
        init().unwrap();
        let a = testsupport::test_group("from");
        let b = testsupport::test_group("to");

        add(721, &spec(a), 0).unwrap();
        change_group(721, b).unwrap();
        assert_eq!(tree::group_of_world(721), Some(b));

        remove(721, 100).unwrap();
        testsupport::drop_group(a);
        testsupport::drop_group(b);
    }
}
