/* diosix scheduler integration tests: group tree moves and admission
 *
 * moving a group under a parent that cannot guarantee its memory
 * reservation must fail cleanly: error reported, tree untouched.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use std::sync::{Mutex, MutexGuard, Once};
use sched::error::Cause;
use sched::hardware::{Topology, NodeSpec};
use sched::tree::{self, CpuAlloc, MemAlloc};
use sched::vsmp::HtSharing;
use sched::world::{self, WorldSpec};

const CYCLES_PER_MS: u64 = 1000;

static SERIAL: Mutex<()> = Mutex::new(());
static BOOT: Once = Once::new();

fn setup() -> MutexGuard<'static, ()>
{
    let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    BOOT.call_once(||
    {
        sched::init(Topology
        {
            pcpu_count: 2,
            threads_per_package: 1,
            packages: vec![0b01, 0b10],
            nodes: vec![NodeSpec { pcpus: 0b11, total_pages: 1_000_000 }],
            cycles_per_ms: CYCLES_PER_MS
        }, None, 0).unwrap();
    });
    guard
}

fn mem(min: u32) -> MemAlloc
{
    MemAlloc { min, max: 0, shares: 1000, min_limit: 0, hard_max: 0 }
}

#[test]
fn move_without_capacity_rolls_back()
{
    let _serial = setup();
    let local = tree::lookup_name("local").unwrap();

    /* parent with 1000 pages guaranteed, 700 already spoken for */
    let parent = tree::add_group(Some("roomy"), local, 0, CpuAlloc::default(), mem(1000)).unwrap();
    let sitting = tree::add_group(Some("sitting"), parent, 0, CpuAlloc::default(), mem(700)).unwrap();

    /* a 500-page group elsewhere wants in */
    let mover = tree::add_group(Some("mover"), local, 0, CpuAlloc::default(), mem(500)).unwrap();

    let parent_members = count_members(parent);
    let local_members = count_members(local);

    assert_eq!(tree::move_group(mover, parent), Err(Cause::AdmissionDeniedMem));

    /* postconditions: nothing moved, counts identical, tree valid */
    assert_eq!(count_members(parent), parent_members);
    assert_eq!(count_members(local), local_members);
    let (path, depth) = tree::path_of(mover).unwrap();
    assert_eq!(path[depth - 2], local);
    assert!(tree::validate());

    /* shrinking the mover lets the same move succeed */
    tree::set_mem_alloc(mover, mem(300)).unwrap();
    tree::move_group(mover, parent).unwrap();
    let (path, depth) = tree::path_of(mover).unwrap();
    assert_eq!(path[depth - 2], parent);

    tree::remove_group(mover).unwrap();
    tree::remove_group(sitting).unwrap();
    tree::remove_group(parent).unwrap();
}

fn count_members(group: tree::GroupID) -> usize
{
    let mut count = None;
    tree::for_all_groups(|id, g|
    {
        if id == group
        {
            count = Some(g.member_count());
        }
    });
    count.expect("group vanished")
}

#[test]
fn world_survives_group_change_while_ready()
{
    /* worlds queued ready can be re-grouped without disturbance */
    let _serial = setup();
    let local = tree::lookup_name("local").unwrap();
    let a = tree::add_group(Some("east"), local, 0, CpuAlloc::default(), MemAlloc::default()).unwrap();
    let b = tree::add_group(Some("west"), local, 0, CpuAlloc::default(), MemAlloc::default()).unwrap();

    let spec = WorldSpec
    {
        vcpus: 1,
        affinity: vec![!0],
        ht_sharing: HtSharing::Any,
        strict_cosched: false,
        cpu: CpuAlloc::new(0, 0, 1000),
        mem: MemAlloc::default(),
        group: a,
        mem_affinity: None
    };
    world::add(51, &spec, 0).unwrap();

    world::change_group(51, b).unwrap();
    assert_eq!(tree::group_of_world(51), Some(b));
    assert!(tree::validate());

    world::remove(51, 100).unwrap();
    tree::remove_group(a).unwrap();
    tree::remove_group(b).unwrap();
}
