/* diosix scheduler integration tests: co-scheduling
 *
 * a strict 2-vcpu VM sharing a 2-pcpu cell with two single-vcpu
 * VMs: whenever one of its vcpus is on a pcpu, the other must be
 * on a pcpu too or gathering to join it. never left behind in the
 * plain ready queue.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use sched::hardware::{Topology, NodeSpec};
use sched::tree::{self, CpuAlloc, MemAlloc};
use sched::vcore::RunState;
use sched::vsmp::HtSharing;
use sched::world::{self, WorldSpec};
use sched::scheduler;

const CYCLES_PER_MS: u64 = 1000;

fn vm(group: tree::GroupID, vcpus: usize, strict: bool) -> WorldSpec
{
    WorldSpec
    {
        vcpus,
        affinity: vec![!0],
        ht_sharing: HtSharing::Any,
        strict_cosched: strict,
        cpu: CpuAlloc::new(0, 0, 1000),
        mem: MemAlloc::default(),
        group,
        mem_affinity: None
    }
}

/* run every pcpu with a pending reschedule request until the cell
   settles. this is what the real machine does: a reschedule IPI is
   serviced well inside a millisecond */
fn settle(now: u64)
{
    for _ in 0..8
    {
        let mut any = false;
        for pcpu in 0..2
        {
            if scheduler::reschedule_pending(pcpu)
            {
                scheduler::reschedule(pcpu, now);
                any = true;
            }
        }
        if !any
        {
            return;
        }
    }
}

/* the gang invariant: once reschedule requests are serviced, a
   running vcpu's sibling is running or gathering, never abandoned */
fn assert_gang_intact(world: u32)
{
    let states = [
        scheduler::vcpu_state(world, 0).unwrap(),
        scheduler::vcpu_state(world, 1).unwrap()
    ];
    for at in 0..2
    {
        if states[at] == RunState::Run
        {
            let other = states[1 - at];
            assert!(other == RunState::Run || other == RunState::ReadyCorun,
                "gang split: vcpu {} running while sibling is {:?}", at, other);
        }
    }
}

#[test]
fn strict_gang_never_splits()
{
    /* two pcpus, separate packages, one node: one 2-pcpu cell */
    sched::init(Topology
    {
        pcpu_count: 2,
        threads_per_package: 1,
        packages: vec![0b01, 0b10],
        nodes: vec![NodeSpec { pcpus: 0b11, total_pages: 1_000_000 }],
        cycles_per_ms: CYCLES_PER_MS
    }, None, 0).unwrap();

    let group = tree::add_group(Some("gangs"), tree::lookup_name("local").unwrap(), 0,
        CpuAlloc::default(), MemAlloc::default()).unwrap();

    world::add(21, &vm(group, 2, true), 0).unwrap();    /* the gang */
    world::add(22, &vm(group, 1, false), 0).unwrap();
    world::add(23, &vm(group, 1, false), 0).unwrap();

    /* drive both pcpus through 20 seconds in 5 ms steps, settling
       reschedule requests and checking the invariant at each step */
    let step = 5 * CYCLES_PER_MS;
    let mut now = 0;
    let mut gang_ran = false;
    while now < 20_000 * CYCLES_PER_MS
    {
        for pcpu in 0..2
        {
            scheduler::timer_tick(pcpu, now);
            if now % (50 * CYCLES_PER_MS) == 0
            {
                scheduler::mark_reschedule(pcpu);
            }
        }
        settle(now);
        assert_gang_intact(21);

        if scheduler::vcpu_state(21, 0).unwrap() == RunState::Run
        {
            gang_ran = true;
        }
        now = now + step;
    }

    /* the gang did actually get time, and the singles weren't starved */
    assert!(gang_ran, "the 2-vcpu VM never ran at all");
    let single = scheduler::vcpu_run_cycles(22, 0, now).unwrap();
    assert!(single > 0, "single-vcpu VM starved by the gang");

    /* co-run starts were recorded */
    let stats = scheduler::cell_stats(0).unwrap();
    assert!(stats.corun_starts > 0);

    world::remove(21, now).unwrap();
    world::remove(22, now).unwrap();
    world::remove(23, now).unwrap();
}
