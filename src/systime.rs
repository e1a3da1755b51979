/* diosix scheduler system-time sampling
 *
 * Interrupt handlers and kernel services often do work on behalf
 * of a vcpu that isn't the one executing. charging every such
 * stretch would cost more than the accounting is worth, so this
 * samples: with probability 1/2^k a stretch is timed and its full
 * cost, scaled up by 2^k, is attributed to the target vcpu. over
 * time the charge converges on the truth. the embedder must keep
 * preemption off between start() and done(), and nesting on one
 * pcpu is refused.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::vcore::VcpuID;
use super::hardware::{self, PcpuID, CycleCount};
use super::world::WorldID;

/* sample one stretch in 2^SAMPLE_SHIFT */
pub const SAMPLE_SHIFT: u32 = 3;

/* minstd multiplicative congruential generator */
const PRNG_MULTIPLIER: u64 = 48271;
const PRNG_MODULUS: u64 = 0x7fff_ffff;

struct ActiveSample
{
    started_at: CycleCount,
    world: WorldID,
    vcpu: VcpuID
}

struct Sampler
{
    seed: u64,
    active: Option<ActiveSample>
}

impl Sampler
{
    /* advance the generator and decide whether to take this sample */
    fn roll(&mut self) -> bool
    {
        self.seed = (self.seed * PRNG_MULTIPLIER) % PRNG_MODULUS;
        self.seed & ((1 << SAMPLE_SHIFT) - 1) == 0
    }
}

static SAMPLERS: Once<Vec<Mutex<Sampler>>> = Once::new();

lazy_static!
{
    /* lock-free charge counters per world, shared with the vcores so
       done() never has to take a cell lock */
    static ref COUNTERS: Mutex<HashMap<WorldID, Vec<Arc<AtomicU64>>>> = Mutex::new(HashMap::new());
}

/* build the per-pcpu samplers. call once at boot */
pub fn init()
{
    SAMPLERS.call_once(||
    {
        let mut samplers = Vec::new();
        for pcpu in 0..hardware::topology().pcpu_count
        {
            /* distinct odd seeds per pcpu */
            samplers.push(Mutex::new(Sampler
            {
                seed: (pcpu as u64) * 2 + 1,
                active: None
            }));
        }
        samplers
    });
}

/* the scheduler hands over each world's counters at admission */
pub fn register_world(world: WorldID, counters: Vec<Arc<AtomicU64>>)
{
    COUNTERS.lock().insert(world, counters);
}

pub fn unregister_world(world: WorldID)
{
    COUNTERS.lock().remove(&world);
}

/* consider sampling a stretch of cross-context work.
   => pcpu = pcpu the work is executing on, preemption off
      world, vcpu = who the work is for
      now = current cycle count
   <= true if a sample was started and done() must be called */
pub fn start(pcpu: PcpuID, world: WorldID, vcpu: VcpuID, now: CycleCount) -> bool
{
    let samplers = match SAMPLERS.get()
    {
        Some(samplers) => samplers,
        None => return false
    };

    let mut sampler = samplers[pcpu].lock();
    if sampler.active.is_some()
    {
        /* already timing something on this pcpu */
        return false;
    }
    if !sampler.roll()
    {
        return false;
    }

    sampler.active = Some(ActiveSample { started_at: now, world, vcpu });
    true
}

/* finish the sample started on this pcpu: the elapsed cycles,
   scaled up by the sampling ratio, land on the target vcpu */
pub fn done(pcpu: PcpuID, now: CycleCount)
{
    let samplers = match SAMPLERS.get()
    {
        Some(samplers) => samplers,
        None => return
    };

    let sample = match samplers[pcpu].lock().active.take()
    {
        Some(sample) => sample,
        None => return
    };

    let elapsed = now.saturating_sub(sample.started_at) << SAMPLE_SHIFT;
    let counters = COUNTERS.lock();
    if let Some(world_counters) = counters.get(&sample.world)
    {
        if let Some(counter) = world_counters.get(sample.vcpu)
        {
            counter.fetch_add(elapsed, Ordering::Relaxed);
        }
    }
}

/* total system time attributed to a vcpu so far */
pub fn sys_cycles(world: WorldID, vcpu: VcpuID) -> Option<u64>
{
    let counters = COUNTERS.lock();
    Some(counters.get(&world)?.get(vcpu)?.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testsupport;
    use alloc::vec;

    #[test]
    fn sampling_charges_target_vcpu()
    {
        testsupport::tiny_machine();
        init();

        let counter = Arc::new(AtomicU64::new(0));
        register_world(501, vec![counter.clone()]);

        /* run many stretches; roughly 1/8 should sample, each charge
           scaled by 8, so the total lands near the true cost */
        let mut open = false;
        let mut clock = 0;
        for _ in 0..4096
        {
            assert!(!open);
            open = start(0, 501, 0, clock);
            if open
            {
                done(0, clock + 100);
                open = false;
            }
            clock = clock + 1000;
        }

        let charged = counter.load(Ordering::Relaxed);
        let truth = 4096 * 100;
        assert!(charged > truth / 2 && charged < truth * 2,
            "statistical charge {} too far from {}", charged, truth);

        /* nesting on one pcpu is refused */
        let mut started = false;
        for _ in 0..64
        {
            if start(0, 501, 0, clock)
            {
                started = true;
                break;
            }
            clock = clock + 1000;
        }
        if started
        {
            assert!(!start(0, 501, 0, clock));
            done(0, clock + 50);
        }

        unregister_world(501);
        assert_eq!(sys_cycles(501, 0), None);
    }
}
