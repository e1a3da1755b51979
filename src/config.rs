/* diosix scheduler runtime configuration
 *
 * A flat table of numeric tunables that the embedder's config
 * channel can read and write at any time. periodic passes pick
 * up new values on their next run, so a write never has to
 * synchronize with the engines.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU32, Ordering};

/* every runtime-settable knob. the discriminant indexes the value table */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable
{
    /* master enable for NUMA rebalancing */
    NumaRebalance = 0,
    /* master enable for automatic page migration */
    NumaPageMig,
    /* milliseconds between rebalance passes */
    NumaRebalancePeriod,
    /* per-second load-balance migration threshold in ms, scaled by the period */
    NumaMigThreshold,
    /* minimum locality improvement (percentage points) to justify a swap */
    NumaSwapLocalityThreshold,
    /* infer a mandatory home node from CPU affinity confined to one node */
    NumaAutoMemAffinity,
    /* initial placement: 1 = round-robin, 0 = most free memory */
    NumaRoundRobin,
    /* monitor-migration trigger: minimum long-term residency on home */
    NumaMonMigHistory,
    /* monitor-migration trigger: maximum percent of pages local to home */
    NumaMonMigLocality,
    /* milliseconds between load history samples */
    CpuLoadHistorySamplePeriod,
    /* minimum CPU reservation (percent) for the console group */
    CpuMinCos
}

const TUNABLES_COUNT: usize = Tunable::CpuMinCos as usize + 1;

/* defaults, indexed by Tunable discriminant */
const DEFAULTS: [u32; TUNABLES_COUNT] =
[
    1,      /* NumaRebalance */
    1,      /* NumaPageMig */
    5000,   /* NumaRebalancePeriod */
    50,     /* NumaMigThreshold */
    10,     /* NumaSwapLocalityThreshold */
    1,      /* NumaAutoMemAffinity */
    0,      /* NumaRoundRobin */
    80,     /* NumaMonMigHistory */
    50,     /* NumaMonMigLocality */
    2000,   /* CpuLoadHistorySamplePeriod */
    5       /* CpuMinCos */
];

static VALUES: [AtomicU32; TUNABLES_COUNT] =
[
    AtomicU32::new(DEFAULTS[0]), AtomicU32::new(DEFAULTS[1]), AtomicU32::new(DEFAULTS[2]),
    AtomicU32::new(DEFAULTS[3]), AtomicU32::new(DEFAULTS[4]), AtomicU32::new(DEFAULTS[5]),
    AtomicU32::new(DEFAULTS[6]), AtomicU32::new(DEFAULTS[7]), AtomicU32::new(DEFAULTS[8]),
    AtomicU32::new(DEFAULTS[9]), AtomicU32::new(DEFAULTS[10])
];

/* read a tunable's current value */
pub fn get(which: Tunable) -> u32
{
    VALUES[which as usize].load(Ordering::Relaxed)
}

/* read a tunable as an on/off flag */
pub fn enabled(which: Tunable) -> bool
{
    get(which) != 0
}

/* update a tunable. takes effect on the next periodic pass */
pub fn set(which: Tunable, value: u32)
{
    VALUES[which as usize].store(value, Ordering::Relaxed);
}

/* restore every tunable to its default. used by tests and teardown */
pub fn reset()
{
    for (value, default) in VALUES.iter().zip(DEFAULTS.iter())
    {
        value.store(*default, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_and_updates()
    {
        reset();
        assert_eq!(get(Tunable::NumaRebalancePeriod), 5000);
        assert!(enabled(Tunable::NumaRebalance));

        set(Tunable::NumaRebalance, 0);
        assert!(!enabled(Tunable::NumaRebalance));
        reset();
        assert!(enabled(Tunable::NumaRebalance));
    }
}
