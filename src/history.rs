/* diosix scheduler load history
 *
 * Every vCPU and every group keeps a fixed ring of (run, ready)
 * samples in milliseconds. one global index is shared by all
 * rings: the sampling pass advances it once per period, so any
 * two rings line up by index arithmetic. summaries walk at most
 * the newest 150 entries, which also means a concurrent writer
 * lapping the ring cannot corrupt a summary: entries older than
 * the largest timescale are never read.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use alloc::vec::Vec;

/* ring capacity and the three summary timescales, in samples */
pub const LOAD_HISTORY_SAMPLES: usize = 180;
pub const TIMESCALES: [usize; 3] = [10, 50, 150];

/* one shared position across every ring in the system */
static GLOBAL_INDEX: AtomicU64 = AtomicU64::new(0);

/* the sampling pass calls this once per period after filling all rings */
pub fn advance_index()
{
    GLOBAL_INDEX.fetch_add(1, Ordering::Release);
}

/* current global ring index. snapshot readers take this once and
   walk backward from it; the acquire load is all the ordering the
   bounded backward walk needs */
pub fn index() -> u64
{
    GLOBAL_INDEX.load(Ordering::Acquire)
}

/* reset the shared index. boot and test setup only */
pub fn reset_index()
{
    GLOBAL_INDEX.store(0, Ordering::Release);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sample
{
    pub run_ms: u32,
    pub ready_ms: u32
}

/* summary of one timescale: newest N samples of run+ready time */
#[derive(Debug, Clone, Copy, Default)]
pub struct TimescaleSummary
{
    pub samples: usize,
    pub min_ms: u32,
    pub max_ms: u32,
    pub mean_ms: u32,
    /* 80/60/40/20/0 percentile points of the descending-sorted samples */
    pub quintiles_ms: [u32; 5]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistorySummary
{
    pub scales: [TimescaleSummary; 3]
}

pub struct HistoryRing
{
    samples: [Sample; LOAD_HISTORY_SAMPLES],
    appended: u64
}

impl HistoryRing
{
    pub fn new() -> HistoryRing
    {
        HistoryRing
        {
            samples: [Sample::default(); LOAD_HISTORY_SAMPLES],
            appended: 0
        }
    }

    /* store a sample at the given global index */
    pub fn append(&mut self, index: u64, run_ms: u32, ready_ms: u32)
    {
        self.samples[(index as usize) % LOAD_HISTORY_SAMPLES] = Sample { run_ms, ready_ms };
        self.appended = self.appended + 1;
    }

    /* number of samples this ring has ever recorded */
    pub fn recorded(&self) -> u64 { self.appended }

    /* summarize the newest samples at each timescale.
       => index = global ring index to walk backward from
       <= summaries, or None if the scratch buffer cannot be allocated */
    pub fn summarize(&self, index: u64) -> Option<HistorySummary>
    {
        /* sort scratch space is allocated per request and freed on return.
           if the heap cannot supply it, omit the summary silently */
        let mut scratch: Vec<u32> = Vec::new();
        if scratch.try_reserve(TIMESCALES[2]).is_err()
        {
            return None;
        }

        let mut summary = HistorySummary::default();
        for (at, scale) in TIMESCALES.iter().enumerate()
        {
            summary.scales[at] = self.summarize_scale(index, *scale, &mut scratch);
        }
        Some(summary)
    }

    /* summarize the newest `scale` samples, walking backward from index */
    fn summarize_scale(&self, index: u64, scale: usize, scratch: &mut Vec<u32>) -> TimescaleSummary
    {
        let have = core::cmp::min(self.appended, index) as usize;
        let count = core::cmp::min(scale, have);
        if count == 0
        {
            return TimescaleSummary::default();
        }

        scratch.clear();
        let mut min = u32::MAX;
        let mut max = 0u32;
        let mut total = 0u64;

        for back in 0..count
        {
            /* index is the next slot to write, so the newest sample is at index - 1 */
            let at = ((index as usize).wrapping_sub(1 + back)) % LOAD_HISTORY_SAMPLES;
            let sample = self.samples[at];
            let load = sample.run_ms + sample.ready_ms;
            min = core::cmp::min(min, load);
            max = core::cmp::max(max, load);
            total = total + load as u64;
            scratch.push(load);
        }

        /* quintile points come from a descending sort of the scratch copy */
        scratch.sort_unstable_by(|a, b| b.cmp(a));
        let mut quintiles = [0u32; 5];
        for point in 0..5
        {
            let at = core::cmp::min(count * (point + 1) / 5, count - 1);
            quintiles[point] = scratch[at];
        }

        TimescaleSummary
        {
            samples: count,
            min_ms: min,
            max_ms: max,
            mean_ms: (total / count as u64) as u32,
            quintiles_ms: quintiles
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn summary_covers_three_timescales()
    {
        let mut ring = HistoryRing::new();
        for i in 0..160u64
        {
            /* run climbs, ready stays flat */
            ring.append(i, i as u32, 1);
        }

        let summary = ring.summarize(160).unwrap();
        assert_eq!(summary.scales[0].samples, 10);
        assert_eq!(summary.scales[1].samples, 50);
        assert_eq!(summary.scales[2].samples, 150);

        /* the newest 10 samples are 150..159 run + 1 ready */
        assert_eq!(summary.scales[0].max_ms, 160);
        assert_eq!(summary.scales[0].min_ms, 151);
        /* mean of 151..=160 */
        assert_eq!(summary.scales[0].mean_ms, 155);
    }

    #[test]
    fn quintiles_are_descending_points()
    {
        let mut ring = HistoryRing::new();
        for i in 0..50u64
        {
            ring.append(i, (i as u32) * 2, 0);
        }

        let summary = ring.summarize(50).unwrap();
        let q = summary.scales[1].quintiles_ms;
        /* 80th percentile point >= 60th >= ... >= 0th, and the 0th is the minimum */
        assert!(q[0] >= q[1] && q[1] >= q[2] && q[2] >= q[3] && q[3] >= q[4]);
        assert_eq!(q[4], summary.scales[1].min_ms);
    }

    #[test]
    fn short_history_is_capped()
    {
        let mut ring = HistoryRing::new();
        for i in 0..4u64
        {
            ring.append(i, 5, 5);
        }

        let summary = ring.summarize(4).unwrap();
        for scale in summary.scales.iter()
        {
            assert_eq!(scale.samples, 4);
            assert_eq!(scale.mean_ms, 10);
        }
    }

    #[test]
    fn ring_wrap_reads_newest()
    {
        let mut ring = HistoryRing::new();
        for i in 0..400u64
        {
            ring.append(i, if i >= 390 { 100 } else { 1 }, 0);
        }

        let summary = ring.summarize(400).unwrap();
        /* newest 10 are all 100 */
        assert_eq!(summary.scales[0].min_ms, 100);
        assert_eq!(summary.scales[0].max_ms, 100);
    }
}
