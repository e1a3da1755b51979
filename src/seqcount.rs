/* diosix scheduler versioned counters
 *
 * single-writer, many-reader snapshot protocol for accounting
 * fields that are written under a cell lock but read from other
 * CPUs without taking it. the writer brackets its update between
 * bumps of two version counters; a reader retries until it sees
 * matching versions either side of its read. reader closures
 * must be idempotent: they may run several times per snapshot.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicU32, Ordering};

pub struct SeqCount
{
    v0: AtomicU32,
    v1: AtomicU32
}

impl SeqCount
{
    pub const fn new() -> SeqCount
    {
        SeqCount { v0: AtomicU32::new(0), v1: AtomicU32::new(0) }
    }

    /* writer side: call before mutating the payload.
       the caller must already hold whatever lock makes it the single writer */
    pub fn begin_write(&self)
    {
        let v = self.v0.load(Ordering::Relaxed).wrapping_add(1);
        self.v0.store(v, Ordering::Release);
        /* order the version bump before the payload stores */
        core::sync::atomic::fence(Ordering::Release);
    }

    /* writer side: call after mutating the payload */
    pub fn end_write(&self)
    {
        /* order the payload stores before publishing the matching version */
        core::sync::atomic::fence(Ordering::Release);
        let v = self.v0.load(Ordering::Relaxed);
        self.v1.store(v, Ordering::Release);
    }

    /* reader side: run the closure until it executes across a stable version.
       => read = closure reading the payload. must not accumulate into
                 external state, it can run more than once
       <= the closure's result from the consistent run */
    pub fn read<T, F: FnMut() -> T>(&self, mut read: F) -> T
    {
        loop
        {
            let before = self.v1.load(Ordering::Acquire);
            let value = read();
            core::sync::atomic::fence(Ordering::Acquire);
            let after = self.v0.load(Ordering::Acquire);
            if before == after
            {
                return value;
            }
            core::hint::spin_loop();
        }
    }
}

impl Default for SeqCount
{
    fn default() -> SeqCount { SeqCount::new() }
}
