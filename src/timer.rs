/* diosix scheduler periodic timers
 *
 * The embedder calls tick() from each pcpu's timer interrupt with
 * the current cycle count. due callbacks fire outside the registry
 * lock, so a callback is free to take scheduler locks or move its
 * own registration to another pcpu. each firing re-arms the entry
 * one period ahead of the deadline it just met.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use super::lock::{Mutex, Rank};
use super::error::Cause;
use super::hardware::{PcpuID, CycleCount};

pub type TimerID = usize;
pub type TimerCallback = fn(now: CycleCount);

const TIMERS_MAX: usize = 16;

struct PeriodicTimer
{
    id: TimerID,
    period: CycleCount,
    next_at: CycleCount,
    pcpu: PcpuID,
    callback: TimerCallback,
    active: bool
}

struct TimerTable
{
    timers: Vec<PeriodicTimer>,
    next_id: TimerID
}

static TIMERS: Mutex<TimerTable> = Mutex::new("periodic timer table", Rank::Timer,
    TimerTable { timers: Vec::new(), next_id: 0 });

/* register a periodic callback.
   => period = cycles between firings, must be non-zero
      pcpu = pcpu whose tick() services this timer
      first_at = absolute cycle count of the first firing
      callback = function to invoke when due
   <= timer ID for later control, or error code */
pub fn register(period: CycleCount, pcpu: PcpuID, first_at: CycleCount, callback: TimerCallback) -> Result<TimerID, Cause>
{
    if period == 0
    {
        return Err(Cause::BadArgument);
    }

    let mut table = TIMERS.lock();
    if table.timers.len() >= TIMERS_MAX
    {
        return Err(Cause::TimerTableFull);
    }

    let id = table.next_id;
    table.next_id = table.next_id + 1;
    table.timers.push(PeriodicTimer
    {
        id,
        period,
        next_at: first_at,
        pcpu,
        callback,
        active: true
    });
    Ok(id)
}

/* change which pcpu services a timer. a callback uses this to walk
   its registration round-robin across the machine */
pub fn migrate(id: TimerID, pcpu: PcpuID) -> Result<(), Cause>
{
    let mut table = TIMERS.lock();
    match table.timers.iter_mut().find(|t| t.id == id)
    {
        Some(timer) =>
        {
            timer.pcpu = pcpu;
            Ok(())
        },
        None => Err(Cause::TimerNotFound)
    }
}

/* change a timer's period. the new period applies from the next re-arm */
pub fn set_period(id: TimerID, period: CycleCount) -> Result<(), Cause>
{
    if period == 0
    {
        return Err(Cause::BadArgument);
    }

    let mut table = TIMERS.lock();
    match table.timers.iter_mut().find(|t| t.id == id)
    {
        Some(timer) =>
        {
            timer.period = period;
            Ok(())
        },
        None => Err(Cause::TimerNotFound)
    }
}

/* deactivate a timer. its slot is reused by the next registration */
pub fn cancel(id: TimerID) -> Result<(), Cause>
{
    let mut table = TIMERS.lock();
    match table.timers.iter().position(|t| t.id == id)
    {
        Some(at) =>
        {
            table.timers.remove(at);
            Ok(())
        },
        None => Err(Cause::TimerNotFound)
    }
}

/* service due timers for one pcpu. called from its timer interrupt.
   callbacks run after the registry lock is dropped.
   => pcpu = pcpu whose interrupt this is
      now = current absolute cycle count */
pub fn tick(pcpu: PcpuID, now: CycleCount)
{
    let mut due: Vec<TimerCallback> = Vec::new();
    {
        let mut table = TIMERS.lock();
        for timer in table.timers.iter_mut()
        {
            if timer.active && timer.pcpu == pcpu && timer.next_at <= now
            {
                due.push(timer.callback);

                /* re-arm from the deadline, skipping any periods that were missed
                   outright so a stalled pcpu doesn't replay a backlog */
                while timer.next_at <= now
                {
                    timer.next_at = timer.next_at + timer.period;
                }
            }
        }
    }

    for callback in due
    {
        callback(now);
    }
}

/* clear the whole table. teardown and test setup only */
pub fn reset()
{
    let mut table = TIMERS.lock();
    table.timers.clear();
    table.next_id = 0;
}

#[cfg(test)]
mod tests
{
    extern crate std;
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    /* both tests poke the one global timer table: take turns */
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn count_firing(_now: CycleCount)
    {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn fires_when_due_and_rearms()
    {
        let _serial = SERIAL.lock().unwrap();
        reset();
        FIRED.store(0, Ordering::Relaxed);
        let id = register(100, 0, 100, count_firing).unwrap();

        tick(0, 50);    /* not due yet */
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);

        tick(0, 100);   /* due */
        tick(1, 200);   /* wrong pcpu */
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        tick(0, 200);   /* due again after re-arm */
        assert_eq!(FIRED.load(Ordering::Relaxed), 2);

        /* a long stall advances past the backlog, one firing only */
        tick(0, 1000);
        assert_eq!(FIRED.load(Ordering::Relaxed), 3);

        cancel(id).unwrap();
        tick(0, 2000);
        assert_eq!(FIRED.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn migrate_moves_servicing_pcpu()
    {
        let _serial = SERIAL.lock().unwrap();
        reset();
        FIRED.store(0, Ordering::Relaxed);
        let id = register(100, 0, 100, count_firing).unwrap();

        migrate(id, 3).unwrap();
        tick(0, 150);
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);
        tick(3, 150);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        reset();
        assert_eq!(migrate(id, 1), Err(Cause::TimerNotFound));
    }
}
