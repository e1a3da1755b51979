/* diosix scheduler locking primitives
 *
 * Provides a spin lock mutex that carries a human-readable
 * description and a lock rank. locks must be acquired in
 * ascending rank order. the rank discipline is asserted in
 * host test builds, where there is somewhere per-thread for
 * the bookkeeping to live; production builds compile the
 * check away and keep only the acquisition stats.
 *
 * use lock() to acquire a mutex.
 * it is unlocked when it goes out of scope.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/* if a lock() call spins more than DEADLOCK_THRESHOLD times
   then it's considered a deadlocked mutex */
const DEADLOCK_THRESHOLD: usize = 1000000;

/* lock ranks, lowest to highest. a CPU holding a lock may only
   acquire locks of strictly higher rank. all scheduler cells share
   one rank: code never holds two cell locks at once because
   cross-cell moves drain first */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank
{
    Timer = 0,
    Memsched = 1,
    NumaSched = 2,
    SchedTree = 3,
    CpuschedCell = 4,
    VsmpVcpus = 5,
    VcpuAction = 6,
    VcpuSleep = 7
}

/* track the ranks held by the calling thread so out-of-order
   acquisition panics in test builds */
#[cfg(test)]
mod rankcheck
{
    extern crate std;
    use std::cell::RefCell;
    use std::vec::Vec;
    use super::Rank;

    std::thread_local!
    {
        static HELD: RefCell<Vec<Rank>> = RefCell::new(Vec::new());
    }

    pub fn push(rank: Rank, description: &'static str)
    {
        HELD.with(|held|
        {
            let mut held = held.borrow_mut();
            if let Some(top) = held.last()
            {
                assert!(*top < rank,
                    "lock rank violation: acquiring {} ({:?}) while holding {:?}", description, rank, *top);
            }
            held.push(rank);
        });
    }

    pub fn pop(rank: Rank)
    {
        HELD.with(|held|
        {
            let mut held = held.borrow_mut();
            /* guards drop in reverse acquisition order. find the entry
               rather than assume it's on top so out-of-order drops of
               equal-rank guards don't trip the accounting */
            if let Some(at) = held.iter().rposition(|r| *r == rank)
            {
                held.remove(at);
            }
        });
    }
}

pub struct Mutex<T>
{
    /* the data we're protecting */
    content: UnsafeCell<T>,
    locked: AtomicBool,

    /* accounting */
    lock_attempts: AtomicUsize,
    lock_count: AtomicUsize,
    rank: Rank,
    description: &'static str
}

/* Mutex uses the same API shape as std's Mutex. create with new(),
   call lock() to block until acquired, drop the guard to release */
impl<T> Mutex<T>
{
    pub const fn new(description: &'static str, rank: Rank, data: T) -> Mutex<T>
    {
        Mutex
        {
            content: UnsafeCell::new(data),
            locked: AtomicBool::new(false),
            lock_attempts: AtomicUsize::new(0),
            lock_count: AtomicUsize::new(0),
            rank,
            description
        }
    }

    /* spin until ready to return a reference to the protected data */
    pub fn lock(&self) -> MutexGuard<'_, T>
    {
        #[cfg(test)]
        rankcheck::push(self.rank, self.description);

        let mut attempts = 0;
        loop
        {
            self.lock_attempts.fetch_add(1, Ordering::Relaxed);
            if self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) == Ok(false)
            {
                break;
            }

            attempts = attempts + 1;
            if attempts == DEADLOCK_THRESHOLD
            {
                hvalert!("BUG: {} mutex ({:p}) may be deadlocked", self.description, &self.content);
            }

            core::hint::spin_loop();
        }

        self.lock_count.fetch_add(1, Ordering::Relaxed);
        MutexGuard { mutex: &self }
    }

    /* release the mutex */
    fn unlock(&self)
    {
        #[cfg(test)]
        rankcheck::pop(self.rank);

        self.locked.store(false, Ordering::Release);
    }

    /* return true if the mutex is locked, or false if not */
    pub fn is_locked(&self) -> bool
    {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn description(&self) -> &'static str { self.description }
    pub fn rank(&self) -> Rank { self.rank }
}

/* pretty print a mutex's stats */
impl<T> core::fmt::Debug for MutexGuard<'_, T>
{
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result
    {
        write!(f, "{} attempts to acquire {}, {} succeeded",
            self.mutex.lock_attempts.load(Ordering::Relaxed),
            self.mutex.description,
            self.mutex.lock_count.load(Ordering::Relaxed))
    }
}

pub struct MutexGuard<'a, T>
{
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T>
{
    type Target = T;

    fn deref(&self) -> &Self::Target
    {
        unsafe { &*self.mutex.content.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T>
{
    fn deref_mut(&mut self) -> &mut Self::Target
    {
        unsafe { &mut *self.mutex.content.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T>
{
    fn drop(&mut self)
    {
        self.mutex.unlock()
    }
}

/* keep rustc happy */
unsafe impl<T> Send for Mutex<T> where T: Send {}
unsafe impl<T> Sync for Mutex<T> where T: Send {}
