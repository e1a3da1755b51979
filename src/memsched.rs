/* diosix memory scheduler interface
 *
 * Per-VM memory reservations, shares and limits, admitted against
 * the group tree. the mechanism that actually reclaims pages lives
 * elsewhere in the hypervisor; this side decides who must give
 * pages back and emits reserve/unreserve commands through the
 * memory provider interface.
 *
 * lock order: the memsched lock ranks below the tree lock, so
 * admission may consult the tree while holding it.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::lock::{Mutex, Rank};
use super::tree::{self, GroupID, MemAlloc};
use super::hardware;
use super::world::WorldID;

struct MemClient
{
    group: GroupID,
    alloc: MemAlloc,
    /* pages currently reserved with the memory provider */
    reserved: u64
}

struct MemSched
{
    clients: HashMap<WorldID, MemClient>,
    /* sum of client minimums per group, for admission headroom */
    group_reserved: HashMap<GroupID, u64>
}

lazy_static!
{
    static ref MEMSCHED: Mutex<MemSched> = Mutex::new("memory scheduler", Rank::Memsched, MemSched
    {
        clients: HashMap::new(),
        group_reserved: HashMap::new()
    });
}

/* sanity rules for one client's allocation */
fn validate(alloc: &MemAlloc) -> Result<(), Cause>
{
    if alloc.max > 0 && alloc.min > alloc.max
    {
        return Err(Cause::BadArgument);
    }
    if alloc.min_limit > 0 && alloc.max > 0 && alloc.max < alloc.min_limit
    {
        /* the limit may never be configured below the limit floor */
        return Err(Cause::BadArgument);
    }
    if alloc.hard_max > 0 && alloc.max > alloc.hard_max
    {
        return Err(Cause::BadArgument);
    }
    Ok(())
}

/* admission of a client allocation against its group and the chain
   above it: reservations must fit each ancestor's min that is set,
   and the hard ceiling may not exceed any ancestor's */
fn admit(sched: &MemSched, group: GroupID, alloc: &MemAlloc, replacing: u64) -> Result<(), Cause>
{
    validate(alloc)?;

    let (path, depth) = tree::path_of(group)?;
    for at in 0..depth
    {
        let ancestor = tree::mem_alloc_of(path[at])?;
        if ancestor.hard_max > 0 && alloc.hard_max > ancestor.hard_max
        {
            return Err(Cause::AdmissionDeniedMem);
        }
    }

    let group_alloc = tree::mem_alloc_of(group)?;
    if group_alloc.min > 0
    {
        let held = sched.group_reserved.get(&group).copied().unwrap_or(0).saturating_sub(replacing);
        if held + alloc.min as u64 > group_alloc.min as u64
        {
            return Err(Cause::AdmissionDeniedMem);
        }
    }
    Ok(())
}

/* register a VM with the memory scheduler.
   => world = VM's leader world
      group = group the VM is attached to
      alloc = memory allocation in pages
   <= Ok, or error code with nothing admitted */
pub fn register_client(world: WorldID, group: GroupID, alloc: MemAlloc) -> Result<(), Cause>
{
    let mut sched = MEMSCHED.lock();
    if sched.clients.contains_key(&world)
    {
        return Err(Cause::SchedWorldExists);
    }
    admit(&sched, group, &alloc, 0)?;

    let entry = sched.group_reserved.entry(group).or_insert(0);
    *entry = *entry + alloc.min as u64;
    sched.clients.insert(world, MemClient { group, alloc, reserved: 0 });
    Ok(())
}

/* drop a VM: release its reservation with the provider and its
   admission headroom */
pub fn unregister_client(world: WorldID)
{
    let mut sched = MEMSCHED.lock();
    if let Some(client) = sched.clients.remove(&world)
    {
        if client.reserved > 0
        {
            if let Some(memory) = hardware::memory()
            {
                memory.unreserve_mem(world, client.reserved);
            }
        }
        if let Some(entry) = sched.group_reserved.get_mut(&client.group)
        {
            *entry = entry.saturating_sub(client.alloc.min as u64);
        }
    }
}

/* change a VM's memory allocation. the new minimum is admitted
   before the old one is given up; failure leaves everything as it
   was */
pub fn set_alloc(world: WorldID, alloc: MemAlloc) -> Result<(), Cause>
{
    let mut sched = MEMSCHED.lock();
    let (group, old_min) = match sched.clients.get(&world)
    {
        Some(client) => (client.group, client.alloc.min as u64),
        None => return Err(Cause::SchedWorldNotFound)
    };

    admit(&sched, group, &alloc, old_min)?;

    let entry = sched.group_reserved.entry(group).or_insert(0);
    *entry = *entry - old_min + alloc.min as u64;
    sched.clients.get_mut(&world).unwrap().alloc = alloc;
    Ok(())
}

/* move a client's reservation accounting to another group. the new
   group admits the allocation before the old one releases it */
pub fn change_client_group(world: WorldID, new_group: GroupID) -> Result<(), Cause>
{
    let mut sched = MEMSCHED.lock();
    let (old_group, alloc) = match sched.clients.get(&world)
    {
        Some(client) => (client.group, client.alloc),
        None => return Err(Cause::SchedWorldNotFound)
    };
    if old_group == new_group
    {
        return Ok(());
    }

    admit(&sched, new_group, &alloc, 0)?;

    let entry = sched.group_reserved.entry(new_group).or_insert(0);
    *entry = *entry + alloc.min as u64;
    if let Some(entry) = sched.group_reserved.get_mut(&old_group)
    {
        *entry = entry.saturating_sub(alloc.min as u64);
    }
    sched.clients.get_mut(&world).unwrap().group = new_group;
    Ok(())
}

/* reserve pages for a VM: bounded by its max, backed by the memory
   provider. emits the ReserveMem command */
pub fn reserve(world: WorldID, pages: u64) -> Result<(), Cause>
{
    let mut sched = MEMSCHED.lock();
    let client = sched.clients.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;

    if client.alloc.max > 0 && client.reserved + pages > client.alloc.max as u64
    {
        return Err(Cause::MemReservationExceeded);
    }
    if client.alloc.hard_max > 0 && client.reserved + pages > client.alloc.hard_max as u64
    {
        return Err(Cause::MemReservationExceeded);
    }

    if let Some(memory) = hardware::memory()
    {
        if !memory.reserve_mem(world, pages)
        {
            return Err(Cause::NoMemory);
        }
    }
    client.reserved = client.reserved + pages;
    Ok(())
}

/* return pages. emits the UnreserveMem command */
pub fn unreserve(world: WorldID, pages: u64) -> Result<(), Cause>
{
    let mut sched = MEMSCHED.lock();
    let client = sched.clients.get_mut(&world).ok_or(Cause::SchedWorldNotFound)?;

    let returned = core::cmp::min(pages, client.reserved);
    if returned > 0
    {
        if let Some(memory) = hardware::memory()
        {
            memory.unreserve_mem(world, returned);
        }
        client.reserved = client.reserved - returned;
    }
    Ok(())
}

pub fn reserved_pages(world: WorldID) -> Option<u64>
{
    MEMSCHED.lock().clients.get(&world).map(|client| client.reserved)
}

/* reclaim targets when free memory has fallen below the low
   watermark: each client above its minimum is asked for pages in
   inverse proportion to its shares, never below its min.
   <= per-world page counts the embedder should balloon or swap out */
pub fn reclaim_targets() -> Vec<(WorldID, u64)>
{
    let memory = match hardware::memory()
    {
        Some(memory) => memory,
        None => return Vec::new()
    };

    let free = memory.free_pages();
    let low = memory.low_watermark();
    if free >= low
    {
        return Vec::new();
    }
    let mut deficit = memory.high_watermark().saturating_sub(free);

    let sched = MEMSCHED.lock();

    /* surplus above min, weighted down by shares: a client with
       twice the shares gives up half as much per round */
    let mut takers: Vec<(WorldID, u64, u64)> = Vec::new();
    let mut weight_total = 0u64;
    for (world, client) in sched.clients.iter()
    {
        let surplus = client.reserved.saturating_sub(client.alloc.min as u64);
        if surplus == 0
        {
            continue;
        }
        let weight = 1_000_000 / core::cmp::max(client.alloc.shares, 1) as u64;
        takers.push((*world, surplus, weight));
        weight_total = weight_total + weight;
    }

    let mut targets = Vec::new();
    for (world, surplus, weight) in takers
    {
        if deficit == 0 || weight_total == 0
        {
            break;
        }
        let ask = core::cmp::min(surplus, deficit * weight / weight_total);
        if ask > 0
        {
            targets.push((world, ask));
            deficit = deficit.saturating_sub(ask);
        }
    }
    targets
}

/* teardown and test setup */
pub fn reset()
{
    let mut sched = MEMSCHED.lock();
    sched.clients.clear();
    sched.group_reserved.clear();
}

#[cfg(test)]
mod tests
{
    extern crate std;
    use super::*;
    use crate::testsupport;

    fn pages(min: u32, max: u32, shares: u32) -> MemAlloc
    {
        MemAlloc { min, max, shares, min_limit: 0, hard_max: 0 }
    }

    #[test]
    fn admission_against_group_min()
    {
        let guard = testsupport::serialize();
        tree::init().unwrap();
        reset();

        let local = tree::lookup_name("local").unwrap();
        let pool = tree::add_group(Some("mempool"), local, 0, Default::default(),
            pages(1000, 0, 1000)).unwrap();

        register_client(601, pool, pages(600, 0, 1000)).unwrap();
        /* second client pushes the group past its 1000-page guarantee */
        assert_eq!(register_client(602, pool, pages(500, 0, 1000)),
            Err(Cause::AdmissionDeniedMem));
        register_client(602, pool, pages(400, 0, 1000)).unwrap();

        unregister_client(601);
        unregister_client(602);
        tree::remove_group(pool).unwrap();
        drop(guard);
    }

    #[test]
    fn hard_max_honours_ancestors()
    {
        let guard = testsupport::serialize();
        tree::init().unwrap();
        reset();

        let local = tree::lookup_name("local").unwrap();
        let pool = tree::add_group(Some("capped-pool"), local, 0, Default::default(),
            MemAlloc { min: 0, max: 0, shares: 1000, min_limit: 0, hard_max: 2048 }).unwrap();

        let mut client = pages(0, 0, 1000);
        client.hard_max = 4096;
        assert_eq!(register_client(611, pool, client), Err(Cause::AdmissionDeniedMem));

        client.hard_max = 1024;
        register_client(611, pool, client).unwrap();

        unregister_client(611);
        tree::remove_group(pool).unwrap();
        drop(guard);
    }

    #[test]
    fn reservations_respect_limits()
    {
        let guard = testsupport::serialize();
        tree::init().unwrap();
        reset();

        let local = tree::lookup_name("local").unwrap();
        let pool = tree::add_group(Some("limits"), local, 0, Default::default(),
            Default::default()).unwrap();

        register_client(621, pool, pages(100, 500, 1000)).unwrap();
        reserve(621, 400).unwrap();
        assert_eq!(reserve(621, 200), Err(Cause::MemReservationExceeded));
        assert_eq!(reserved_pages(621), Some(400));

        unreserve(621, 150).unwrap();
        assert_eq!(reserved_pages(621), Some(250));

        unregister_client(621);
        tree::remove_group(pool).unwrap();
        drop(guard);
    }

    #[test]
    fn reclaim_targets_take_from_surplus_holders()
    {
        let guard = testsupport::serialize();
        testsupport::tiny_machine();
        tree::init().unwrap();
        reset();

        let local = tree::lookup_name("local").unwrap();
        let pool = tree::add_group(Some("reclaim"), local, 0, Default::default(),
            Default::default()).unwrap();

        /* equal surpluses, unequal shares */
        register_client(641, pool, pages(100, 0, 1000)).unwrap();
        register_client(642, pool, pages(100, 0, 4000)).unwrap();
        reserve(641, 50_000).unwrap();
        reserve(642, 50_000).unwrap();

        /* plenty of free memory: nobody is asked for anything */
        testsupport::set_node_free(0, 500_000);
        testsupport::set_node_free(1, 500_000);
        assert!(reclaim_targets().is_empty());

        /* free memory below the low watermark: both give pages back,
           the low-shares client more than the high-shares one */
        testsupport::set_node_free(0, 2_000);
        testsupport::set_node_free(1, 2_000);
        let targets = reclaim_targets();
        assert!(!targets.is_empty());
        let take = |world| targets.iter().find(|(w, _)| *w == world).map(|(_, p)| *p).unwrap_or(0);
        assert!(take(641) > take(642), "shares ignored: {:?}", targets);

        /* restore for the other tests */
        testsupport::set_node_free(0, 500_000);
        testsupport::set_node_free(1, 500_000);
        unregister_client(641);
        unregister_client(642);
        tree::remove_group(pool).unwrap();
        drop(guard);
    }

    #[test]
    fn set_alloc_rolls_back_on_denial()
    {
        let guard = testsupport::serialize();
        tree::init().unwrap();
        reset();

        let local = tree::lookup_name("local").unwrap();
        let pool = tree::add_group(Some("rollback"), local, 0, Default::default(),
            pages(1000, 0, 1000)).unwrap();

        register_client(631, pool, pages(300, 0, 1000)).unwrap();
        register_client(632, pool, pages(600, 0, 1000)).unwrap();

        /* raising 631 to 500 would need 1100 of the group's 1000 */
        assert_eq!(set_alloc(631, pages(500, 0, 1000)), Err(Cause::AdmissionDeniedMem));
        /* the old reservation still stands, so 100 more fits */
        set_alloc(631, pages(400, 0, 1000)).unwrap();

        unregister_client(631);
        unregister_client(632);
        tree::remove_group(pool).unwrap();
        drop(guard);
    }
}
