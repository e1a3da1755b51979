/* diosix scheduler group tree
 *
 * Hierarchical tree of scheduler groups and VM leaves, shared by
 * the CPU and memory schedulers. groups and nodes live in fixed
 * tables whose slots are reused; a per-slot generation counter is
 * folded into every group ID so a stale ID can never alias a
 * recycled slot. one tree-wide lock serializes all mutation.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use alloc::string::String;
use alloc::vec::Vec;
use alloc::format;
use hashbrown::hash_map::HashMap;
use super::error::Cause;
use super::lock::{Mutex, Rank};
use super::staticlist::{StaticList, Slotted};
use super::world::WorldID;

/* table sizes and structural limits */
pub const SCHED_GROUPS_MAX: usize = 64;
pub const SCHED_NODES_MAX: usize = 192;
pub const SCHED_NODE_DEPTH_MAX: usize = 8;
pub const SCHED_GROUP_NAME_MAX: usize = 32;
pub const SCHED_GROUP_MEMBERS_MAX: usize = 64;

/* group IDs encode the table slot in the low bits and the slot's
   generation above them */
pub type GroupID = u32;
const GROUP_SLOT_BITS: u32 = 8;
const GROUP_SLOT_MASK: u32 = (1 << GROUP_SLOT_BITS) - 1;

pub type NodeIdx = usize;

/* group flags */
pub const GROUP_FLAG_LEAF: u32           = 1 << 0; /* may hold VM members only, no subgroups */
pub const GROUP_FLAG_PREDEFINED: u32     = 1 << 1; /* created at boot, never removable */
pub const GROUP_FLAG_VM: u32             = 1 << 2; /* container for exactly one VM's worlds */
pub const GROUP_FLAG_MEMSCHED_CLIENT: u32 = 1 << 3; /* participates in memory scheduling */
pub const GROUP_FLAG_SYSTEM: u32         = 1 << 4; /* hypervisor-internal workloads */
pub const GROUP_FLAG_SELF_DESTRUCT: u32  = 1 << 5; /* reap when the last member leaves */

/* units an allocation can be expressed in. base shares are the
   internal currency; the others convert through it */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareUnits
{
    Percent,
    Mhz,
    Mb,
    Pages,
    Bshares
}

/* CPU allocation of a group or vsmp. min and max are percent of a
   single pcpu (so 100 = one full pcpu, 0 max = no ceiling) */
#[derive(Debug, Clone, Copy)]
pub struct CpuAlloc
{
    pub min: u32,
    pub max: u32,
    pub shares: u32,
    pub units: ShareUnits
}

impl CpuAlloc
{
    pub const fn new(min: u32, max: u32, shares: u32) -> CpuAlloc
    {
        CpuAlloc { min, max, shares, units: ShareUnits::Bshares }
    }
}

impl Default for CpuAlloc
{
    fn default() -> CpuAlloc { CpuAlloc::new(0, 0, 1000) }
}

/* memory allocation, in pages. 0 max / hard_max = no ceiling */
#[derive(Debug, Clone, Copy, Default)]
pub struct MemAlloc
{
    pub min: u32,
    pub max: u32,
    pub shares: u32,
    pub min_limit: u32,
    pub hard_max: u32
}

/* convert base shares into the requested units.
   => shares = amount in base shares
      units = target units
      per_unit = base shares that one target unit is worth
   <= amount in target units, or error for a zero conversion rate */
pub fn base_shares_to_units(shares: u32, units: ShareUnits, per_unit: u32) -> Result<u32, Cause>
{
    match units
    {
        ShareUnits::Bshares => Ok(shares),
        _ if per_unit == 0 => Err(Cause::MemBadUnits),
        _ => Ok(shares / per_unit)
    }
}

/* convert an amount in the given units back into base shares */
pub fn units_to_base_shares(amount: u32, units: ShareUnits, per_unit: u32) -> Result<u32, Cause>
{
    match units
    {
        ShareUnits::Bshares => Ok(amount),
        _ if per_unit == 0 => Err(Cause::MemBadUnits),
        _ => amount.checked_mul(per_unit).ok_or(Cause::BadArgument)
    }
}

/* a node is a position in some group's member list */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeContent
{
    Invalid,
    Vm(WorldID),
    Group(usize)    /* group table slot */
}

#[derive(Debug, Clone, Copy)]
pub struct Node
{
    pub content: NodeContent,
    pub parent: Option<usize>   /* group table slot of the containing group */
}

/* member-list entry. caches its own list position so detach is O(1) */
struct Member
{
    node: NodeIdx,
    back: usize
}

impl Slotted for Member
{
    fn set_slot(&mut self, slot: usize) { self.back = slot; }
}

pub struct Group
{
    id: GroupID,
    name: String,
    flags: u32,
    refcount: u32,
    removed: bool,
    node: NodeIdx,      /* the node placing this group in its parent */
    members: StaticList<Member, SCHED_GROUP_MEMBERS_MAX>,
    pub cpu: CpuAlloc,
    pub mem: MemAlloc,
    /* CPU min reservations held by VMs attached to this group,
       counted against the group's own min at admission */
    vm_reserved_min: u64
}

impl Group
{
    pub fn id(&self) -> GroupID { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn flags(&self) -> u32 { self.flags }
    pub fn is_removed(&self) -> bool { self.removed }
    pub fn member_count(&self) -> usize { self.members.len() }
}

struct GroupSlot
{
    generation: u32,
    group: Option<Group>
}

pub struct SchedTree
{
    groups: Vec<GroupSlot>,
    nodes: Vec<Node>,
    root: usize,                        /* group slot of the root */
    world_nodes: HashMap<WorldID, NodeIdx>,
    name_seq: u32
}

/* groups created at boot. the root and its non-removable children
   get the same slots, and so the same IDs, on every boot */
const PREDEFINED_GROUPS: &[(&str, Option<&str>, u32)] =
&[
    ("root",        None,           0),
    ("idle",        Some("root"),   GROUP_FLAG_SYSTEM),
    ("system",      Some("root"),   GROUP_FLAG_SYSTEM),
    ("local",       Some("root"),   0),
    ("cluster",     Some("local"),  0),
    ("uw-nursery",  Some("local"),  GROUP_FLAG_SELF_DESTRUCT | GROUP_FLAG_LEAF),
    ("helper",      Some("system"), GROUP_FLAG_SYSTEM),
    ("drivers",     Some("system"), GROUP_FLAG_SYSTEM)
];

lazy_static!
{
    static ref TREE: Mutex<SchedTree> = Mutex::new("scheduler group tree", Rank::SchedTree, SchedTree::new());
}

/* build the predefined tree. called once at boot before any world exists */
pub fn init() -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    tree.reset();
    for &(name, parent, flags) in PREDEFINED_GROUPS.iter()
    {
        let parent_id = match parent
        {
            Some(parent_name) => Some(tree.lookup_name(parent_name).ok_or(Cause::TreeGroupNotFound)?),
            None => None
        };
        tree.create_group(Some(name), parent_id, flags | GROUP_FLAG_PREDEFINED,
            CpuAlloc::default(), MemAlloc::default())?;
    }
    Ok(())
}

impl SchedTree
{
    fn new() -> SchedTree
    {
        let mut tree = SchedTree
        {
            groups: Vec::new(),
            nodes: Vec::new(),
            root: 0,
            world_nodes: HashMap::new(),
            name_seq: 0
        };
        tree.reset();
        tree
    }

    fn reset(&mut self)
    {
        self.groups.clear();
        self.nodes.clear();
        for _ in 0..SCHED_GROUPS_MAX
        {
            self.groups.push(GroupSlot { generation: 0, group: None });
        }
        for _ in 0..SCHED_NODES_MAX
        {
            self.nodes.push(Node { content: NodeContent::Invalid, parent: None });
        }
        self.world_nodes.clear();
        self.name_seq = 0;
    }

    /* ---- ID and slot plumbing ------------------------------------- */

    fn encode_id(slot: usize, generation: u32) -> GroupID
    {
        (generation << GROUP_SLOT_BITS) | (slot as u32 & GROUP_SLOT_MASK)
    }

    fn id_slot(id: GroupID) -> usize
    {
        (id & GROUP_SLOT_MASK) as usize
    }

    /* resolve an ID to its slot, checking the generation still matches */
    fn slot_of(&self, id: GroupID) -> Result<usize, Cause>
    {
        let slot = SchedTree::id_slot(id);
        match self.groups.get(slot)
        {
            Some(entry) if entry.group.is_some() && SchedTree::encode_id(slot, entry.generation) == id => Ok(slot),
            _ => Err(Cause::TreeGroupNotFound)
        }
    }

    pub fn group(&self, id: GroupID) -> Result<&Group, Cause>
    {
        let slot = self.slot_of(id)?;
        Ok(self.groups[slot].group.as_ref().unwrap())
    }

    fn group_mut(&mut self, id: GroupID) -> Result<&mut Group, Cause>
    {
        let slot = self.slot_of(id)?;
        Ok(self.groups[slot].group.as_mut().unwrap())
    }

    fn group_at(&self, slot: usize) -> &Group
    {
        self.groups[slot].group.as_ref().unwrap()
    }

    fn group_at_mut(&mut self, slot: usize) -> &mut Group
    {
        self.groups[slot].group.as_mut().unwrap()
    }

    pub fn root_id(&self) -> GroupID
    {
        self.group_at(self.root).id
    }

    pub fn lookup_name(&self, name: &str) -> Option<GroupID>
    {
        for entry in self.groups.iter()
        {
            if let Some(group) = &entry.group
            {
                if !group.removed && group.name == name
                {
                    return Some(group.id);
                }
            }
        }
        None
    }

    /* ---- structure queries ----------------------------------------- */

    fn free_node(&self) -> Result<NodeIdx, Cause>
    {
        self.nodes.iter().position(|n| n.content == NodeContent::Invalid).ok_or(Cause::TreeTableFull)
    }

    /* depth of a group measured in groups from the root (root = 1) */
    fn depth_of(&self, slot: usize) -> usize
    {
        let mut depth = 1;
        let mut at = slot;
        while let Some(parent) = self.nodes[self.group_at(at).node].parent
        {
            depth = depth + 1;
            at = parent;
            if depth > SCHED_NODE_DEPTH_MAX
            {
                break;
            }
        }
        depth
    }

    /* greatest depth of any group within the given subtree, relative to the root */
    fn subtree_max_depth(&self, slot: usize) -> usize
    {
        let mut deepest = self.depth_of(slot);
        for member in self.group_at(slot).members.iter()
        {
            if let NodeContent::Group(child) = self.nodes[member.node].content
            {
                deepest = core::cmp::max(deepest, self.subtree_max_depth(child));
            }
        }
        deepest
    }

    /* true if maybe_descendant sits somewhere under ancestor */
    fn is_descendant(&self, ancestor: usize, maybe_descendant: usize) -> bool
    {
        let mut at = maybe_descendant;
        loop
        {
            if at == ancestor
            {
                return true;
            }
            match self.nodes[self.group_at(at).node].parent
            {
                Some(parent) => at = parent,
                None => return false
            }
        }
    }

    /* the chain of group IDs from the root down to the given group */
    pub fn path_of(&self, id: GroupID) -> Result<([GroupID; SCHED_NODE_DEPTH_MAX], usize), Cause>
    {
        let mut slot = self.slot_of(id)?;
        let mut reversed: Vec<usize> = Vec::new();
        loop
        {
            reversed.push(slot);
            match self.nodes[self.group_at(slot).node].parent
            {
                Some(parent) => slot = parent,
                None => break
            }
        }

        if reversed.len() > SCHED_NODE_DEPTH_MAX
        {
            return Err(Cause::TreeDepthLimit);
        }

        let mut path = [0 as GroupID; SCHED_NODE_DEPTH_MAX];
        let depth = reversed.len();
        for (at, slot) in reversed.iter().rev().enumerate()
        {
            path[at] = self.group_at(*slot).id;
        }
        Ok((path, depth))
    }

    pub fn group_of_world(&self, leader: WorldID) -> Option<GroupID>
    {
        let node = *self.world_nodes.get(&leader)?;
        let parent = self.nodes[node].parent?;
        Some(self.group_at(parent).id)
    }

    /* ---- admission ------------------------------------------------- */

    /* sum of direct members' CPU min reservations, skipping one node */
    fn members_cpu_min(&self, slot: usize, skip: Option<NodeIdx>) -> u64
    {
        let mut total = 0u64;
        for member in self.group_at(slot).members.iter()
        {
            if Some(member.node) == skip
            {
                continue;
            }
            if let NodeContent::Group(child) = self.nodes[member.node].content
            {
                total = total + self.group_at(child).cpu.min as u64;
            }
        }
        total
    }

    fn members_mem_min(&self, slot: usize, skip: Option<NodeIdx>) -> u64
    {
        let mut total = 0u64;
        for member in self.group_at(slot).members.iter()
        {
            if Some(member.node) == skip
            {
                continue;
            }
            if let NodeContent::Group(child) = self.nodes[member.node].content
            {
                total = total + self.group_at(child).mem.min as u64;
            }
        }
        total
    }

    /* would placing a subtree with the given reservations under parent
       still satisfy the parent's guarantees? checked before any
       destructive step so failures need no rollback */
    fn admit_cpu(&self, parent: usize, incoming_min: u32, skip: Option<NodeIdx>) -> Result<(), Cause>
    {
        let group = self.group_at(parent);
        let headroom = group.cpu.min;
        if headroom > 0
            && self.members_cpu_min(parent, skip) + group.vm_reserved_min + incoming_min as u64 > headroom as u64
        {
            return Err(Cause::AdmissionDeniedCpu);
        }
        Ok(())
    }

    fn admit_mem(&self, parent: usize, incoming: &MemAlloc, skip: Option<NodeIdx>) -> Result<(), Cause>
    {
        let parent_mem = self.group_at(parent).mem;

        /* a child's reservation must fit in the parent's, and a child's
           hard ceiling may not exceed the parent's */
        if parent_mem.min > 0 && self.members_mem_min(parent, skip) + incoming.min as u64 > parent_mem.min as u64
        {
            return Err(Cause::AdmissionDeniedMem);
        }
        if parent_mem.hard_max > 0 && incoming.hard_max > parent_mem.hard_max
        {
            return Err(Cause::AdmissionDeniedMem);
        }
        if incoming.max > 0 && incoming.min > incoming.max
        {
            return Err(Cause::AdmissionDeniedMem);
        }
        Ok(())
    }

    /* ---- mutation -------------------------------------------------- */

    /* allocate a group slot, wire its node under the parent, and fill it in.
       parent = None only for the root */
    fn create_group(&mut self, name: Option<&str>, parent: Option<GroupID>, flags: u32,
        cpu: CpuAlloc, mem: MemAlloc) -> Result<GroupID, Cause>
    {
        let name = match name
        {
            Some(given) =>
            {
                if given.len() > SCHED_GROUP_NAME_MAX || given.is_empty()
                {
                    return Err(Cause::TreeNameTooLong);
                }
                if self.lookup_name(given).is_some()
                {
                    return Err(Cause::TreeNameTaken);
                }
                String::from(given)
            },
            None =>
            {
                /* generate a fresh sched-N name */
                loop
                {
                    self.name_seq = self.name_seq + 1;
                    let generated = format!("sched-{}", self.name_seq);
                    if self.lookup_name(&generated).is_none()
                    {
                        break generated;
                    }
                }
            }
        };

        let parent_slot = match parent
        {
            Some(id) =>
            {
                let slot = self.slot_of(id)?;
                let parent_group = self.group_at(slot);
                if parent_group.flags & GROUP_FLAG_LEAF != 0
                {
                    return Err(Cause::TreeBadParent);
                }
                if self.depth_of(slot) + 1 > SCHED_NODE_DEPTH_MAX
                {
                    return Err(Cause::TreeDepthLimit);
                }
                self.admit_cpu(slot, cpu.min, None)?;
                self.admit_mem(slot, &mem, None)?;
                Some(slot)
            },
            None => None
        };

        let slot = self.groups.iter().position(|entry| entry.group.is_none()).ok_or(Cause::TreeTableFull)?;
        let node = self.free_node()?;

        let generation = self.groups[slot].generation + 1;
        let id = SchedTree::encode_id(slot, generation);

        self.nodes[node] = Node { content: NodeContent::Group(slot), parent: parent_slot };
        if let Some(parent_slot) = parent_slot
        {
            match self.group_at_mut(parent_slot).members.push_slotted(Member { node, back: 0 })
            {
                Ok(_) => (),
                Err(e) =>
                {
                    /* hand the node back before reporting the full member list */
                    self.nodes[node] = Node { content: NodeContent::Invalid, parent: None };
                    return Err(e);
                }
            }
        }
        else
        {
            self.root = slot;
        }

        self.groups[slot].generation = generation;
        self.groups[slot].group = Some(Group
        {
            id,
            name,
            flags,
            refcount: 0,
            removed: false,
            node,
            members: StaticList::new(),
            cpu,
            mem,
            vm_reserved_min: 0
        });
        Ok(id)
    }

    /* detach a node from its parent's member list */
    fn detach(&mut self, node: NodeIdx)
    {
        if let Some(parent) = self.nodes[node].parent
        {
            self.group_at_mut(parent).members.remove_matching(|member| member.node == node);
            self.nodes[node].parent = None;
        }
    }

    /* attach a node under a group */
    fn attach(&mut self, node: NodeIdx, parent: usize) -> Result<(), Cause>
    {
        self.group_at_mut(parent).members.push_slotted(Member { node, back: 0 })?;
        self.nodes[node].parent = Some(parent);
        Ok(())
    }

    /* release a group's slot once it is removed and unreferenced */
    fn reap(&mut self, slot: usize)
    {
        let node = self.group_at(slot).node;
        self.nodes[node] = Node { content: NodeContent::Invalid, parent: None };
        self.groups[slot].group = None;
        hvdebug!("reaped group slot {}", slot);
    }

    fn remove_group(&mut self, id: GroupID) -> Result<(), Cause>
    {
        let slot = self.slot_of(id)?;
        {
            let group = self.group_at(slot);
            if group.flags & GROUP_FLAG_PREDEFINED != 0
            {
                return Err(Cause::TreeGroupPredefined);
            }
            if group.member_count() != 0
            {
                return Err(Cause::TreeGroupBusy);
            }
            if group.removed
            {
                return Err(Cause::TreeGroupNotFound);
            }
        }

        let node = self.group_at(slot).node;
        self.detach(node);
        self.group_at_mut(slot).removed = true;

        if self.group_at(slot).refcount == 0
        {
            self.reap(slot);
        }
        Ok(())
    }

    fn join_group(&mut self, leader: WorldID, id: GroupID) -> Result<(), Cause>
    {
        if self.world_nodes.contains_key(&leader)
        {
            return Err(Cause::SchedWorldExists);
        }

        let slot = self.slot_of(id)?;
        if self.group_at(slot).removed
        {
            return Err(Cause::TreeGroupNotFound);
        }

        let node = self.free_node()?;
        self.nodes[node] = Node { content: NodeContent::Vm(leader), parent: None };
        match self.attach(node, slot)
        {
            Ok(()) => (),
            Err(e) =>
            {
                self.nodes[node] = Node { content: NodeContent::Invalid, parent: None };
                return Err(e);
            }
        }
        self.world_nodes.insert(leader, node);
        Ok(())
    }

    fn leave_group(&mut self, leader: WorldID) -> Result<(), Cause>
    {
        let node = *self.world_nodes.get(&leader).ok_or(Cause::TreeNotMember)?;
        let parent = self.nodes[node].parent;
        self.detach(node);
        self.nodes[node] = Node { content: NodeContent::Invalid, parent: None };
        self.world_nodes.remove(&leader);

        /* self-destructing groups go down with their last member */
        if let Some(parent_slot) = parent
        {
            let (flags, members, id) =
            {
                let group = self.group_at(parent_slot);
                (group.flags, group.member_count(), group.id)
            };
            if flags & GROUP_FLAG_SELF_DESTRUCT != 0
                && flags & GROUP_FLAG_PREDEFINED == 0
                && members == 0
            {
                let _ = self.remove_group(id);
            }
        }
        Ok(())
    }

    fn move_group(&mut self, id: GroupID, new_parent: GroupID) -> Result<(), Cause>
    {
        let slot = self.slot_of(id)?;
        let parent_slot = self.slot_of(new_parent)?;

        if self.group_at(slot).flags & GROUP_FLAG_PREDEFINED != 0
        {
            return Err(Cause::TreeGroupPredefined);
        }
        if self.group_at(parent_slot).flags & GROUP_FLAG_LEAF != 0
            || self.group_at(parent_slot).flags & GROUP_FLAG_SELF_DESTRUCT != 0
        {
            return Err(Cause::TreeBadParent);
        }
        /* a group cannot move under itself or its own descendants */
        if self.is_descendant(slot, parent_slot)
        {
            return Err(Cause::TreeBadParent);
        }

        let node = self.group_at(slot).node;
        let old_parent = self.nodes[node].parent;
        if old_parent == Some(parent_slot)
        {
            return Ok(());
        }

        /* depth of the subtree being moved, as levels below its own root */
        let subtree_levels = self.subtree_max_depth(slot) - self.depth_of(slot);
        if self.depth_of(parent_slot) + 1 + subtree_levels > SCHED_NODE_DEPTH_MAX
        {
            return Err(Cause::TreeDepthLimit);
        }

        /* both admissions pass before anything is touched, so a failure
           here leaves the tree exactly as it was */
        let cpu_min = self.group_at(slot).cpu.min;
        let mem = self.group_at(slot).mem;
        self.admit_cpu(parent_slot, cpu_min, Some(node))?;
        self.admit_mem(parent_slot, &mem, Some(node))?;

        self.detach(node);
        match self.attach(node, parent_slot)
        {
            Ok(()) => Ok(()),
            Err(e) =>
            {
                /* member list full: restore the original parent */
                if let Some(old) = old_parent
                {
                    let _ = self.attach(node, old);
                }
                Err(e)
            }
        }
    }

    /* ---- §8 invariants, used by tests and debug checks ------------- */

    /* every member's parent backref resolves to its containing group,
       every VM node reaches the root through valid groups, and no
       node is deeper than the depth bound */
    pub fn validate(&self) -> bool
    {
        for (slot, entry) in self.groups.iter().enumerate()
        {
            let group = match &entry.group
            {
                Some(group) => group,
                None => continue
            };

            if self.depth_of(slot) > SCHED_NODE_DEPTH_MAX
            {
                return false;
            }

            for member in group.members.iter()
            {
                if self.nodes[member.node].parent != Some(slot)
                {
                    return false;
                }
            }
        }

        for (leader, node) in self.world_nodes.iter()
        {
            if self.nodes[*node].content != NodeContent::Vm(*leader)
            {
                return false;
            }
            let mut at = self.nodes[*node].parent;
            let mut hops = 0;
            while let Some(parent) = at
            {
                at = self.nodes[self.group_at(parent).node].parent;
                hops = hops + 1;
                if hops > SCHED_NODE_DEPTH_MAX
                {
                    return false;
                }
            }
        }
        true
    }
}

/* ---- public entry points, all serialized by the tree lock ---------- */

/* create a new group.
   => name = group name, or None to auto-generate one
      parent = group to create under
      flags = GROUP_FLAG_* bits
      cpu, mem = initial allocations, admission-checked against the parent
   <= new group's ID, or error code */
pub fn add_group(name: Option<&str>, parent: GroupID, flags: u32, cpu: CpuAlloc, mem: MemAlloc) -> Result<GroupID, Cause>
{
    TREE.lock().create_group(name, Some(parent), flags & !GROUP_FLAG_PREDEFINED, cpu, mem)
}

/* remove a group. it must be empty and not predefined. the slot is
   reused once the last external reference is dropped */
pub fn remove_group(id: GroupID) -> Result<(), Cause>
{
    TREE.lock().remove_group(id)
}

pub fn rename_group(id: GroupID, name: &str) -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    if name.len() > SCHED_GROUP_NAME_MAX || name.is_empty()
    {
        return Err(Cause::TreeNameTooLong);
    }
    if tree.lookup_name(name).is_some()
    {
        return Err(Cause::TreeNameTaken);
    }

    let group = tree.group_mut(id)?;
    if group.flags & GROUP_FLAG_PREDEFINED != 0
    {
        return Err(Cause::TreeGroupPredefined);
    }
    group.name = String::from(name);
    Ok(())
}

/* re-parent a group. admission runs against the new parent before any
   change is made; on failure the tree is untouched */
pub fn move_group(id: GroupID, new_parent: GroupID) -> Result<(), Cause>
{
    TREE.lock().move_group(id, new_parent)
}

/* attach a VM leader world as a leaf of the given group */
pub fn join_group(leader: WorldID, id: GroupID) -> Result<(), Cause>
{
    TREE.lock().join_group(leader, id)
}

/* detach a VM leader world from its group */
pub fn leave_group(leader: WorldID) -> Result<(), Cause>
{
    TREE.lock().leave_group(leader)
}

/* atomic allocation-preserving move of a VM to a new group: park the
   VM's CPU allocation in a scratch child of the destination, move the
   VM, then collapse the scratch group again. the whole dance happens
   under one hold of the tree lock.
   => leader = VM's group-leader world
      new_parent = destination group
      cpu = the VM's current CPU allocation, carried through admission
   <= Ok, or error code with the tree unchanged */
pub fn change_group(leader: WorldID, new_parent: GroupID, cpu: CpuAlloc) -> Result<(), Cause>
{
    let mut tree = TREE.lock();

    let node = *tree.world_nodes.get(&leader).ok_or(Cause::TreeNotMember)?;
    let parent_slot = tree.slot_of(new_parent)?;
    if tree.group_at(parent_slot).flags & GROUP_FLAG_LEAF != 0
    {
        return Err(Cause::TreeBadParent);
    }

    /* the scratch group carries the VM's allocation through admission:
       if the destination cannot take the reservation, this fails here
       with nothing moved */
    let scratch = tree.create_group(None, Some(new_parent), GROUP_FLAG_SELF_DESTRUCT,
        cpu, MemAlloc::default())?;

    let old_parent = tree.nodes[node].parent;
    tree.detach(node);
    match tree.attach(node, parent_slot)
    {
        Ok(()) => (),
        Err(e) =>
        {
            /* put the VM back where it was before reporting */
            if let Some(old) = old_parent
            {
                let _ = tree.attach(node, old);
            }
            let _ = tree.remove_group(scratch);
            return Err(e);
        }
    }

    let _ = tree.remove_group(scratch);
    Ok(())
}

/* iterate over every live group under the tree lock */
pub fn for_all_groups<F: FnMut(GroupID, &Group)>(mut callback: F)
{
    let tree = TREE.lock();
    for entry in tree.groups.iter()
    {
        if let Some(group) = &entry.group
        {
            if !group.removed
            {
                callback(group.id, group);
            }
        }
    }
}

/* pin a group across a drop of the tree lock. a removed group's slot
   is not recycled while references remain */
pub fn add_reference(id: GroupID) -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    let group = tree.group_mut(id)?;
    group.refcount = group.refcount + 1;
    Ok(())
}

pub fn remove_reference(id: GroupID)
{
    let mut tree = TREE.lock();
    if let Ok(slot) = tree.slot_of(id)
    {
        let reap_now =
        {
            let group = tree.group_at_mut(slot);
            group.refcount = group.refcount.saturating_sub(1);
            group.removed && group.refcount == 0
        };
        if reap_now
        {
            tree.reap(slot);
        }
    }
}

/* update a group's CPU allocation, re-admitting against its parent */
pub fn set_cpu_alloc(id: GroupID, cpu: CpuAlloc) -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    let slot = tree.slot_of(id)?;
    let node = tree.group_at(slot).node;
    if let Some(parent) = tree.nodes[node].parent
    {
        tree.admit_cpu(parent, cpu.min, Some(node))?;
    }
    tree.group_at_mut(slot).cpu = cpu;
    Ok(())
}

/* update a group's memory allocation, re-admitting against its parent */
pub fn set_mem_alloc(id: GroupID, mem: MemAlloc) -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    let slot = tree.slot_of(id)?;
    let node = tree.group_at(slot).node;
    if let Some(parent) = tree.nodes[node].parent
    {
        tree.admit_mem(parent, &mem, Some(node))?;
    }
    tree.group_at_mut(slot).mem = mem;
    Ok(())
}

/* admit a VM's CPU reservation against its group. the CPU scheduler
   calls this before a world may be scheduled; failure means the
   group cannot guarantee the requested minimum */
pub fn reserve_vm_cpu(id: GroupID, min: u32) -> Result<(), Cause>
{
    let mut tree = TREE.lock();
    let slot = tree.slot_of(id)?;

    let group = tree.group_at(slot);
    if group.cpu.min > 0
        && tree.members_cpu_min(slot, None) + group.vm_reserved_min + min as u64 > group.cpu.min as u64
    {
        return Err(Cause::AdmissionDeniedCpu);
    }

    let group = tree.group_at_mut(slot);
    group.vm_reserved_min = group.vm_reserved_min + min as u64;
    Ok(())
}

/* hand a VM's reservation back when it is removed or re-reserved */
pub fn unreserve_vm_cpu(id: GroupID, min: u32)
{
    let mut tree = TREE.lock();
    if let Ok(slot) = tree.slot_of(id)
    {
        let group = tree.group_at_mut(slot);
        group.vm_reserved_min = group.vm_reserved_min.saturating_sub(min as u64);
    }
}

/* convenience lookups */
pub fn lookup_name(name: &str) -> Option<GroupID>
{
    TREE.lock().lookup_name(name)
}

pub fn root_id() -> GroupID
{
    TREE.lock().root_id()
}

pub fn group_of_world(leader: WorldID) -> Option<GroupID>
{
    TREE.lock().group_of_world(leader)
}

pub fn path_of(id: GroupID) -> Result<([GroupID; SCHED_NODE_DEPTH_MAX], usize), Cause>
{
    TREE.lock().path_of(id)
}

pub fn cpu_alloc_of(id: GroupID) -> Result<CpuAlloc, Cause>
{
    Ok(TREE.lock().group(id)?.cpu)
}

pub fn mem_alloc_of(id: GroupID) -> Result<MemAlloc, Cause>
{
    Ok(TREE.lock().group(id)?.mem)
}

pub fn validate() -> bool
{
    TREE.lock().validate()
}
