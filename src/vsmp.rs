/* diosix scheduler virtual SMP units
 *
 * A vsmp is the scheduling unit for one VM: the ordered set of its
 * virtual CPUs plus everything the schedulers decide with per-VM.
 * virtual time and stride for the proportional-share competition,
 * co-scheduling state and skew, hyperthread sharing preference and
 * quarantine, and the NUMA residency record the placement
 * controller works from. a vsmp lives inside exactly one scheduler
 * cell and is mutated under that cell's lock.
 *
 * (c) Chris Williams, 2021.
 *
 * See LICENSE for usage and copying.
 */

use alloc::vec::Vec;
use super::error::Cause;
use super::vcore::{Vcore, RunState};
use super::tree::{GroupID, CpuAlloc, SCHED_NODE_DEPTH_MAX};
use super::hardware::{self, PcpuID, PcpuMask, CycleCount, NodeID, NUMA_NODES_MAX};
use super::world::WorldID;

pub const VSMP_VCPUS_MAX: usize = 32;

/* one unit of virtual time is this many stride-units; stride is
   STRIDE1/shares so bigger shares mean slower virtual time */
pub const STRIDE1: u64 = 1 << 20;

/* co-descheduling fires when the fastest vcpu gets this many
   milliseconds ahead of the slowest */
pub const COSCHED_SKEW_MS: u64 = 5;

/* without strict co-scheduling, a vsmp may start with this fraction
   of its vcpus placeable: ceil(n/2) */
pub fn cosched_quorum(vcpus: usize) -> usize
{
    (vcpus + 1) / 2
}

/* hyperthread quarantine: tighten the sharing preference when the
   fast-decay event count passes this */
const HT_QUARANTINE_THRESHOLD: u64 = 64;
/* and release it when the slow-decay count falls back below this */
const HT_RELEASE_THRESHOLD: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoRunState
{
    None,
    Run,
    Ready,
    Stop
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtSharing
{
    Any,        /* no constraint */
    Internal,   /* share a package only with vcpus of the same vsmp */
    None        /* demand a whole package */
}

/* what a new vsmp looks like */
#[derive(Clone)]
pub struct VsmpConfig
{
    pub vcpus: usize,
    /* one mask applied to every vcpu, or one mask per vcpu */
    pub affinity: Vec<PcpuMask>,
    pub ht_sharing: HtSharing,
    pub strict_cosched: bool,
    pub alloc: CpuAlloc,
    pub group: GroupID,
    pub is_vm: bool,
    /* hard memory affinity pins the VM's pages and makes it
       unmanageable by the placement controller */
    pub mem_affinity: Option<NodeID>
}

/* per-vsmp virtual time context */
#[derive(Debug, Clone, Copy)]
pub struct VtimeContext
{
    pub main: u64,
    pub limit: u64,         /* secondary virtual time enforcing max */
    pub stride: u64,
    pub stride_limit: u64,  /* 0 = no ceiling */
    pub path: [GroupID; SCHED_NODE_DEPTH_MAX],
    pub path_len: usize
}

impl VtimeContext
{
    pub fn new(alloc: &CpuAlloc, path: [GroupID; SCHED_NODE_DEPTH_MAX], path_len: usize) -> VtimeContext
    {
        VtimeContext
        {
            main: 0,
            limit: 0,
            stride: stride_for_shares(alloc.shares),
            stride_limit: stride_for_max(alloc.max),
            path,
            path_len
        }
    }
}

/* stride per millisecond of service for a shares weighting */
pub fn stride_for_shares(shares: u32) -> u64
{
    STRIDE1 / core::cmp::max(shares, 1) as u64
}

/* stride for the max-rate limit: max is percent of one pcpu, so a
   50% cap advances the limit clock at twice real time. 0 = no cap */
pub fn stride_for_max(max: u32) -> u64
{
    if max == 0
    {
        0
    }
    else
    {
        STRIDE1 * 100 / max as u64
    }
}

/* NUMA residency record for one vsmp */
#[derive(Debug, Clone, Copy)]
pub struct NumaClientInfo
{
    pub home: Option<NodeID>,
    /* set when hard CPU affinity confines the vsmp to one node */
    pub mandatory_home: Option<NodeID>,
    pub short_term: [u32; NUMA_NODES_MAX],
    pub long_term: [u32; NUMA_NODES_MAX],
    pub short_samples: u32,
    pub just_migrated: bool,
    pub n_balance_mig: u64,
    pub n_locality_swap: u64,
    pub mig_rate: u32,
    /* nodes we've already asked the VMM to migrate toward */
    pub last_mon_mig_mask: u64
}

/* fold short-term node residency into the long-term estimate every
   this many samples */
pub const SHORT_TERM_SAMPLES: u32 = 16;

impl NumaClientInfo
{
    pub fn new() -> NumaClientInfo
    {
        NumaClientInfo
        {
            home: None,
            mandatory_home: None,
            short_term: [0; NUMA_NODES_MAX],
            long_term: [0; NUMA_NODES_MAX],
            short_samples: 0,
            just_migrated: false,
            n_balance_mig: 0,
            n_locality_swap: 0,
            mig_rate: 0,
            last_mon_mig_mask: 0
        }
    }

    /* note one residency sample on the given node */
    pub fn observe(&mut self, node: NodeID)
    {
        self.short_term[node] = self.short_term[node] + 1;
        self.short_samples = self.short_samples + 1;
        if self.short_samples >= SHORT_TERM_SAMPLES
        {
            /* halve the long-term counts and fold in the short term,
               giving an exponentially weighted residency estimate */
            for at in 0..NUMA_NODES_MAX
            {
                self.long_term[at] = self.long_term[at] / 2 + self.short_term[at];
                self.short_term[at] = 0;
            }
            self.short_samples = 0;
        }
    }
}

pub struct Vsmp
{
    pub leader: WorldID,
    pub vcores: Vec<Vcore>,
    pub joint_affinity: bool,
    pub is_vm: bool,
    pub mem_affinity: Option<NodeID>,

    /* hyperthread sharing: what was asked for, what is currently
       enforced, and how often quarantine has tightened it */
    pub ht_configured: HtSharing,
    pub ht_sharing: HtSharing,
    pub ht_quarantine_count: u64,

    pub strict_cosched: bool,
    pub alloc: CpuAlloc,
    pub vtime: VtimeContext,
    pub co_state: CoRunState,

    pub numa: NumaClientInfo,
    pub group: GroupID,

    /* destination cell of a drained migration, applied once every
       vcpu is off a pcpu */
    pub pending_cell: Option<usize>,

    pub costop_count: u64,
    pub corun_count: u64
}

impl Vsmp
{
    /* build a vsmp and its vcores from a validated config.
       => leader = VM's group-leader world ID
          config = shape of the VM
          path, path_len = group path from the tree
          now = current cycle count
       <= vsmp, or error code */
    pub fn new(leader: WorldID, config: &VsmpConfig,
        path: [GroupID; SCHED_NODE_DEPTH_MAX], path_len: usize, now: CycleCount) -> Result<Vsmp, Cause>
    {
        if config.vcpus == 0 || config.vcpus > VSMP_VCPUS_MAX
        {
            return Err(Cause::SchedTooManyVcpus);
        }
        if config.affinity.len() != 1 && config.affinity.len() != config.vcpus
        {
            return Err(Cause::SchedBadAffinity);
        }

        let machine = hardware::all_pcpus_mask(hardware::topology().pcpu_count);
        let mut vcores = Vec::new();
        for vcpu in 0..config.vcpus
        {
            let mask = if config.affinity.len() == 1 { config.affinity[0] } else { config.affinity[vcpu] };
            if mask & machine == 0
            {
                return Err(Cause::SchedBadAffinity);
            }
            vcores.push(Vcore::new(leader, vcpu, mask & machine, now));
        }

        let joint = vcores.windows(2).all(|pair| pair[0].affinity == pair[1].affinity);

        Ok(Vsmp
        {
            leader,
            vcores,
            joint_affinity: joint,
            is_vm: config.is_vm,
            mem_affinity: config.mem_affinity,
            ht_configured: config.ht_sharing,
            ht_sharing: config.ht_sharing,
            ht_quarantine_count: 0,
            strict_cosched: config.strict_cosched,
            alloc: config.alloc,
            vtime: VtimeContext::new(&config.alloc, path, path_len),
            co_state: CoRunState::None,
            numa: NumaClientInfo::new(),
            group: config.group,
            pending_cell: None,
            costop_count: 0,
            corun_count: 0
        })
    }

    pub fn vcpu_count(&self) -> usize { self.vcores.len() }

    /* joint affinity means every vcpu shares one identical mask */
    pub fn recompute_joint_affinity(&mut self)
    {
        self.joint_affinity = self.vcores.windows(2).all(|pair| pair[0].affinity == pair[1].affinity);
    }

    /* spread between the fastest and slowest vcpu since the last
       co-start, in cycles */
    pub fn skew_cycles(&self) -> CycleCount
    {
        let mut fastest = 0;
        let mut slowest = CycleCount::MAX;
        for vcore in self.vcores.iter()
        {
            fastest = core::cmp::max(fastest, vcore.corun_cycles);
            slowest = core::cmp::min(slowest, vcore.corun_cycles);
        }
        fastest.saturating_sub(slowest)
    }

    pub fn reset_skew(&mut self)
    {
        for vcore in self.vcores.iter_mut()
        {
            vcore.corun_cycles = 0;
        }
    }

    /* how many vcpus could run right now: running, or queued ready */
    pub fn runnable_vcpus(&self) -> usize
    {
        self.vcores.iter().filter(|v| v.is_ready() || v.is_running()).count()
    }

    pub fn running_vcpus(&self) -> usize
    {
        self.vcores.iter().filter(|v| v.is_running()).count()
    }

    /* no vcpu on a pcpu: required before cross-cell migration */
    pub fn is_quiesced(&self) -> bool
    {
        self.running_vcpus() == 0
    }

    /* the number of placeable vcpus needed before this vsmp may
       co-start */
    pub fn required_quorum(&self) -> usize
    {
        if self.strict_cosched
        {
            self.vcpu_count()
        }
        else
        {
            cosched_quorum(self.vcpu_count())
        }
    }

    /* true if this vsmp needs gang treatment at all */
    pub fn coscheduled(&self) -> bool
    {
        self.vcpu_count() > 1
    }

    /* ---- virtual time ---------------------------------------------- */

    /* advance virtual time for service received.
       => ms = milliseconds of pcpu time consumed */
    pub fn advance_vtime(&mut self, ms: u64)
    {
        self.vtime.main = self.vtime.main + self.vtime.stride * ms;
        if self.vtime.stride_limit != 0
        {
            self.vtime.limit = self.vtime.limit + self.vtime.stride_limit * ms;
        }
    }

    /* a capped vsmp is ineligible while its limit clock is ahead of
       real time. the limit clock gains stride_limit per millisecond
       run, so with a 50% cap it runs at twice real time and the vsmp
       sits out half of every period, whatever the shares competition
       would have given it */
    pub fn rate_limited(&self, now_ms: u64) -> bool
    {
        self.vtime.stride_limit != 0 && self.vtime.limit > now_ms * STRIDE1
    }

    /* apply a new allocation: strides change, accumulated virtual
       time is kept */
    pub fn set_alloc(&mut self, alloc: CpuAlloc)
    {
        self.alloc = alloc;
        self.vtime.stride = stride_for_shares(alloc.shares);
        self.vtime.stride_limit = stride_for_max(alloc.max);
    }

    /* ---- hyperthread quarantine ------------------------------------ */

    /* count an interference event against the given vcpu */
    pub fn ht_interference(&mut self, vcpu: usize)
    {
        let vcore = &mut self.vcores[vcpu];
        vcore.ht_events_fast = vcore.ht_events_fast + 1;
        vcore.ht_events_slow = vcore.ht_events_slow + 1;

        if vcore.ht_events_fast > HT_QUARANTINE_THRESHOLD
        {
            let tightened = match self.ht_sharing
            {
                HtSharing::Any => Some(HtSharing::Internal),
                HtSharing::Internal => Some(HtSharing::None),
                HtSharing::None => None
            };
            if let Some(tightened) = tightened
            {
                hvlog!("quarantining world {} hyperthread sharing {:?} -> {:?}",
                    self.leader, self.ht_sharing, tightened);
                self.ht_sharing = tightened;
                self.ht_quarantine_count = self.ht_quarantine_count + 1;
            }
            vcore.ht_events_fast = 0;
        }
    }

    /* periodic decay of the interference estimators. fast halves,
       slow drains at a sixteenth per period. quarantine lifts when
       the slow estimate settles */
    pub fn ht_decay(&mut self)
    {
        let mut slow_peak = 0;
        for vcore in self.vcores.iter_mut()
        {
            vcore.ht_events_fast = vcore.ht_events_fast / 2;
            vcore.ht_events_slow = vcore.ht_events_slow * 15 / 16;
            slow_peak = core::cmp::max(slow_peak, vcore.ht_events_slow);
        }

        if self.ht_sharing != self.ht_configured && slow_peak < HT_RELEASE_THRESHOLD
        {
            self.ht_sharing = self.ht_configured;
        }
    }

    /* ---- placement constraints ------------------------------------- */

    /* union of the vcpus' affinity masks */
    pub fn affinity_union(&self) -> PcpuMask
    {
        self.vcores.iter().fold(0, |mask, vcore| mask | vcore.affinity)
    }

    /* can the given vcpu sit on the given pcpu without breaking hard
       affinity? NUMA soft affinity is advisory and checked elsewhere */
    pub fn vcpu_allowed_on(&self, vcpu: usize, pcpu: PcpuID) -> bool
    {
        self.vcores[vcpu].affinity & (1 << pcpu) != 0
    }

    /* manageable vsmps may be moved between NUMA homes: VMs without
       hard memory affinity, small enough to fit any node, and whose
       CPU affinity doesn't fight the placement controller */
    pub fn numa_manageable(&self) -> Option<Option<NodeID>>
    {
        if !self.is_vm || self.mem_affinity.is_some()
        {
            return None;
        }

        let topology = hardware::topology();
        if self.vcpu_count() > topology.smallest_node_pcpus()
        {
            return None;
        }

        let union = self.affinity_union();
        let machine = hardware::all_pcpus_mask(topology.pcpu_count);
        if union == machine
        {
            /* unconstrained: manageable with no mandatory home */
            return Some(None);
        }

        /* affinity confined to exactly one node makes that node a
           mandatory home; anything else is unmanageable */
        for (node, spec) in topology.nodes.iter().enumerate()
        {
            if union & !spec.pcpus == 0
            {
                return Some(Some(node));
            }
        }
        None
    }
}
