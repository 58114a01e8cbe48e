// ZUS CORE — ENGINE: TOPOLOGY SERVICE
// One NUMA-map exchange at startup, then a read-only snapshot for the life of
// the process. Affinity decisions and "what node am I on" queries all come
// from here; a misprogrammed caller degrades to node 0 instead of taking a
// worker down.

use crate::engine::runtime::{dbg_on, Errno, SysResult, DBG_CORE};
use crate::relay::abi::{IocNumaMap, NumaMapPage, CPU_MASK_BITS, CPU_MASK_WORDS, MAX_NUMA_NODES};
use crate::relay::RelayChannel;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// CPU MASK
// ============================================================================

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CpuMask(pub [u64; CPU_MASK_WORDS]);

impl CpuMask {
    pub const fn empty() -> CpuMask {
        CpuMask([0; CPU_MASK_WORDS])
    }

    #[inline(always)]
    pub fn set(&mut self, cpu: u32) {
        let cpu = cpu as usize;
        if cpu < CPU_MASK_BITS {
            self.0[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    #[inline(always)]
    pub fn isset(&self, cpu: u32) -> bool {
        let cpu = cpu as usize;
        cpu < CPU_MASK_BITS && self.0[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn or_with(&mut self, other: &CpuMask) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= b;
        }
    }

    /// Lowest set bit strictly above `cpu`, or None. Pass `cpu = u32::MAX`
    /// wrapped via `iter()` for a scan from zero.
    pub fn next_set(&self, cpu: u32) -> Option<u32> {
        let start = cpu.wrapping_add(1) as usize;
        if start >= CPU_MASK_BITS {
            return None;
        }
        for c in start..CPU_MASK_BITS {
            if self.0[c / 64] & (1 << (c % 64)) != 0 {
                return Some(c as u32);
            }
        }
        None
    }

    pub fn iter(&self) -> CpuMaskIter<'_> {
        CpuMaskIter { mask: self, cur: u32::MAX }
    }

    /// Render into the OS affinity type for pthread attribute setup.
    pub fn to_cpu_set(&self) -> libc::cpu_set_t {
        // SAFETY: all-zeroes is a valid cpu_set_t bit pattern.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in self.iter() {
            // SAFETY: cpu < CPU_MASK_BITS == CPU_SETSIZE.
            unsafe { libc::CPU_SET(cpu as usize, &mut set) };
        }
        set
    }
}

pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    cur: u32,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = u32;
    fn next(&mut self) -> Option<u32> {
        let next = self.mask.next_set(self.cur)?;
        self.cur = next;
        Some(next)
    }
}

// ============================================================================
// TOPOLOGY SNAPSHOT (immutable after init)
// ============================================================================

#[derive(Debug)]
pub struct Topology {
    possible_cpus: u32,
    possible_nodes: u32,
    per_node: Vec<CpuMask>,
    possible_mask: CpuMask,
    online_mask: CpuMask,
}

static BAD_CPU_WARNED: AtomicBool = AtomicBool::new(false);

impl Topology {
    /// One-shot: issue the NUMA-map exchange on `chan`, copy the result into
    /// a page-aligned buffer, derive the masks. The caller guards against a
    /// second call per process.
    pub fn init(chan: &dyn RelayChannel) -> SysResult<Topology> {
        let mut page = NumaMapPage::zeroed();
        chan.numa_map(&mut page.map)?;
        let topo = Topology::from_numa_map(&page.map)?;
        eprintln!(
            "[ZUS-TOPO] {} possible cpus, {} online, {} node(s)",
            topo.possible_cpus,
            topo.num_online_cpus(),
            topo.possible_nodes
        );
        Ok(topo)
    }

    pub fn from_numa_map(map: &IocNumaMap) -> SysResult<Topology> {
        if map.possible_cpus as usize > CPU_MASK_BITS
            || map.possible_nodes as usize > MAX_NUMA_NODES
        {
            eprintln!(
                "[ZUS-TOPO] bogus numa map: cpus={} nodes={}",
                map.possible_cpus, map.possible_nodes
            );
            return Err(Errno(libc::EINVAL));
        }

        let mut per_node = Vec::with_capacity(map.possible_nodes as usize);
        for node in 0..map.possible_nodes as usize {
            let mut mask = CpuMask::empty();
            for cpu in 0..map.possible_cpus {
                let words = &map.cpu_set_per_node[node].bits;
                if words[cpu as usize / 64] & (1 << (cpu % 64)) != 0 {
                    mask.set(cpu);
                }
            }
            per_node.push(mask);
        }

        let mut possible_mask = CpuMask::empty();
        for cpu in 0..map.possible_cpus {
            possible_mask.set(cpu);
        }
        let mut online_mask = CpuMask::empty();
        for mask in &per_node {
            online_mask.or_with(mask);
        }

        Ok(Topology {
            possible_cpus: map.possible_cpus,
            possible_nodes: map.possible_nodes,
            per_node,
            possible_mask,
            online_mask,
        })
    }

    #[inline(always)]
    pub fn num_possible_cpus(&self) -> u32 {
        self.possible_cpus
    }

    #[inline(always)]
    pub fn num_possible_nodes(&self) -> u32 {
        self.possible_nodes
    }

    pub fn num_online_cpus(&self) -> u32 {
        self.online_mask.count()
    }

    #[inline(always)]
    pub fn nr_cpu_ids(&self) -> u32 {
        self.possible_cpus
    }

    pub fn possible_mask(&self) -> &CpuMask {
        &self.possible_mask
    }

    pub fn online_mask(&self) -> &CpuMask {
        &self.online_mask
    }

    pub fn node_mask(&self, nid: u32) -> Option<&CpuMask> {
        self.per_node.get(nid as usize)
    }

    #[inline(always)]
    pub fn cpu_online(&self, cpu: u32) -> bool {
        cpu < self.possible_cpus && self.online_mask.isset(cpu)
    }

    fn bad_cpu(&self, cpu: u32) -> bool {
        if cpu >= self.possible_cpus {
            eprintln!("[ZUS-TOPO] bad cpu={}", cpu);
            return true; // yell, but do not crash
        }
        if !self.cpu_online(cpu) {
            eprintln!("[ZUS-TOPO] offline cpu={}", cpu);
            return true;
        }
        false
    }

    /// Node owning `cpu`. Out-of-range or offline CPUs degrade to node 0
    /// with a log line; a misprogrammed handler must not abort a worker.
    pub fn cpu_to_node(&self, cpu: u32) -> u32 {
        if self.bad_cpu(cpu) {
            return 0;
        }
        for (node, mask) in self.per_node.iter().enumerate() {
            if mask.isset(cpu) {
                return node as u32;
            }
        }
        if !BAD_CPU_WARNED.swap(true, Ordering::Relaxed) {
            eprintln!("[ZUS-TOPO] cpu={} in no node mask", cpu);
        }
        0
    }

    /// Lowest online CPU strictly above `cpu` within `mask`.
    pub fn next_online(&self, cpu: u32, mask: &CpuMask) -> Option<u32> {
        let mut cur = cpu;
        while let Some(next) = mask.next_set(cur) {
            if next >= self.possible_cpus {
                return None;
            }
            if self.online_mask.isset(next) {
                return Some(next);
            }
            cur = next;
        }
        None
    }

    pub fn log_nodes(&self) {
        if !dbg_on(DBG_CORE) {
            return;
        }
        for (node, mask) in self.per_node.iter().enumerate() {
            eprintln!("[ZUS-TOPO] node {}: {} cpu(s)", node, mask.count());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
