// ZUS CORE — INTEGRATION TESTS
// Drives the full dispatcher — worker grid, mount controller, demultiplexer —
// against an in-process fake relay. Windows are heap arenas instead of kernel
// mappings; the fake topology is carved out of the host's real affinity mask
// so thread pinning works wherever the tests run.

use bytemuck::Zeroable;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use zus_core::dispatch::worker::ZtState;
use zus_core::dispatch::Runtime;
use zus_core::engine::runtime::{Errno, SysResult};
use zus_core::engine::thread::{self, ThreadParams};
use zus_core::engine::topology::Topology;
use zus_core::relay::abi::*;
use zus_core::relay::{Mapping, PmemInfo, Relay, RelayChannel};
use zus_core::vfs::pmem::PmemRegion;
use zus_core::vfs::{FsInfo, FsOps, InodeInfo, InodeOps, SbInfo, SbOps, Zi};

// ============================================================================
// FAKE RELAY
// ============================================================================

const RESULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One worker slot's queue on the fake control device.
struct Endpoint {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
    /// (err, op-window copy) captured when the worker re-enters the wait.
    results: Mutex<Vec<(i32, Vec<u8>)>>,
    results_cv: Condvar,
    delivered_len: Mutex<usize>,
}

impl Endpoint {
    fn new() -> Arc<Endpoint> {
        Arc::new(Endpoint {
            inbox: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            results: Mutex::new(Vec::new()),
            results_cv: Condvar::new(),
            delivered_len: Mutex::new(0),
        })
    }

    fn capture_result(&self, hdr: *mut OpHeader) {
        let mut len = self.delivered_len.lock().unwrap();
        if *len == 0 {
            return;
        }
        // SAFETY: hdr heads the worker-owned op window; `len` bytes of it
        // were written by us when the op was delivered.
        let (err, copy) = unsafe {
            let err = (*hdr).err;
            let copy = std::slice::from_raw_parts(hdr as *const u8, *len).to_vec();
            (err, copy)
        };
        *len = 0;
        self.results.lock().unwrap().push((err, copy));
        self.results_cv.notify_all();
    }

    fn wait_results(&self, n: usize) -> Vec<(i32, Vec<u8>)> {
        let deadline = Instant::now() + RESULT_TIMEOUT;
        let mut results = self.results.lock().unwrap();
        while results.len() < n {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out waiting for {} results", n);
            let (guard, _) = self.results_cv.wait_timeout(results, left).unwrap();
            results = guard;
        }
        results.clone()
    }
}

struct MountQueue {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
    broken: Mutex<bool>,
    results: Mutex<Vec<(i32, Vec<u8>)>>,
    results_cv: Condvar,
    delivered: Mutex<bool>,
}

struct FakeCore {
    numa: IocNumaMap,
    pmem_blocks: u64,
    by_slot: Mutex<HashMap<(u32, u32), Arc<Endpoint>>>,
    lanes: Mutex<HashMap<u32, Vec<Arc<Endpoint>>>>,
    broken_lanes: Mutex<HashSet<u32>>,
    mount: MountQueue,
    registered: Mutex<Vec<(u64, String)>>,
}

impl FakeCore {
    fn new(numa: IocNumaMap, pmem_blocks: u64) -> Arc<FakeCore> {
        Arc::new(FakeCore {
            numa,
            pmem_blocks,
            by_slot: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            broken_lanes: Mutex::new(HashSet::new()),
            mount: MountQueue {
                inbox: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                broken: Mutex::new(false),
                results: Mutex::new(Vec::new()),
                results_cv: Condvar::new(),
                delivered: Mutex::new(false),
            },
            registered: Mutex::new(Vec::new()),
        })
    }

    fn endpoint(&self, cpu: u32, chan: u32) -> Arc<Endpoint> {
        self.by_slot
            .lock()
            .unwrap()
            .get(&(cpu, chan))
            .cloned()
            .unwrap_or_else(|| panic!("no worker registered for ({}, {})", cpu, chan))
    }

    fn push_op(&self, cpu: u32, chan: u32, op: &[u8]) {
        let ep = self.endpoint(cpu, chan);
        let mut inbox = ep.inbox.lock().unwrap();
        inbox.push_back(op.to_vec());
        ep.cv.notify_all();
    }

    fn push_mount(&self, zim: &IocMount) {
        let mut inbox = self.mount.inbox.lock().unwrap();
        inbox.push_back(bytemuck::bytes_of(zim).to_vec());
        self.mount.cv.notify_all();
    }

    fn wait_mount_results(&self, n: usize) -> Vec<(i32, Vec<u8>)> {
        let deadline = Instant::now() + RESULT_TIMEOUT;
        let mut results = self.mount.results.lock().unwrap();
        while results.len() < n {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out waiting for {} mount results", n);
            let (guard, _) = self.mount.results_cv.wait_timeout(results, left).unwrap();
            results = guard;
        }
        results.clone()
    }

    fn registered_tokens(&self) -> Vec<u64> {
        self.registered.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

struct FakeRelay {
    core: Arc<FakeCore>,
}

impl Relay for FakeRelay {
    fn open(&self) -> SysResult<Arc<dyn RelayChannel>> {
        Ok(Arc::new(FakeChan {
            core: self.core.clone(),
            slot: Mutex::new(None),
            bufs: Mutex::new(Vec::new()),
        }))
    }
}

struct FakeChan {
    core: Arc<FakeCore>,
    /// (lane, endpoint) once zt_init ran on this handle.
    slot: Mutex<Option<(u32, Arc<Endpoint>)>>,
    bufs: Mutex<Vec<Box<[u64]>>>,
}

impl RelayChannel for FakeChan {
    fn numa_map(&self, map: &mut IocNumaMap) -> SysResult<()> {
        *map = self.core.numa;
        Ok(())
    }

    fn register_fs(&self, reg: &mut IocRegisterFs) -> SysResult<()> {
        let name = String::from_utf8_lossy(&reg.name)
            .trim_end_matches('\0')
            .to_string();
        self.core.registered.lock().unwrap().push((reg.zus_zfi, name));
        Ok(())
    }

    fn zt_init(&self, cpu: u32, channel: u32, _max_command: u32) -> SysResult<()> {
        // A fresh registration revives a lane a previous grid broke.
        self.core.broken_lanes.lock().unwrap().remove(&channel);
        let ep = Endpoint::new();
        self.core.by_slot.lock().unwrap().insert((cpu, channel), ep.clone());
        self.core.lanes.lock().unwrap().entry(channel).or_default().push(ep.clone());
        *self.slot.lock().unwrap() = Some((channel, ep));
        Ok(())
    }

    fn mmap_shared(&self, _offset: u64, len: usize) -> SysResult<Mapping> {
        let mut arena = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        let ptr = arena.as_mut_ptr() as *mut u8;
        self.bufs.lock().unwrap().push(arena);
        Ok(Mapping::borrowed(ptr, len))
    }

    fn wait_for_op(&self, hdr: *mut OpHeader) -> SysResult<()> {
        let (lane, ep) = match self.slot.lock().unwrap().clone() {
            Some(s) => s,
            None => return Err(Errno(libc::EINVAL)),
        };

        ep.capture_result(hdr);

        let mut inbox = ep.inbox.lock().unwrap();
        loop {
            if let Some(op) = inbox.pop_front() {
                // SAFETY: hdr heads an OP_BUFFER_BYTES window this worker
                // owns; pushed ops never exceed it.
                unsafe {
                    std::ptr::copy_nonoverlapping(op.as_ptr(), hdr as *mut u8, op.len());
                }
                *ep.delivered_len.lock().unwrap() = op.len();
                return Ok(());
            }
            if self.core.broken_lanes.lock().unwrap().contains(&lane) {
                // Sticky break: late waiters on a broken lane return a
                // BREAK op immediately instead of blocking forever.
                let mut brk = OpHeader::zeroed();
                brk.operation = OpCode::Break as u16;
                // SAFETY: as above.
                unsafe { *hdr = brk };
                return Ok(());
            }
            inbox = ep.cv.wait(inbox).unwrap();
        }
    }

    fn receive_mount(&self, zim: &mut IocMount) -> SysResult<()> {
        let mq = &self.core.mount;
        {
            let mut delivered = mq.delivered.lock().unwrap();
            if *delivered {
                *delivered = false;
                mq.results
                    .lock()
                    .unwrap()
                    .push((zim.hdr.err, bytemuck::bytes_of(zim).to_vec()));
                mq.results_cv.notify_all();
            }
        }
        let mut inbox = mq.inbox.lock().unwrap();
        loop {
            if let Some(event) = inbox.pop_front() {
                *zim = bytemuck::pod_read_unaligned(&event);
                *mq.delivered.lock().unwrap() = true;
                return Ok(());
            }
            if *mq.broken.lock().unwrap() {
                return Err(Errno(libc::EINTR));
            }
            inbox = mq.cv.wait(inbox).unwrap();
        }
    }

    fn break_all(&self) -> SysResult<()> {
        if let Some((lane, _)) = self.slot.lock().unwrap().clone() {
            self.core.broken_lanes.lock().unwrap().insert(lane);
            let eps = self.core.lanes.lock().unwrap().get(&lane).cloned().unwrap_or_default();
            for ep in eps {
                let _guard = ep.inbox.lock().unwrap();
                ep.cv.notify_all();
            }
        } else {
            *self.core.mount.broken.lock().unwrap() = true;
            let _guard = self.core.mount.inbox.lock().unwrap();
            self.core.mount.cv.notify_all();
        }
        Ok(())
    }

    fn grab_pmem(&self, _pmem_kern_id: u32) -> SysResult<PmemInfo> {
        Ok(PmemInfo { total_blocks: self.core.pmem_blocks })
    }

    fn alloc_buffer(&self, _init_size: u32, _max_size: u32) -> SysResult<()> {
        Ok(())
    }
}

// ============================================================================
// TOPOLOGY FROM THE HOST AFFINITY MASK
// ============================================================================

/// Up to `max` CPUs this process may actually run on.
fn host_cpus(max: usize) -> Vec<u32> {
    // SAFETY: all-zeroes is a valid cpu_set_t; sched_getaffinity fills it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return vec![0];
        }
        let mut cpus = Vec::new();
        for cpu in 0..CPU_MASK_BITS {
            if libc::CPU_ISSET(cpu, &set) {
                cpus.push(cpu as u32);
                if cpus.len() == max {
                    break;
                }
            }
        }
        if cpus.is_empty() {
            cpus.push(0);
        }
        cpus
    }
}

/// Fake NUMA map: the given CPUs online, spread round-robin over `nodes`.
fn fake_numa(cpus: &[u32], nodes: u32) -> IocNumaMap {
    let mut map = IocNumaMap::zeroed();
    map.possible_cpus = cpus.iter().max().copied().unwrap_or(0) + 1;
    map.possible_nodes = nodes;
    for (i, cpu) in cpus.iter().enumerate() {
        let node = (i as u32 % nodes) as usize;
        map.cpu_set_per_node[node].bits[*cpu as usize / 64] |= 1 << (cpu % 64);
    }
    map
}

// ============================================================================
// STUB BACK-END
// ============================================================================

#[derive(Default)]
struct Counters {
    new_inode: AtomicU32,
    evict: AtomicU32,
    read: AtomicU32,
    write: AtomicU32,
    sbi_init: AtomicU32,
    sbi_fini: AtomicU32,
}

/// Identity trace a worker records when its READ handler runs: which CPU the
/// op claimed to target, and what the thread observed about itself.
#[derive(Default)]
struct SeenIdentity {
    entries: Mutex<Vec<(u32, u32, u32)>>, // (expected_cpu, seen_cpu, seen_nid)
}

struct StubShared {
    counters: Counters,
    seen: SeenIdentity,
    topo: Mutex<Option<Arc<Topology>>>,
}

impl StubShared {
    fn new() -> Arc<StubShared> {
        Arc::new(StubShared {
            counters: Counters::default(),
            seen: SeenIdentity::default(),
            topo: Mutex::new(None),
        })
    }
}

struct StubFs {
    shared: Arc<StubShared>,
}

struct StubSb {
    shared: Arc<StubShared>,
}

struct StubInode {
    shared: Arc<StubShared>,
}

impl FsOps for StubFs {
    fn sbi_alloc(&self, _fs: &Arc<FsInfo>) -> SysResult<Arc<dyn SbOps>> {
        Ok(Arc::new(StubSb { shared: self.shared.clone() }))
    }

    fn sbi_init(&self, sb: &Arc<SbInfo>, _zmi: &MountInfo) -> SysResult<Arc<InodeInfo>> {
        self.shared.counters.sbi_init.fetch_add(1, Ordering::SeqCst);
        // Root inode on the medium at offset 0: ino 1, its own parent.
        let zi = sb.pmem.offset_to_addr(0) as *mut ZusInode;
        // SAFETY: offset 0 of the freshly mapped region is ours to format.
        unsafe {
            (*zi).i_ino = 1;
            (*zi).i_parent = 1;
        }
        Ok(Arc::new(InodeInfo {
            sb: sb.clone(),
            ops: Arc::new(StubInode { shared: self.shared.clone() }),
            zi: Zi(zi as *const ZusInode),
        }))
    }

    fn sbi_fini(&self, _sb: &SbInfo) {
        self.shared.counters.sbi_fini.fetch_add(1, Ordering::SeqCst);
    }
}

impl SbOps for StubSb {
    fn iget(&self, sb: &Arc<SbInfo>, _ino: u64) -> SysResult<Arc<InodeInfo>> {
        Ok(Arc::new(InodeInfo {
            sb: sb.clone(),
            ops: Arc::new(StubInode { shared: self.shared.clone() }),
            zi: Zi(sb.pmem.offset_to_addr(0) as *const ZusInode),
        }))
    }

    fn new_inode(
        &self,
        sb: &Arc<SbInfo>,
        _app_ptr: *mut u8,
        _ioc: &mut IocNewInode,
    ) -> SysResult<Arc<InodeInfo>> {
        self.shared.counters.new_inode.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InodeInfo {
            sb: sb.clone(),
            ops: Arc::new(StubInode { shared: self.shared.clone() }),
            zi: Zi(sb.pmem.offset_to_addr(128) as *const ZusInode),
        }))
    }

    fn add_dentry(&self, _dir: &InodeInfo, _ii: &InodeInfo, _name: &ZufsStr) -> SysResult<()> {
        Ok(())
    }

    fn remove_dentry(&self, _dir: &InodeInfo, _ii: &InodeInfo, _name: &ZufsStr) -> SysResult<()> {
        Ok(())
    }

    fn lookup(&self, _dir: &InodeInfo, _name: &ZufsStr) -> u64 {
        0
    }
}

impl InodeOps for StubInode {
    fn read(&self, _app_ptr: *mut u8, ioc: &mut IocIo) -> SysResult<()> {
        self.shared.counters.read.fetch_add(1, Ordering::SeqCst);
        let seen_cpu = thread::current_cpu();
        let seen_nid = match &*self.shared.topo.lock().unwrap() {
            Some(topo) => thread::current_nid(topo),
            None => 0,
        };
        self.shared
            .seen
            .entries
            .lock()
            .unwrap()
            .push((ioc.filepos as u32, seen_cpu, seen_nid));
        Ok(())
    }

    fn write(&self, _app_ptr: *mut u8, _ioc: &mut IocIo) -> SysResult<()> {
        self.shared.counters.write.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_symlink(&self, _ii: &InodeInfo) -> SysResult<*const u8> {
        Ok(std::ptr::null())
    }

    fn evict(&self, _ii: &InodeInfo) {
        self.shared.counters.evict.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// FIXTURE
// ============================================================================

struct Grid {
    rt: Arc<Runtime>,
    core: Arc<FakeCore>,
    shared: Arc<StubShared>,
    cpus: Vec<u32>,
    /// Arena backing the hand-built superblock for direct op feeding.
    _arena: Vec<u64>,
    dir_token: u64,
}

/// Runtime over a fake relay with a hand-mounted stub superblock and a
/// directory inode token ready for op feeding.
fn grid(max_cpus: usize, nodes: u32) -> Grid {
    let cpus = host_cpus(max_cpus);
    let core = FakeCore::new(fake_numa(&cpus, nodes), 16);
    let rt = Runtime::new(Arc::new(FakeRelay { core: core.clone() }));
    let topo = rt.init_topology().expect("topology init");

    let shared = StubShared::new();
    *shared.topo.lock().unwrap() = Some(topo);

    let (_token, fs) = rt.vfs.register_fs(FsInfo {
        name: "stubfs".into(),
        version: 1,
        magic: 0x5a55_4653,
        user_page_size: 64,
        ops: Arc::new(StubFs { shared: shared.clone() }),
    });

    // Hand-mount a superblock over a heap arena and bind a directory inode
    // (ino 5, parent 3) so ops can be fed without the mount channel.
    let mut arena = vec![0u64; 4 * PMEM_BLOCK_SIZE / 8];
    let base = arena.as_mut_ptr() as *mut u8;
    let pmem = PmemRegion::from_mapping(Mapping::borrowed(base, arena.len() * 8), 4);
    let sb = Arc::new(SbInfo {
        fs,
        ops: Arc::new(StubSb { shared: shared.clone() }),
        pmem,
        pages: None,
        kern_sb_id: 1,
        flags: AtomicU32::new(0),
    });
    // SAFETY: arena offset 0 is a zeroed, aligned inode slot owned by us.
    unsafe {
        let zi = base as *mut ZusInode;
        (*zi).i_ino = 5;
        (*zi).i_parent = 3;
    }
    let dir = Arc::new(InodeInfo {
        sb: sb.clone(),
        ops: Arc::new(StubInode { shared: shared.clone() }),
        zi: Zi(base as *const ZusInode),
    });
    let dir_token = rt.vfs.inode_tokens.insert(dir);
    rt.vfs.sb_tokens.insert(sb);

    Grid { rt, core, shared, cpus, _arena: arena, dir_token }
}

fn worker_params() -> ThreadParams {
    ThreadParams::new()
}

fn op_bytes<T: bytemuck::Pod>(ioc: &T) -> Vec<u8> {
    bytemuck::bytes_of(ioc).to_vec()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn s1_start_stop_one_channel() {
    let g = grid(4, 1);
    g.rt.start_workers(&worker_params(), 1).expect("start");

    let snap = g.rt.worker_snapshot();
    let ready: Vec<_> = snap.iter().filter(|w| w.active).collect();
    assert_eq!(ready.len(), g.cpus.len());
    for w in &ready {
        assert_eq!(w.state, ZtState::Ready, "ZT({}.{}) not ready", w.cpu, w.chan);
        assert_eq!(w.err, 0);
    }
    // Slots for offline CPUs are present but inactive.
    for w in snap.iter().filter(|w| !w.active) {
        assert_eq!(w.state, ZtState::Created);
    }

    g.rt.stop_workers();
    assert_eq!(g.rt.channels(), 0);
    assert!(g.rt.worker_snapshot().is_empty());
}

#[test]
fn s2_affinity_identity() {
    let g = grid(4, 2);
    g.rt.start_workers(&worker_params(), 2).expect("start");

    // One READ per worker; filepos carries the CPU the op targets.
    for chan in 0..2 {
        for cpu in &g.cpus {
            let mut io = IocIo::zeroed();
            io.hdr.operation = OpCode::Read as u16;
            io.zus_ii = g.dir_token;
            io.filepos = *cpu as u64;
            g.core.push_op(*cpu, chan, &op_bytes(&io));
        }
    }
    for chan in 0..2 {
        for cpu in &g.cpus {
            let mut brk = OpHeader::zeroed();
            brk.operation = OpCode::Break as u16;
            g.core.push_op(*cpu, chan, &op_bytes(&brk));
            g.core.endpoint(*cpu, chan).wait_results(2);
        }
    }

    let topo = g.rt.topology().unwrap();
    let entries = g.shared.seen.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), g.cpus.len() * 2);
    for (expected_cpu, seen_cpu, seen_nid) in entries {
        assert_eq!(seen_cpu, expected_cpu);
        assert_eq!(seen_nid, topo.cpu_to_node(expected_cpu));
    }

    g.rt.stop_workers();
}

#[test]
fn s3_operation_routing_and_break_survival() {
    let g = grid(1, 1);
    g.rt.start_workers(&worker_params(), 1).expect("start");
    let cpu = g.cpus[0];
    let ep = g.core.endpoint(cpu, 0);

    // NEW_INODE first: its result carries the token EVICT needs.
    let mut ni = IocNewInode::zeroed();
    ni.hdr.operation = OpCode::NewInode as u16;
    ni.dir_ii = g.dir_token;
    ni.str_.set(b"f");
    g.core.push_op(cpu, 0, &op_bytes(&ni));

    let mut io = IocIo::zeroed();
    io.hdr.operation = OpCode::Write as u16;
    io.zus_ii = g.dir_token;
    g.core.push_op(cpu, 0, &op_bytes(&io));
    io.hdr.operation = OpCode::Read as u16;
    g.core.push_op(cpu, 0, &op_bytes(&io));

    let results = ep.wait_results(3);
    assert!(results.iter().all(|(err, _)| *err == 0));
    let ni_done: IocNewInode = bytemuck::pod_read_unaligned(&results[0].1);
    assert_ne!(ni_done.zus_ii, 0);

    let mut ev = IocEvict::zeroed();
    ev.hdr.operation = OpCode::EvictInode as u16;
    ev.zus_ii = ni_done.zus_ii;
    g.core.push_op(cpu, 0, &op_bytes(&ev));

    let mut brk = OpHeader::zeroed();
    brk.operation = OpCode::Break as u16;
    g.core.push_op(cpu, 0, &op_bytes(&brk));

    let results = ep.wait_results(5);
    assert!(results.iter().all(|(err, _)| *err == 0));

    let c = &g.shared.counters;
    assert_eq!(c.new_inode.load(Ordering::SeqCst), 1);
    assert_eq!(c.write.load(Ordering::SeqCst), 1);
    assert_eq!(c.read.load(Ordering::SeqCst), 1);
    assert_eq!(c.evict.load(Ordering::SeqCst), 1);

    // BREAK is a poison pill, not an exit: the worker is still serving.
    let snap = g.rt.worker_snapshot();
    let w = snap.iter().find(|w| w.active && w.cpu == cpu).unwrap();
    assert_eq!(w.state, ZtState::Ready);

    g.rt.stop_workers();
}

#[test]
fn s6_shutdown_while_blocked_is_bounded() {
    let g = grid(4, 1);
    g.rt.start_workers(&worker_params(), 1).expect("start");

    // Let every worker park inside the blocking wait.
    std::thread::sleep(Duration::from_millis(50));

    let t0 = Instant::now();
    g.rt.stop_workers();
    assert!(t0.elapsed() < Duration::from_secs(1), "stop took {:?}", t0.elapsed());
    assert_eq!(g.rt.channels(), 0);
}

#[test]
fn start_stop_start_is_clean() {
    let g = grid(2, 1);
    g.rt.start_workers(&worker_params(), 1).expect("first start");
    assert_eq!(g.rt.channels(), 1);
    g.rt.stop_workers();
    assert_eq!(g.rt.channels(), 0);
    g.rt.start_workers(&worker_params(), 2).expect("restart");
    assert_eq!(g.rt.channels(), 2);
    g.rt.stop_workers();
}

#[test]
fn double_start_is_rejected() {
    let g = grid(1, 1);
    g.rt.start_workers(&worker_params(), 1).expect("start");
    assert_eq!(g.rt.start_workers(&worker_params(), 1), Err(Errno(libc::EEXIST)));
    g.rt.stop_workers();
}

#[test]
fn bad_channel_counts_are_rejected() {
    let g = grid(1, 1);
    assert_eq!(g.rt.start_workers(&worker_params(), 0), Err(Errno(libc::EINVAL)));
    assert_eq!(
        g.rt.start_workers(&worker_params(), MAX_ZT_CHANNELS as u32 + 1),
        Err(Errno(libc::EINVAL))
    );
}

#[test]
fn topology_single_shot() {
    let cpus = host_cpus(2);
    let core = FakeCore::new(fake_numa(&cpus, 1), 16);
    let rt = Runtime::new(Arc::new(FakeRelay { core }));
    rt.init_topology().expect("first init");
    assert_eq!(rt.init_topology().unwrap_err(), Errno(libc::EEXIST));
}

#[test]
fn exec_buffer_allocates_and_maps() {
    let g = grid(1, 1);
    let buf = g.rt.alloc_exec_buffer(8192).expect("alloc");
    assert!(!buf.as_mut_ptr().is_null());
    assert_eq!(buf.len(), 8192);
}

// ============================================================================
// MOUNT CONTROLLER
// ============================================================================

#[test]
fn mount_controller_lifecycle() {
    let g = grid(2, 1);
    g.rt.mount_thread_start(worker_params()).expect("mount thread");

    // Registration announcement reaches the kernel side.
    let deadline = Instant::now() + RESULT_TIMEOUT;
    while g.core.registered_tokens().is_empty() {
        assert!(Instant::now() < deadline, "fs never announced");
        std::thread::sleep(Duration::from_millis(5));
    }
    let fs_token = g.core.registered_tokens()[0];

    // First MOUNT: sizes the grid, then binds the superblock.
    let mut zim = IocMount::zeroed();
    zim.hdr.operation = M_MOUNT;
    zim.zmi.zus_zfi = fs_token;
    zim.zmi.num_channels = 1;
    zim.zmi.pmem_kern_id = 7;
    zim.zmi.sb_id = 3;
    g.core.push_mount(&zim);

    let results = g.core.wait_mount_results(1);
    let (err, bytes) = &results[0];
    assert_eq!(*err, 0);
    let done: IocMount = bytemuck::pod_read_unaligned(bytes);
    assert_ne!(done.zmi.zus_sbi, 0);
    assert_ne!(done.zmi.zus_ii, 0);
    assert_eq!(g.shared.counters.sbi_init.load(Ordering::SeqCst), 1);
    assert_eq!(g.rt.channels(), 1);
    let ready = g.rt.worker_snapshot().iter().filter(|w| w.active).count();
    assert_eq!(ready, g.cpus.len());

    // The registration asked for user pages: the mount path allocates the
    // side buffer (blocks × user_page_size, page-rounded).
    let sb = g.rt.vfs.sb_tokens.get(done.zmi.zus_sbi).expect("sb bound");
    assert!(sb.pages.is_some());

    // Debug channel round trip.
    let mut wr = IocMount::zeroed();
    wr.hdr.operation = M_DDBG_WR;
    let text = b"0x9";
    wr.zdi.msg[..text.len()].copy_from_slice(text);
    wr.zdi.len = text.len() as u64;
    g.core.push_mount(&wr);

    let mut rd = IocMount::zeroed();
    rd.hdr.operation = M_DDBG_RD;
    g.core.push_mount(&rd);

    let results = g.core.wait_mount_results(3);
    assert_eq!(results[1].0, 0);
    let rd_done: IocMount = bytemuck::pod_read_unaligned(&results[2].1);
    let msg = &rd_done.zdi.msg[..rd_done.zdi.len as usize];
    assert!(std::str::from_utf8(msg).unwrap().contains("dbgmask=0x9"));

    // Mask back down so other tests keep quiet logs.
    let mut wr0 = IocMount::zeroed();
    wr0.hdr.operation = M_DDBG_WR;
    wr0.zdi.msg[..3].copy_from_slice(b"0x0");
    wr0.zdi.len = 3;
    g.core.push_mount(&wr0);

    // UMOUNT runs sbi_fini.
    let mut um = IocMount::zeroed();
    um.hdr.operation = M_UMOUNT;
    um.zmi.zus_sbi = done.zmi.zus_sbi;
    g.core.push_mount(&um);

    let results = g.core.wait_mount_results(5);
    assert_eq!(results[4].0, 0);
    assert_eq!(g.shared.counters.sbi_fini.load(Ordering::SeqCst), 1);

    // Shutdown: grid first, then the controller, then the registry.
    g.rt.mount_thread_stop();
    assert_eq!(g.rt.channels(), 0);
    assert!(g.rt.vfs.registered().is_empty());
    assert_eq!(g.rt.mount_err(), 0);
}

#[test]
fn unknown_mount_event_is_einval() {
    let g = grid(1, 1);
    g.rt.mount_thread_start(worker_params()).expect("mount thread");

    let mut zim = IocMount::zeroed();
    zim.hdr.operation = 99;
    g.core.push_mount(&zim);
    // Second event forces capture of the first result.
    let mut rd = IocMount::zeroed();
    rd.hdr.operation = M_DDBG_RD;
    g.core.push_mount(&rd);

    let results = g.core.wait_mount_results(1);
    assert_eq!(results[0].0, -libc::EINVAL);

    g.rt.mount_thread_stop();
}
