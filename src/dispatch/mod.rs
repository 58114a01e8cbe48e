// ZUS CORE — DISPATCH MODULE
// The runtime handle: one lazily-initialized object owning the relay, the
// VFS state, the topology snapshot, the worker grid and the mount
// controller. Tests build their own Runtime against a fake relay; the zusd
// executive builds one against the kernel transport.

pub mod mount;
pub mod worker;

use crate::engine::runtime::{Errno, SysResult};
use crate::engine::thread::ThreadParams;
use crate::engine::topology::Topology;
use crate::relay::{Relay, RelayChannel};
use crate::vfs::pmem::ExecBuffer;
use crate::vfs::VfsState;
use mount::MountShared;
use std::sync::{Arc, Mutex, OnceLock};
use worker::{WorkerView, ZtPool};

pub struct Runtime {
    pub relay: Arc<dyn Relay>,
    pub vfs: Arc<VfsState>,
    topo: OnceLock<Arc<Topology>>,
    pool: Mutex<ZtPool>,
    mount_shared: Arc<MountShared>,
    mount_rec: Mutex<Option<Box<crate::engine::thread::ThreadRecord>>>,
}

impl Runtime {
    pub fn new(relay: Arc<dyn Relay>) -> Arc<Runtime> {
        Arc::new(Runtime {
            relay,
            vfs: VfsState::new(),
            topo: OnceLock::new(),
            pool: Mutex::new(ZtPool::new()),
            mount_shared: Arc::new(MountShared::new()),
            mount_rec: Mutex::new(None),
        })
    }

    // ── Topology ────────────────────────────────────────────────────────

    /// One-shot topology capture over an already-open handle. A second call
    /// per runtime is a programmer error.
    pub fn init_topology_with(&self, chan: &dyn RelayChannel) -> SysResult<Arc<Topology>> {
        if self.topo.get().is_some() {
            eprintln!("[ZUS-TOPO] topology already initialized");
            return Err(Errno(libc::EEXIST));
        }
        let topo = Arc::new(Topology::init(chan)?);
        let _ = self.topo.set(topo.clone());
        Ok(topo)
    }

    /// Convenience for callers without a handle of their own.
    pub fn init_topology(&self) -> SysResult<Arc<Topology>> {
        let chan = self.relay.open()?;
        self.init_topology_with(&*chan)
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topo.get().cloned()
    }

    // ── Worker grid ─────────────────────────────────────────────────────

    pub fn start_workers(&self, tp: &ThreadParams, num_chans: u32) -> SysResult<()> {
        let topo = match self.topology() {
            Some(t) => t,
            None => {
                eprintln!("[ZUS-ZT] start before topology init");
                return Err(Errno(libc::EINVAL));
            }
        };
        self.pool.lock().unwrap().start(&self.relay, &self.vfs, &topo, tp, num_chans)
    }

    pub fn stop_workers(&self) {
        self.pool.lock().unwrap().stop();
    }

    /// Channels currently up; zero until the first mount.
    pub fn channels(&self) -> u32 {
        self.pool.lock().unwrap().channels()
    }

    pub fn worker_snapshot(&self) -> Vec<WorkerView> {
        self.pool.lock().unwrap().snapshot()
    }

    // ── Mount controller ────────────────────────────────────────────────

    pub fn mount_thread_start(self: &Arc<Runtime>, ztp: ThreadParams) -> SysResult<()> {
        mount::start(self, ztp)
    }

    /// Full shutdown: worker grid, then the mount thread, then the
    /// filesystem registry.
    pub fn mount_thread_stop(&self) {
        mount::stop(self);
    }

    pub fn mount_err(&self) -> i32 {
        self.mount_shared.err.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn mount_shared(&self) -> &Arc<MountShared> {
        &self.mount_shared
    }

    pub(crate) fn mount_rec(&self) -> &Mutex<Option<Box<crate::engine::thread::ThreadRecord>>> {
        &self.mount_rec
    }

    // ── Back-end support ────────────────────────────────────────────────

    /// Kernel-shared execution buffer for a back-end (ALLOC_BUFFER + map).
    pub fn alloc_exec_buffer(&self, max_bytes: u32) -> SysResult<ExecBuffer> {
        ExecBuffer::alloc(&*self.relay, max_bytes)
    }
}
