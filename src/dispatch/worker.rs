// ZUS CORE — DISPATCH: WORKER GRID
// One dispatcher thread per (channel, cpu) slot. Each worker owns a fresh
// relay handle, registers for its slot, maps its two windows, then blocks in
// the kernel: wait for op → demux → fold the result into the header → wait
// again. Wait errors never break the loop — only the stop flag does, or a
// stray signal would wedge the channel kernel-side.

use crate::engine::barrier::WaitTilZero;
use crate::engine::runtime::{dbg_on, to_kernel, Errno, SysResult, DBG_CORE};
use crate::engine::thread::{self, ThreadParams, ThreadRecord, ThreadRole, WorkerTls};
use crate::engine::topology::Topology;
use crate::relay::abi::{OpHeader, APP_REGION_BYTES, MAX_ZT_CHANNELS, OP_BUFFER_BYTES};
use crate::relay::{Relay, RelayChannel};
use crate::vfs::{demux, VfsState};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// WORKER LIFECYCLE
// ============================================================================

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ZtState {
    Created = 0,
    Opening,
    Registered,
    Mapped,
    Ready,
    Draining,
    Exited,
    Failed,
}

impl ZtState {
    pub fn from_raw(raw: u32) -> ZtState {
        match raw {
            0 => ZtState::Created,
            1 => ZtState::Opening,
            2 => ZtState::Registered,
            3 => ZtState::Mapped,
            4 => ZtState::Ready,
            5 => ZtState::Draining,
            6 => ZtState::Exited,
            _ => ZtState::Failed,
        }
    }
}

pub struct Worker {
    rec: ThreadRecord,
    tls: WorkerTls,
    cpu: u32,
    chan_idx: u32,
    active: bool,
    stop: AtomicBool,
    state: AtomicU32,
    /// Published once the worker opened its handle, so the pool can issue
    /// BREAK_ALL against a channel whose owner is blocked in WAIT_OPT.
    chan_slot: Mutex<Option<Arc<dyn RelayChannel>>>,
    relay: Option<Arc<dyn Relay>>,
    vfs: Option<Arc<VfsState>>,
    wtz: Option<Arc<WaitTilZero>>,
}

impl Worker {
    fn inactive(cpu: u32, chan_idx: u32) -> Worker {
        Worker {
            rec: ThreadRecord::new(ThreadRole::Plain),
            tls: WorkerTls::new(cpu, chan_idx),
            cpu,
            chan_idx,
            active: false,
            stop: AtomicBool::new(false),
            state: AtomicU32::new(ZtState::Created as u32),
            chan_slot: Mutex::new(None),
            relay: None,
            vfs: None,
            wtz: None,
        }
    }

    fn activate(&mut self, relay: Arc<dyn Relay>, vfs: Arc<VfsState>, wtz: Arc<WaitTilZero>) {
        self.active = true;
        self.relay = Some(relay);
        self.vfs = Some(vfs);
        self.wtz = Some(wtz);
    }

    #[inline(always)]
    fn set_state(&self, s: ZtState) {
        self.state.store(s as u32, Ordering::Release);
    }

    pub fn state(&self) -> ZtState {
        ZtState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn last_err(&self) -> i32 {
        self.rec.err.load(Ordering::Acquire)
    }

    fn fail(&self, e: Errno) {
        self.rec.err.store(to_kernel(e.0), Ordering::Release);
        self.set_state(ZtState::Failed);
        eprintln!(
            "[ZUS-ZT] ZT({}.{}) create failed => {}",
            self.cpu,
            self.chan_idx,
            e.name()
        );
        // It's OK to leave partial state behind; stop will clean up.
        if let Some(wtz) = &self.wtz {
            wtz.release();
        }
    }

    fn run(&self) {
        let (relay, vfs, wtz) = match (&self.relay, &self.vfs, &self.wtz) {
            (Some(r), Some(v), Some(w)) => (r, v, w),
            _ => return self.fail(Errno(libc::EINVAL)),
        };

        self.set_state(ZtState::Opening);
        let chan = match relay.open() {
            Ok(chan) => chan,
            Err(e) => return self.fail(e),
        };
        *self.chan_slot.lock().unwrap() = Some(chan.clone());

        if let Err(e) = chan.zt_init(self.cpu, self.chan_idx, OP_BUFFER_BYTES as u32) {
            return self.fail(e);
        }
        self.set_state(ZtState::Registered);

        let app_map = match chan.mmap_shared(0, APP_REGION_BYTES) {
            Ok(map) => map,
            Err(e) => return self.fail(e),
        };
        let op_map = match chan.mmap_shared(APP_REGION_BYTES as u64, OP_BUFFER_BYTES) {
            Ok(map) => map,
            Err(e) => return self.fail(e),
        };
        self.set_state(ZtState::Mapped);

        let hdr = op_map.as_mut_ptr() as *mut OpHeader;
        self.tls.op_hdr.store(hdr, Ordering::Release);

        if dbg_on(DBG_CORE) {
            eprintln!(
                "[ZUS-ZT] [{}] thread init chan={} app_mem={:p}",
                self.cpu,
                self.chan_idx,
                app_map.as_mut_ptr()
            );
        }

        self.set_state(ZtState::Ready);
        wtz.release();

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = chan.wait_for_op(hdr) {
                self.rec.err.store(to_kernel(e.0), Ordering::Release);
                if dbg_on(DBG_CORE) {
                    eprintln!("[ZUS-ZT] wait_for_op => {}", e.name());
                }
                // Continue and let stop say if to exit. Otherwise any kill
                // of an app would exit the ZT and leave the channel stuck.
            }

            // SAFETY: hdr heads the mapped op window; offset addresses the
            // app window and is bounded by the relay contract.
            let res = unsafe {
                debug_assert!(((*hdr).offset as usize) < APP_REGION_BYTES);
                let app_ptr = app_map.as_mut_ptr().add((*hdr).offset as usize);
                demux::do_command(vfs, app_ptr, hdr)
            };
            // SAFETY: exclusive writer of the in-flight header.
            unsafe { (*hdr).err = to_kernel(res) };
        }

        self.set_state(ZtState::Draining);
        self.tls.op_hdr.store(std::ptr::null_mut(), Ordering::Release);
        drop(op_map);
        drop(app_map);
        self.chan_slot.lock().unwrap().take();
        drop(chan);
        self.set_state(ZtState::Exited);

        if dbg_on(DBG_CORE) {
            eprintln!("[ZUS-ZT] [{}] thread exit chan={}", self.cpu, self.chan_idx);
        }
    }
}

fn zt_entry(arg: *mut libc::c_void) -> *mut libc::c_void {
    // SAFETY: arg is the worker slot, pinned in the pool's boxed channel
    // array until the thread is joined.
    let w = unsafe { &*(arg as *const Worker) };
    w.run();
    std::ptr::null_mut()
}

// ============================================================================
// WORKER POOL
// ============================================================================

/// Read-only view of one slot, for the mount controller's verification scan
/// and for tests.
#[derive(Copy, Clone, Debug)]
pub struct WorkerView {
    pub cpu: u32,
    pub chan: u32,
    pub active: bool,
    pub state: ZtState,
    pub err: i32,
}

pub struct ZtPool {
    chans: Vec<Box<[Worker]>>,
    num_zts: u32,
    max_channels: u32,
    wtz: Arc<WaitTilZero>,
}

impl ZtPool {
    pub fn new() -> ZtPool {
        ZtPool { chans: Vec::new(), num_zts: 0, max_channels: 0, wtz: Arc::new(WaitTilZero::new()) }
    }

    pub fn channels(&self) -> u32 {
        self.max_channels
    }

    pub fn snapshot(&self) -> Vec<WorkerView> {
        let mut out = Vec::new();
        for chan in &self.chans {
            for w in chan.iter() {
                out.push(WorkerView {
                    cpu: w.cpu,
                    chan: w.chan_idx,
                    active: w.active,
                    state: w.state(),
                    err: w.last_err(),
                });
            }
        }
        out
    }

    /// Bring up the full grid: `num_chans` channels, one worker per online
    /// CPU each, slots for offline CPUs present but inactive. Blocks until
    /// every worker is READY or has parked an init error, then fails the
    /// whole start if any did.
    pub fn start(
        &mut self,
        relay: &Arc<dyn Relay>,
        vfs: &Arc<VfsState>,
        topo: &Arc<Topology>,
        tp: &ThreadParams,
        num_chans: u32,
    ) -> SysResult<()> {
        if self.max_channels != 0 {
            eprintln!("[ZUS-ZT] pool already started");
            return Err(Errno(libc::EEXIST));
        }
        if num_chans == 0 || num_chans as usize > MAX_ZT_CHANNELS {
            eprintln!("[ZUS-ZT] bad channel count {}", num_chans);
            return Err(Errno(libc::EINVAL));
        }

        let num_cpus = topo.num_possible_cpus();
        self.num_zts = num_cpus;
        self.max_channels = num_chans;
        self.wtz.arm(num_chans * topo.num_online_cpus());

        for c in 0..num_chans {
            if let Err(e) = self.start_chan(relay, vfs, topo, tp, c) {
                self.stop();
                return Err(e);
            }
        }

        self.wtz.wait();

        // Verify that every ZT started successfully.
        let first_err = self.first_init_err();
        if first_err != 0 {
            self.stop();
            return Err(Errno(first_err.abs()));
        }

        eprintln!("[ZUS-ZT] {} * {} ZT threads ready", topo.num_online_cpus(), num_chans);
        Ok(())
    }

    fn first_init_err(&self) -> i32 {
        for chan in &self.chans {
            for w in chan.iter() {
                if w.active && w.last_err() != 0 {
                    return w.last_err();
                }
            }
        }
        0
    }

    fn start_chan(
        &mut self,
        relay: &Arc<dyn Relay>,
        vfs: &Arc<VfsState>,
        topo: &Arc<Topology>,
        tp: &ThreadParams,
        chan_idx: u32,
    ) -> SysResult<()> {
        let num_cpus = self.num_zts;
        let arr: Vec<Worker> = (0..num_cpus).map(|cpu| Worker::inactive(cpu, chan_idx)).collect();
        self.chans.push(arr.into_boxed_slice());
        let slice = match self.chans.last_mut() {
            Some(s) => s,
            None => return Err(Errno(libc::ENOMEM)),
        };

        for cpu in topo.online_mask().iter() {
            let w = &mut slice[cpu as usize];
            w.activate(relay.clone(), vfs.clone(), self.wtz.clone());
            // The slot has reached its final address; tag the record so the
            // thread-local downcast can find the worker.
            let tls_ptr = &w.tls as *const WorkerTls;
            w.rec.set_role(ThreadRole::Worker(tls_ptr));

            let mut wtp = tp.clone();
            wtp.one_cpu = cpu;
            wtp.nid = thread::ZUS_NO_NID;
            wtp.name = Some(format!("ZT({}.{})", cpu, chan_idx));

            let wp = w as *mut Worker;
            thread::thread_create(&mut w.rec, Some(topo.as_ref()), &wtp, zt_entry, wp as *mut libc::c_void)?;
        }
        Ok(())
    }

    fn stop_chan(chan: &mut [Worker]) {
        for w in chan.iter() {
            w.stop.store(true, Ordering::Release);
        }
        // One break per channel wakes every kernel-blocked waiter on it.
        for w in chan.iter() {
            let published = w.chan_slot.lock().unwrap().clone();
            if let Some(ch) = published {
                if let Err(e) = ch.break_all() {
                    eprintln!("[ZUS-ZT] break_all => {}", e.name());
                }
                break;
            }
        }
        for w in chan.iter() {
            thread::join(w.rec.take_handle());
        }
    }

    /// Tear the grid down: stop flags, one break per channel, join
    /// everything, then clear the pool back to its pristine state.
    pub fn stop(&mut self) {
        for chan in self.chans.iter_mut() {
            Self::stop_chan(chan);
        }
        self.chans.clear();
        self.num_zts = 0;
        self.max_channels = 0;
    }
}

impl Default for ZtPool {
    fn default() -> Self {
        Self::new()
    }
}
