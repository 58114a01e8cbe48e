// ZUS CORE — DISPATCH: MOUNT CONTROLLER
// One dedicated thread owns lifecycle: it initializes topology, announces the
// registered filesystems, notifies the service manager, then blocks for
// mount-channel events. The first MOUNT sizes and starts the worker grid.
// Unlike workers, a receive error breaks this loop.

use crate::dispatch::Runtime;
use crate::engine::runtime::{
    dbg_mask, fold, sd_notify_ready, set_dbg_mask, to_kernel, Errno, Fba, SysResult,
};
use crate::engine::thread::{self, ThreadParams, ThreadRecord, ThreadRole};
use crate::relay::abi::{
    DdbgInfo, IocMount, IocRegisterFs, DDBG_MSG_MAX, M_DDBG_RD, M_DDBG_WR, M_MOUNT, M_REMOUNT,
    M_UMOUNT, OP_BUFFER_BYTES,
};
use crate::relay::RelayChannel;
use crate::vfs;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

pub struct MountShared {
    pub stop: AtomicBool,
    pub err: AtomicI32,
    /// Published once the controller opened its handle, so shutdown can wake
    /// a blocked receive.
    pub chan: Mutex<Option<Arc<dyn RelayChannel>>>,
}

impl MountShared {
    pub fn new() -> MountShared {
        MountShared { stop: AtomicBool::new(false), err: AtomicI32::new(0), chan: Mutex::new(None) }
    }
}

impl Default for MountShared {
    fn default() -> Self {
        Self::new()
    }
}

struct MountCtx {
    rt: Arc<Runtime>,
    /// Template for the worker threads started on first mount.
    ztp: ThreadParams,
}

fn mount_entry(arg: *mut libc::c_void) -> *mut libc::c_void {
    // SAFETY: arg is the MountCtx boxed by mount_thread_start; owned here.
    let ctx = unsafe { Box::from_raw(arg as *mut MountCtx) };
    if let Err(e) = run_mount_loop(&ctx.rt, &ctx.ztp) {
        ctx.rt.mount_shared().err.store(to_kernel(e.0), Ordering::Release);
        eprintln!("[ZUS-MOUNT] mount thread => {}", e.name());
    }
    std::ptr::null_mut()
}

fn register_all(rt: &Runtime, chan: &dyn RelayChannel) -> SysResult<()> {
    let registered = rt.vfs.registered();
    if registered.is_empty() {
        eprintln!("[ZUS-MOUNT] no filesystems registered");
    }
    for (token, fs) in registered {
        let mut reg = IocRegisterFs {
            hdr: bytemuck::Zeroable::zeroed(),
            zus_zfi: token,
            name: [0; 16],
            version: fs.version,
            magic: fs.magic,
            user_page_size: fs.user_page_size,
            _pad: 0,
        };
        let n = fs.name.len().min(15);
        reg.name[..n].copy_from_slice(&fs.name.as_bytes()[..n]);
        chan.register_fs(&mut reg)?;
    }
    Ok(())
}

fn ddbg_read(zdi: &mut DdbgInfo) -> SysResult<()> {
    let text = format!("dbgmask=0x{:x}\n", dbg_mask());
    let n = text.len().min(DDBG_MSG_MAX);
    zdi.msg[..n].copy_from_slice(&text.as_bytes()[..n]);
    zdi.len = n as u64;
    Ok(())
}

fn ddbg_write(zdi: &mut DdbgInfo) -> SysResult<()> {
    let n = (zdi.len as usize).min(DDBG_MSG_MAX);
    let text = match std::str::from_utf8(&zdi.msg[..n]) {
        Ok(t) => t.trim(),
        Err(_) => return Err(Errno(libc::EINVAL)),
    };
    let digits = text.strip_prefix("0x").unwrap_or(text);
    let mask = match u64::from_str_radix(digits, 16) {
        Ok(m) => m,
        Err(_) => return Err(Errno(libc::EINVAL)),
    };
    set_dbg_mask(mask);
    eprintln!("[ZUS-MOUNT] dbgmask set to 0x{:x}", mask);
    Ok(())
}

fn run_mount_loop(rt: &Arc<Runtime>, ztp: &ThreadParams) -> SysResult<()> {
    let shared = rt.mount_shared();

    let fba = Fba::alloc(OP_BUFFER_BYTES)?;
    let chan = rt.relay.open()?;
    *shared.chan.lock().unwrap() = Some(chan.clone());

    eprintln!("[ZUS-MOUNT] mount thread running");

    let topo = match rt.topology() {
        Some(t) => t,
        None => rt.init_topology_with(&*chan)?,
    };
    topo.log_nodes();

    register_all(rt, &*chan)?;

    sd_notify_ready();

    // SAFETY: the scratch buffer is page-aligned, OP_BUFFER_BYTES long and
    // exclusively ours; IocMount fits it (asserted in abi).
    let zim = unsafe { &mut *(fba.as_mut_ptr() as *mut IocMount) };

    while !shared.stop.load(Ordering::Acquire) {
        if let Err(e) = chan.receive_mount(zim) {
            if !shared.stop.load(Ordering::Acquire) {
                eprintln!("[ZUS-MOUNT] receive_mount => {}", e.name());
            }
            break;
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let op = zim.hdr.operation;

        // First mount sizes the grid by the kernel's requested channel count.
        if op == M_MOUNT && rt.channels() == 0 {
            if let Err(e) = rt.start_workers(ztp, zim.zmi.num_channels) {
                zim.hdr.err = to_kernel(e.0);
                continue;
            }
        }

        let res = match op {
            M_MOUNT => vfs::mount(&rt.vfs, &*rt.relay, zim),
            M_UMOUNT => vfs::umount(&rt.vfs, zim),
            M_REMOUNT => vfs::remount(&rt.vfs, zim),
            M_DDBG_RD => ddbg_read(&mut zim.zdi),
            M_DDBG_WR => ddbg_write(&mut zim.zdi),
            _ => {
                eprintln!("[ZUS-MOUNT] unknown event {}", op);
                Err(Errno(libc::EINVAL))
            }
        };
        zim.hdr.err = to_kernel(fold(res));
    }

    shared.chan.lock().unwrap().take();
    eprintln!("[ZUS-MOUNT] mount thread exit");
    Ok(())
}

// ============================================================================
// START / STOP (called on the runtime handle)
// ============================================================================

pub(super) fn start(rt: &Arc<Runtime>, ztp: ThreadParams) -> SysResult<()> {
    let mut slot = rt.mount_rec().lock().unwrap();
    if slot.is_some() {
        eprintln!("[ZUS-MOUNT] mount thread already running");
        return Err(Errno(libc::EEXIST));
    }

    rt.mount_shared().stop.store(false, Ordering::Release);
    rt.mount_shared().err.store(0, Ordering::Release);

    let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
    // Adopted identity (cpu 0, node 0) regardless of where it runs: the
    // back-end's per-CPU objects are initialized before any worker exists,
    // so nothing depends on the real CPU during setup.
    rec.one_cpu = 0;
    rec.nid = 0;

    let ctx = Box::into_raw(Box::new(MountCtx { rt: rt.clone(), ztp }));

    let mut tp = ThreadParams::new(); // just a plain thread
    tp.name = Some("zus_mounter".into());

    match thread::thread_create(&mut rec, None, &tp, mount_entry, ctx as *mut libc::c_void) {
        Ok(_) => {
            *slot = Some(rec);
            Ok(())
        }
        Err(e) => {
            // The thread never started; the context is still ours.
            // SAFETY: ctx was leaked above and not consumed by any thread.
            unsafe { drop(Box::from_raw(ctx)) };
            Err(e)
        }
    }
}

pub(super) fn stop(rt: &Runtime) {
    // Workers first, then the controller, then the registry.
    rt.stop_workers();

    let shared = rt.mount_shared();
    shared.stop.store(true, Ordering::Release);
    // The controller publishes its handle right after opening it; give a
    // mid-startup controller a moment to get there, then wake its blocked
    // receive. On the kernel transport the shutdown signal does the same.
    let mut published = shared.chan.lock().unwrap().clone();
    let mut tries = 0;
    while published.is_none() && tries < 100 {
        std::thread::sleep(std::time::Duration::from_millis(1));
        published = shared.chan.lock().unwrap().clone();
        tries += 1;
    }
    if let Some(ch) = published {
        let _ = ch.break_all();
    }

    let rec = rt.mount_rec().lock().unwrap().take();
    if let Some(rec) = rec {
        thread::join(rec.take_handle());
    }

    rt.vfs.unregister_all();
}
