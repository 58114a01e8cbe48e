// ZUS CORE — ENGINE: THREAD PRIMITIVE
// Every core thread is created here: scheduling policy and CPU/NUMA affinity
// are installed on the pthread attribute, so the thread is born on its CPU
// before the body runs. A thread-local slot ties each managed thread to its
// record; foreign threads read back null and degrade to OS queries.

use crate::engine::runtime::{dbg_on, to_kernel, Errno, SysResult, DBG_THREAD};
use crate::engine::topology::{CpuMask, Topology};
use crate::relay::abi::{OpHeader, ZUFS_H_INTR};
use std::cell::Cell;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

pub const ZUS_CPU_ALL: u32 = u32::MAX;
pub const ZUS_NO_NID: u32 = u32::MAX;

const ZT_PLEASE_FREE: u32 = 1;
const ZT_ADOPTED: u32 = 2;

// ============================================================================
// PARAMETERS
// ============================================================================

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SchedPolicy {
    Other,
    Rr(i32),
    Fifo(i32),
}

#[derive(Clone)]
pub struct ThreadParams {
    pub policy: SchedPolicy,
    /// Pin to one CPU; mutually exclusive with `nid`.
    pub one_cpu: u32,
    /// Pin to one NUMA node's mask; mutually exclusive with `one_cpu`.
    pub nid: u32,
    pub name: Option<String>,
}

impl ThreadParams {
    pub fn new() -> ThreadParams {
        ThreadParams { policy: SchedPolicy::Other, one_cpu: ZUS_CPU_ALL, nid: ZUS_NO_NID, name: None }
    }
}

impl Default for ThreadParams {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// THREAD RECORD + THREAD-LOCAL IDENTITY
// ============================================================================

pub type ThreadFn = fn(*mut libc::c_void) -> *mut libc::c_void;

/// The slice of worker state the thread-local identity can reach. Workers
/// embed one; the signal-pending query reads the in-flight op header through
/// it. Tagged through ThreadRole rather than pointer arithmetic.
pub struct WorkerTls {
    pub cpu: u32,
    pub chan: u32,
    pub op_hdr: AtomicPtr<OpHeader>,
}

impl WorkerTls {
    pub fn new(cpu: u32, chan: u32) -> WorkerTls {
        WorkerTls { cpu, chan, op_hdr: AtomicPtr::new(std::ptr::null_mut()) }
    }
}

#[derive(Copy, Clone)]
pub enum ThreadRole {
    Plain,
    Worker(*const WorkerTls),
}

pub struct ThreadRecord {
    entry: Option<ThreadFn>,
    user_arg: *mut libc::c_void,
    pub one_cpu: u32,
    pub nid: u32,
    private: AtomicPtr<libc::c_void>,
    pub err: AtomicI32,
    handle: AtomicU64,
    flags: u32,
    role: ThreadRole,
}

// SAFETY: records are shared between the owning thread and its creator. The
// mutable plain fields (entry, user_arg, one_cpu, nid, flags, role) are
// written only before pthread_create publishes the record; everything touched
// afterwards is atomic.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub fn new(role: ThreadRole) -> ThreadRecord {
        ThreadRecord {
            entry: None,
            user_arg: std::ptr::null_mut(),
            one_cpu: ZUS_CPU_ALL,
            nid: ZUS_NO_NID,
            private: AtomicPtr::new(std::ptr::null_mut()),
            err: AtomicI32::new(0),
            handle: AtomicU64::new(0),
            flags: 0,
            role,
        }
    }

    pub fn handle(&self) -> libc::pthread_t {
        self.handle.load(Ordering::Acquire) as libc::pthread_t
    }

    pub fn take_handle(&self) -> libc::pthread_t {
        self.handle.swap(0, Ordering::AcqRel) as libc::pthread_t
    }

    /// Re-tag the record. Worker slots call this once their final address is
    /// known, before the thread is created.
    pub fn set_role(&mut self, role: ThreadRole) {
        self.role = role;
    }
}

thread_local! {
    static TLS_RECORD: Cell<*const ThreadRecord> = const { Cell::new(std::ptr::null()) };
}

fn current_record() -> *const ThreadRecord {
    TLS_RECORD.with(|slot| slot.get())
}

extern "C" fn thread_glue(arg: *mut libc::c_void) -> *mut libc::c_void {
    let rec = arg as *mut ThreadRecord;
    TLS_RECORD.with(|slot| slot.set(rec as *const ThreadRecord));
    // SAFETY: the creator pinned the record for at least the thread lifetime
    // and wrote entry/user_arg/flags before pthread_create.
    let (entry, user_arg, flags) = unsafe { ((*rec).entry, (*rec).user_arg, (*rec).flags) };
    let ret = match entry {
        Some(f) => f(user_arg),
        None => std::ptr::null_mut(),
    };
    TLS_RECORD.with(|slot| slot.set(std::ptr::null()));
    if flags & ZT_PLEASE_FREE != 0 {
        // SAFETY: detached records are boxed by spawn() and owned by the glue
        // from here on; nothing else holds the pointer.
        unsafe { drop(Box::from_raw(rec)) };
    }
    ret
}

// ============================================================================
// CREATION
// ============================================================================

/// Create a managed thread over a caller-owned record. Affinity, policy and
/// priority are all installed on the attribute set, so any setup failure is
/// reported synchronously and the thread never starts. The record must stay
/// at a stable address until the thread is joined.
pub fn thread_create(
    rec: &mut ThreadRecord,
    topo: Option<&Topology>,
    tp: &ThreadParams,
    entry: ThreadFn,
    arg: *mut libc::c_void,
) -> SysResult<libc::pthread_t> {
    if tp.one_cpu != ZUS_CPU_ALL && tp.nid != ZUS_NO_NID {
        eprintln!("[ZUS-THREAD] both one_cpu={} and nid={} requested", tp.one_cpu, tp.nid);
        rec.err.store(to_kernel(libc::EINVAL), Ordering::Release);
        return Err(Errno(libc::EINVAL));
    }

    rec.entry = Some(entry);
    rec.user_arg = arg;

    // SAFETY: attr is initialized by pthread_attr_init before any setter and
    // destroyed on every path out; sp/affinity live across the calls that
    // read them.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let mut err = libc::pthread_attr_init(&mut attr);
        if err != 0 {
            eprintln!("[ZUS-THREAD] pthread_attr_init => {}", err);
            rec.err.store(to_kernel(err), Ordering::Release);
            return Err(Errno(err));
        }

        let fail = |attr: &mut libc::pthread_attr_t, rec: &ThreadRecord, err: i32, what: &str| {
            eprintln!("[ZUS-THREAD] {} => {}", what, err);
            // SAFETY: attr was initialized by pthread_attr_init above.
            unsafe { libc::pthread_attr_destroy(attr) };
            rec.err.store(to_kernel(err), Ordering::Release);
            Errno(err)
        };

        err = libc::pthread_attr_setinheritsched(&mut attr, libc::PTHREAD_EXPLICIT_SCHED);
        if err != 0 {
            return Err(fail(&mut attr, rec, err, "pthread_attr_setinheritsched"));
        }

        if tp.policy != SchedPolicy::Other {
            let (policy, prio) = match tp.policy {
                SchedPolicy::Rr(p) => (libc::SCHED_RR, p),
                SchedPolicy::Fifo(p) => (libc::SCHED_FIFO, p),
                SchedPolicy::Other => unreachable!(),
            };
            err = libc::pthread_attr_setschedpolicy(&mut attr, policy);
            if err != 0 {
                return Err(fail(&mut attr, rec, err, "pthread_attr_setschedpolicy"));
            }
            let sp = libc::sched_param { sched_priority: prio };
            err = libc::pthread_attr_setschedparam(&mut attr, &sp);
            if err != 0 {
                return Err(fail(&mut attr, rec, err, "pthread_attr_setschedparam"));
            }
        }

        if tp.one_cpu != ZUS_CPU_ALL || tp.nid != ZUS_NO_NID {
            let topo = match topo {
                Some(t) => t,
                None => {
                    eprintln!("[ZUS-THREAD] pinned create before topology init");
                    return Err(fail(&mut attr, rec, libc::EINVAL, "affinity"));
                }
            };
            let affinity = if tp.one_cpu != ZUS_CPU_ALL {
                let mut mask = CpuMask::empty();
                mask.set(tp.one_cpu);
                rec.one_cpu = tp.one_cpu;
                rec.nid = topo.cpu_to_node(tp.one_cpu);
                mask.to_cpu_set()
            } else {
                let mask = match topo.node_mask(tp.nid) {
                    Some(m) => m,
                    None => {
                        eprintln!("[ZUS-THREAD] wrong nid={}", tp.nid);
                        return Err(fail(&mut attr, rec, libc::EINVAL, "node affinity"));
                    }
                };
                rec.nid = tp.nid;
                mask.to_cpu_set()
            };
            err = libc::pthread_attr_setaffinity_np(
                &mut attr,
                std::mem::size_of::<libc::cpu_set_t>(),
                &affinity,
            );
            if err != 0 {
                return Err(fail(&mut attr, rec, err, "pthread_attr_setaffinity"));
            }
        }

        let mut pth: libc::pthread_t = 0;
        err = libc::pthread_create(&mut pth, &attr, thread_glue, rec as *mut ThreadRecord as *mut libc::c_void);
        if err != 0 {
            return Err(fail(&mut attr, rec, err, "pthread_create"));
        }
        libc::pthread_attr_destroy(&mut attr);

        if let Some(name) = &tp.name {
            if let Ok(cname) = CString::new(name.as_str()) {
                let err = libc::pthread_setname_np(pth, cname.as_ptr());
                if err != 0 {
                    eprintln!("[ZUS-THREAD] pthread_setname_np({}) => {}", name, err);
                }
            }
        }

        // Detached records are freed by the glue; never touch them again.
        if rec.flags & ZT_PLEASE_FREE == 0 {
            rec.handle.store(pth as u64, Ordering::Release);
        }
        if dbg_on(DBG_THREAD) {
            eprintln!(
                "[ZUS-THREAD] created cpu={} nid={} name={}",
                rec.one_cpu,
                rec.nid,
                tp.name.as_deref().unwrap_or("-")
            );
        }
        Ok(pth)
    }
}

/// Detached-record convenience: the record is heap-allocated and freed by the
/// thread itself on exit. The returned handle is still joinable.
pub fn spawn(
    topo: Option<&Topology>,
    tp: &ThreadParams,
    entry: ThreadFn,
    arg: *mut libc::c_void,
) -> SysResult<libc::pthread_t> {
    let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
    rec.flags = ZT_PLEASE_FREE;
    let raw = Box::into_raw(rec);
    // SAFETY: raw is live; on failure the thread never started, so ownership
    // returns to us and the box is dropped here.
    match thread_create(unsafe { &mut *raw }, topo, tp, entry, arg) {
        Ok(pth) => Ok(pth),
        Err(e) => {
            unsafe { drop(Box::from_raw(raw)) };
            Err(e)
        }
    }
}

pub fn join(handle: libc::pthread_t) {
    if handle != 0 {
        // SAFETY: handle came from pthread_create and is joined exactly once.
        unsafe { libc::pthread_join(handle, std::ptr::null_mut()) };
    }
}

// ============================================================================
// CURRENT-THREAD ADOPTION
// ============================================================================

/// Adopt a foreign thread (e.g. the process main thread) into the managed
/// set, deriving its identity from sched_getcpu and the topology. A second
/// adopt on the same thread is a programmer error.
pub fn adopt(topo: &Topology) -> SysResult<()> {
    if !current_record().is_null() {
        eprintln!("[ZUS-THREAD] adopt: record already present");
        return Err(Errno(libc::EEXIST));
    }
    // SAFETY: sched_getcpu touches no caller memory.
    let cpu = unsafe { libc::sched_getcpu() };
    let cpu = if cpu < 0 { 0 } else { cpu as u32 };
    let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
    rec.one_cpu = cpu;
    rec.nid = topo.cpu_to_node(cpu);
    rec.flags = ZT_ADOPTED;
    TLS_RECORD.with(|slot| slot.set(Box::into_raw(rec) as *const ThreadRecord));
    Ok(())
}

pub fn release() {
    let rec = current_record();
    if rec.is_null() {
        eprintln!("[ZUS-THREAD] release: no record on this thread");
        return;
    }
    // SAFETY: rec came from this thread's TLS slot; only adopted records are
    // owned by the slot and freed here.
    unsafe {
        if (*rec).flags & ZT_ADOPTED == 0 {
            eprintln!("[ZUS-THREAD] release: thread was not adopted");
            return;
        }
        TLS_RECORD.with(|slot| slot.set(std::ptr::null()));
        drop(Box::from_raw(rec as *mut ThreadRecord));
    }
}

// ============================================================================
// CURRENT-THREAD QUERIES
// ============================================================================

fn os_cpu() -> u32 {
    // SAFETY: sched_getcpu touches no caller memory.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}

fn warn_once(flag: &AtomicBool, msg: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        eprintln!("[ZUS-THREAD] {}", msg);
    }
}

fn current_cpu_inner(warn: bool) -> u32 {
    static FOREIGN: AtomicBool = AtomicBool::new(false);
    static UNPINNED: AtomicBool = AtomicBool::new(false);
    let rec = current_record();
    if rec.is_null() {
        if warn {
            warn_once(&FOREIGN, "current_cpu on foreign thread");
        }
        return os_cpu();
    }
    // SAFETY: a non-null TLS record is live for the thread lifetime.
    let one_cpu = unsafe { (*rec).one_cpu };
    if one_cpu == ZUS_CPU_ALL {
        if warn {
            warn_once(&UNPINNED, "current_cpu on unpinned thread");
        }
        return os_cpu();
    }
    one_cpu
}

pub fn current_cpu() -> u32 {
    current_cpu_inner(true)
}

pub fn current_cpu_silent() -> u32 {
    current_cpu_inner(false)
}

pub fn current_nid(topo: &Topology) -> u32 {
    static FOREIGN: AtomicBool = AtomicBool::new(false);
    static UNPINNED: AtomicBool = AtomicBool::new(false);
    let rec = current_record();
    if rec.is_null() {
        warn_once(&FOREIGN, "current_nid on foreign thread");
        return topo.cpu_to_node(os_cpu());
    }
    // SAFETY: a non-null TLS record is live for the thread lifetime.
    let nid = unsafe { (*rec).nid };
    if nid == ZUS_NO_NID {
        warn_once(&UNPINNED, "current_nid on unpinned thread");
        return topo.cpu_to_node(os_cpu());
    }
    nid
}

/// Opaque identity of the current managed thread; 0 for foreign threads.
pub fn self_id() -> usize {
    current_record() as usize
}

pub fn private_get() -> *mut libc::c_void {
    let rec = current_record();
    if rec.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: a non-null TLS record is live for the thread lifetime.
    unsafe { (*rec).private.load(Ordering::Relaxed) }
}

pub fn private_set(p: *mut libc::c_void) {
    let rec = current_record();
    if rec.is_null() {
        return;
    }
    // SAFETY: a non-null TLS record is live for the thread lifetime.
    unsafe { (*rec).private.store(p, Ordering::Relaxed) };
}

/// Did the kernel request interruption of the op this worker is processing?
/// Only dispatcher threads can answer; anything else is a programmer error
/// and reads as "no".
pub fn zt_signal_pending() -> bool {
    static FOREIGN: AtomicBool = AtomicBool::new(false);
    let rec = current_record();
    if rec.is_null() {
        warn_once(&FOREIGN, "signal_pending on foreign thread");
        return false;
    }
    // SAFETY: a non-null TLS record is live for the thread lifetime; a
    // Worker role points at the embedding worker's TLS block, alive until
    // the worker is joined.
    unsafe {
        match (*rec).role {
            ThreadRole::Plain => {
                warn_once(&FOREIGN, "signal_pending on non-worker thread");
                false
            }
            ThreadRole::Worker(tls) => {
                let hdr = (*tls).op_hdr.load(Ordering::Acquire);
                if hdr.is_null() {
                    return false;
                }
                (*hdr).flags & ZUFS_H_INTR != 0
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::abi::IocNumaMap;
    use bytemuck::Zeroable;
    use std::sync::atomic::AtomicU32;

    fn synth_topo() -> Topology {
        let mut map = IocNumaMap::zeroed();
        map.possible_cpus = 64;
        map.possible_nodes = 1;
        map.cpu_set_per_node[0].bits[0] = u64::MAX;
        Topology::from_numa_map(&map).unwrap()
    }

    #[test]
    fn adopt_is_idempotence_guarded() {
        let topo = synth_topo();
        adopt(&topo).unwrap();
        assert_eq!(adopt(&topo), Err(Errno(libc::EEXIST)));
        release();
        adopt(&topo).unwrap();
        release();
    }

    #[test]
    fn adopted_thread_has_identity_and_private() {
        let topo = synth_topo();
        adopt(&topo).unwrap();
        assert_ne!(self_id(), 0);
        let mut scratch = 7u64;
        private_set(&mut scratch as *mut u64 as *mut libc::c_void);
        assert_eq!(private_get() as *mut u64, &mut scratch as *mut u64);
        let cpu = current_cpu_silent();
        assert!(cpu < 1024);
        release();
        assert_eq!(self_id(), 0);
    }

    #[test]
    fn foreign_thread_queries_fall_back() {
        std::thread::spawn(|| {
            assert_eq!(self_id(), 0);
            assert!(private_get().is_null());
            let _ = current_cpu_silent();
            assert!(!zt_signal_pending());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn created_thread_sees_record_before_body() {
        struct Probe {
            id: AtomicU64,
            cpu: AtomicU32,
        }
        fn entry(arg: *mut libc::c_void) -> *mut libc::c_void {
            // SAFETY: arg is the Probe pinned in the test frame.
            let probe = unsafe { &*(arg as *const Probe) };
            probe.id.store(self_id() as u64, Ordering::SeqCst);
            probe.cpu.store(current_cpu_silent(), Ordering::SeqCst);
            std::ptr::null_mut()
        }

        let topo = synth_topo();
        let probe = Probe { id: AtomicU64::new(u64::MAX), cpu: AtomicU32::new(u32::MAX) };
        let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
        let mut tp = ThreadParams::new();
        tp.name = Some("zus-test".into());
        let pth = thread_create(
            &mut rec,
            Some(&topo),
            &tp,
            entry,
            &probe as *const Probe as *mut libc::c_void,
        )
        .unwrap();
        join(pth);
        assert_ne!(probe.id.load(Ordering::SeqCst), 0);
        assert_ne!(probe.id.load(Ordering::SeqCst), u64::MAX);
        assert_eq!(rec.err.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_cpu_pin_sets_identity() {
        fn entry(arg: *mut libc::c_void) -> *mut libc::c_void {
            // SAFETY: arg is the AtomicU32 pinned in the test frame.
            let out = unsafe { &*(arg as *const AtomicU32) };
            out.store(current_cpu(), Ordering::SeqCst);
            std::ptr::null_mut()
        }

        // Pin to a CPU this process may actually run on.
        // SAFETY: sched_getcpu touches no caller memory.
        let host_cpu = unsafe { libc::sched_getcpu() };
        let host_cpu = if host_cpu < 0 { 0 } else { host_cpu as u32 };

        let topo = synth_topo();
        let out = AtomicU32::new(u32::MAX);
        let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
        let mut tp = ThreadParams::new();
        tp.one_cpu = host_cpu;
        let pth = thread_create(
            &mut rec,
            Some(&topo),
            &tp,
            entry,
            &out as *const AtomicU32 as *mut libc::c_void,
        )
        .unwrap();
        join(pth);
        assert_eq!(out.load(Ordering::SeqCst), host_cpu);
        assert_eq!(rec.one_cpu, host_cpu);
    }

    #[test]
    fn conflicting_pins_rejected() {
        let topo = synth_topo();
        fn entry(_: *mut libc::c_void) -> *mut libc::c_void {
            std::ptr::null_mut()
        }
        let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
        let mut tp = ThreadParams::new();
        tp.one_cpu = 0;
        tp.nid = 0;
        assert_eq!(
            thread_create(&mut rec, Some(&topo), &tp, entry, std::ptr::null_mut()),
            Err(Errno(libc::EINVAL))
        );
    }

    #[test]
    fn bad_nid_rejected_synchronously() {
        let topo = synth_topo();
        fn entry(_: *mut libc::c_void) -> *mut libc::c_void {
            std::ptr::null_mut()
        }
        let mut rec = Box::new(ThreadRecord::new(ThreadRole::Plain));
        let mut tp = ThreadParams::new();
        tp.nid = 99;
        assert_eq!(
            thread_create(&mut rec, Some(&topo), &tp, entry, std::ptr::null_mut()),
            Err(Errno(libc::EINVAL))
        );
        assert_eq!(rec.handle(), 0);
    }
}
