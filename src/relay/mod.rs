// ZUS CORE — RELAY MODULE
// The kernel control-device seam. `abi` is the wire contract; `Relay` /
// `RelayChannel` abstract the transport so the dispatcher can run against the
// real ioctl device or an in-process fake; `kernel` is the real transport.

pub mod abi;
pub mod kernel;

use crate::engine::runtime::SysResult;
use abi::{IocMount, IocNumaMap, IocRegisterFs, OpHeader};
use std::sync::Arc;

/// Result of GRAB_PMEM: the region geometry the kernel bound to the handle.
#[derive(Copy, Clone, Debug)]
pub struct PmemInfo {
    pub total_blocks: u64,
}

/// A shared-writable window obtained from a relay handle. Kernel-backed
/// windows are munmapped on drop; borrowed windows (fake transports) are
/// owned by the channel that handed them out.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
    mapped: bool,
}

// SAFETY: the window is owned by exactly one worker (or one mount path); the
// raw pointer stays valid until Drop and is never aliased mutably across
// threads by the core.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Wrap an mmap result; unmapped on drop.
    pub fn mapped(ptr: *mut u8, len: usize) -> Mapping {
        Mapping { ptr, len, mapped: true }
    }

    /// Wrap transport-owned memory; drop is a no-op.
    pub fn borrowed(ptr: *mut u8, len: usize) -> Mapping {
        Mapping { ptr, len, mapped: false }
    }

    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: ptr/len describe a live mapping created by the channel;
            // nothing dereferences it after this point.
            unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        }
    }
}

/// One open handle on the control device. Workers, the mount controller,
/// pmem grabs, and exec-buffer allocations each own a fresh handle.
///
/// Interior mutability is the transport's business: `break_all` must be
/// callable from the mount thread while the owning worker blocks in
/// `wait_for_op` on the same handle.
pub trait RelayChannel: Send + Sync {
    /// Fill the page-sized NUMA map.
    fn numa_map(&self, map: &mut IocNumaMap) -> SysResult<()>;

    /// Announce one filesystem implementation to the kernel.
    fn register_fs(&self, reg: &mut IocRegisterFs) -> SysResult<()>;

    /// Register this handle as the carrier for worker (cpu, channel).
    fn zt_init(&self, cpu: u32, channel: u32, max_command: u32) -> SysResult<()>;

    /// Map a shared-writable, do-not-dump window at the given handle offset.
    fn mmap_shared(&self, offset: u64, len: usize) -> SysResult<Mapping>;

    /// Block until the kernel delivers an operation into the op window whose
    /// header is `hdr`.
    fn wait_for_op(&self, hdr: *mut OpHeader) -> SysResult<()>;

    /// Block until the kernel delivers a mount/umount/remount/ddbg event.
    fn receive_mount(&self, zim: &mut IocMount) -> SysResult<()>;

    /// Wake every waiter blocked on this handle's channel.
    fn break_all(&self) -> SysResult<()>;

    /// Bind the pmem region `pmem_kern_id` to this handle; map it afterwards
    /// with `mmap_shared`.
    fn grab_pmem(&self, pmem_kern_id: u32) -> SysResult<PmemInfo>;

    /// Carve out a kernel-shared buffer on this handle; map it afterwards
    /// with `mmap_shared`.
    fn alloc_buffer(&self, init_size: u32, max_size: u32) -> SysResult<()>;
}

/// Factory for relay handles. The dispatcher never opens the device itself;
/// every handle comes from here, which is what lets tests swap the kernel
/// for an in-process fake.
pub trait Relay: Send + Sync {
    fn open(&self) -> SysResult<Arc<dyn RelayChannel>>;
}
