// ZUS CORE — RELAY: KERNEL TRANSPORT
// The real control device: anonymous O_TMPFILE handles on the zuf root,
// ioctl exchanges, and shared do-not-dump mappings. One fd per channel
// object; the fd is thread-safe, which is what lets the mount thread issue
// BREAK_ALL against a handle whose owner is blocked in WAIT_OPT.

use crate::engine::runtime::{dbg_on, Errno, SysResult, DBG_RELAY};
use crate::relay::abi::*;
use crate::relay::{Mapping, PmemInfo, Relay, RelayChannel};
use std::ffi::CString;
use std::sync::Arc;

/// Default control-device root; overridable at init.
pub const ZUF_DEF_PATH: &str = "/sys/fs/zuf";

pub struct KernelRelay {
    root: CString,
}

impl KernelRelay {
    pub fn new(root: Option<&str>) -> SysResult<KernelRelay> {
        let path = root.unwrap_or(ZUF_DEF_PATH);
        let root = CString::new(path).map_err(|_| Errno(libc::EINVAL))?;
        Ok(KernelRelay { root })
    }

    pub fn root(&self) -> &str {
        self.root.to_str().unwrap_or(ZUF_DEF_PATH)
    }
}

impl Relay for KernelRelay {
    fn open(&self) -> SysResult<Arc<dyn RelayChannel>> {
        // RDWR also for the mmap windows.
        let o_flags = libc::O_RDWR | libc::O_TMPFILE | libc::O_EXCL;
        // SAFETY: open() reads the NUL-terminated root path only.
        let fd = unsafe { libc::open(self.root.as_ptr(), o_flags, 0o666) };
        if fd < 0 {
            let e = Errno::last();
            eprintln!(
                "[ZUS-RELAY] open <{}> flags=0x{:x} failed: {}",
                self.root(),
                o_flags,
                e.name()
            );
            return Err(e);
        }
        Ok(Arc::new(KernelChan { fd }))
    }
}

pub struct KernelChan {
    fd: libc::c_int,
}

impl KernelChan {
    fn ioctl(&self, req: u64, arg: *mut libc::c_void) -> SysResult<()> {
        // SAFETY: arg points to a live, correctly-sized request struct for
        // req; the kernel reads and writes it in place.
        let rc = unsafe { libc::ioctl(self.fd, req as libc::c_ulong, arg) };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

impl Drop for KernelChan {
    fn drop(&mut self) {
        // SAFETY: fd was returned by open() and is closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

impl RelayChannel for KernelChan {
    fn numa_map(&self, map: &mut IocNumaMap) -> SysResult<()> {
        self.ioctl(ZU_IOC_NUMA_MAP, map as *mut IocNumaMap as *mut libc::c_void)
    }

    fn register_fs(&self, reg: &mut IocRegisterFs) -> SysResult<()> {
        self.ioctl(ZU_IOC_REGISTER_FS, reg as *mut IocRegisterFs as *mut libc::c_void)
    }

    fn zt_init(&self, cpu: u32, channel: u32, max_command: u32) -> SysResult<()> {
        let mut init = IocInitZt {
            hdr: bytemuck::Zeroable::zeroed(),
            cpu,
            channel,
            max_command,
            _pad: 0,
        };
        self.ioctl(ZU_IOC_INIT_ZT, &mut init as *mut IocInitZt as *mut libc::c_void)
    }

    fn mmap_shared(&self, offset: u64, len: usize) -> SysResult<Mapping> {
        // SAFETY: mmap creates a fresh shared mapping over this handle;
        // madvise only tags it. The pointer is owned by the returned Mapping.
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            );
            if ptr == libc::MAP_FAILED {
                let e = Errno::last();
                eprintln!("[ZUS-RELAY] mmap off=0x{:x} len=0x{:x} failed: {}", offset, len, e.name());
                let e = if e.0 == 0 { Errno(libc::ENOMEM) } else { e };
                return Err(e);
            }
            if libc::madvise(ptr, len, libc::MADV_DONTDUMP) == -1 {
                eprintln!("[ZUS-RELAY] madvise(DONTDUMP) failed: {}", Errno::last().name());
            }
            Ok(Mapping::mapped(ptr as *mut u8, len))
        }
    }

    fn wait_for_op(&self, hdr: *mut OpHeader) -> SysResult<()> {
        self.ioctl(ZU_IOC_WAIT_OPT, hdr as *mut libc::c_void)
    }

    fn receive_mount(&self, zim: &mut IocMount) -> SysResult<()> {
        self.ioctl(ZU_IOC_MOUNT, zim as *mut IocMount as *mut libc::c_void)
    }

    fn break_all(&self) -> SysResult<()> {
        if dbg_on(DBG_RELAY) {
            eprintln!("[ZUS-RELAY] break_all fd={}", self.fd);
        }
        self.ioctl(ZU_IOC_BREAK_ALL, std::ptr::null_mut())
    }

    fn grab_pmem(&self, pmem_kern_id: u32) -> SysResult<PmemInfo> {
        let mut grab = IocGrabPmem {
            hdr: bytemuck::Zeroable::zeroed(),
            pmem_kern_id,
            _pad: 0,
            pmem_total_blocks: 0,
        };
        self.ioctl(ZU_IOC_GRAB_PMEM, &mut grab as *mut IocGrabPmem as *mut libc::c_void)?;
        Ok(PmemInfo { total_blocks: grab.pmem_total_blocks })
    }

    fn alloc_buffer(&self, init_size: u32, max_size: u32) -> SysResult<()> {
        let mut ab = IocAllocBuffer {
            hdr: bytemuck::Zeroable::zeroed(),
            init_size,
            max_size,
        };
        self.ioctl(ZU_IOC_ALLOC_BUFFER, &mut ab as *mut IocAllocBuffer as *mut libc::c_void)
    }
}
