// ZUS CORE — ENGINE: RUNTIME MODULE
// Process-wide plumbing: structured fatal exit, errno conventions, the debug
// mask, memory-lock mode, service-manager notification, and the file-backed
// buffer allocator used for scratch event buffers and user-page side buffers.

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot, 0x20-0x2F = Runtime, 0x30-0x3F = Transport

pub const E_BAD_ARGS: i32 = 0x10;
pub const E_MLOCK_FAIL: i32 = 0x11;
pub const E_MOUNT_THREAD: i32 = 0x12;
pub const E_RELAY_OPEN: i32 = 0x30;

/// Structured fatal exit. No heap allocation. No stack unwinding.
/// Writes one fixed-format line to stderr via writev (single syscall, no
/// interleaving on concurrent fatals), then exits with the code.
/// Output: "[ZUS FATAL 0xHH] msg\n"
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[ZUS FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: writev(2, iov, 5) writes to stderr (fd 2, always open). All iov
    // entries point to live byte buffers with correct lengths.
    unsafe { libc::writev(2, iov.as_ptr(), 5) };
    std::process::exit(code);
}

// ============================================================================
// ERRNO CONVENTIONS
// ============================================================================

/// A positive errno value, as user space produces it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Errno(pub i32);

pub type SysResult<T> = Result<T, Errno>;

impl Errno {
    /// Capture the calling thread's errno after a failed libc call.
    pub fn last() -> Errno {
        // SAFETY: __errno_location() returns the thread-local errno slot.
        Errno(unsafe { *libc::__errno_location() })
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            libc::EINVAL => "EINVAL",
            libc::ENOENT => "ENOENT",
            libc::ENOMEM => "ENOMEM",
            libc::EEXIST => "EEXIST",
            libc::EINTR => "EINTR",
            libc::EIO => "EIO",
            libc::ENOTSUP => "ENOTSUP",
            libc::ENOTTY => "ENOTTY",
            _ => "errno",
        }
    }
}

/// Convert a user-space error code to the kernel sign convention: positive
/// errno codes become negative, everything else passes through. Idempotent.
#[inline(always)]
pub fn to_kernel(err: i32) -> i32 {
    if err < 0 { err } else { -err }
}

/// Fold a SysResult into the flat i32 form handlers hand back to workers.
#[inline(always)]
pub fn fold(res: SysResult<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(Errno(e)) => e,
    }
}

// ============================================================================
// DEBUG MASK (read at startup, mutated only through the ddbg channel)
// ============================================================================

pub const DBG_CORE: u64 = 1 << 0;
pub const DBG_THREAD: u64 = 1 << 1;
pub const DBG_RELAY: u64 = 1 << 2;
pub const DBG_VFS: u64 = 1 << 3;

static DBGMASK: AtomicU64 = AtomicU64::new(0);

#[inline(always)]
pub fn dbg_on(bit: u64) -> bool {
    DBGMASK.load(Ordering::Relaxed) & bit != 0
}

pub fn dbg_mask() -> u64 {
    DBGMASK.load(Ordering::Relaxed)
}

pub fn set_dbg_mask(mask: u64) {
    DBGMASK.store(mask, Ordering::Relaxed);
}

// ============================================================================
// MEMORY-LOCK MODE
// ============================================================================

/// Process-wide mlockall mode, applied once before the mount controller runs.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MlockMode {
    None,
    Current,
    All,
}

pub fn apply_mlock(mode: MlockMode) -> SysResult<()> {
    let flags = match mode {
        MlockMode::None => return Ok(()),
        MlockMode::Current => libc::MCL_CURRENT,
        MlockMode::All => libc::MCL_CURRENT | libc::MCL_FUTURE,
    };
    // SAFETY: mlockall takes a flag word and touches no caller memory.
    if unsafe { libc::mlockall(flags) } != 0 {
        let e = Errno::last();
        eprintln!("[ZUS-EXEC] mlockall({:?}) failed: {}", mode, e.name());
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// SERVICE-MANAGER HANDSHAKE
// ============================================================================

/// Emit "READY=1" on $NOTIFY_SOCKET. Best effort: absent socket is a no-op,
/// send failures are logged and swallowed. Supports the abstract namespace
/// ('@' prefix) as well as filesystem socket paths.
pub fn sd_notify_ready() {
    let path = match std::env::var("NOTIFY_SOCKET") {
        Ok(p) if !p.is_empty() => p,
        _ => return,
    };

    // SAFETY: socket() allocates a descriptor; sendto() reads only the
    // sockaddr and payload buffers built below; close() releases the fd.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            eprintln!("[ZUS-EXEC] sd_notify socket failed: {}", Errno::last().name());
            return;
        }

        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.len() >= addr.sun_path.len() {
            libc::close(fd);
            return;
        }
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[i] = *b as libc::c_char;
        }
        if bytes[0] == b'@' {
            addr.sun_path[0] = 0; // abstract namespace
        }
        let addr_len = std::mem::size_of::<libc::sa_family_t>() + bytes.len();

        let msg = b"READY=1";
        let rc = libc::sendto(
            fd,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len as libc::socklen_t,
        );
        if rc < 0 {
            eprintln!("[ZUS-EXEC] sd_notify send failed: {}", Errno::last().name());
        }
        libc::close(fd);
    }
}

// ============================================================================
// FILE-BACKED BUFFER ALLOCATOR
// Anonymous memfd regions, page-aligned, shared-mappable. Backs the mount
// controller's scratch event buffer and per-mount user-page side buffers.
// ============================================================================

pub struct Fba {
    fd: libc::c_int,
    ptr: *mut u8,
    size: usize,
}

// SAFETY: Fba owns its mapping exclusively; the raw pointer is valid for the
// struct lifetime and the fd is closed exactly once in Drop.
unsafe impl Send for Fba {}
unsafe impl Sync for Fba {}

impl Fba {
    pub fn alloc(size: usize) -> SysResult<Fba> {
        // SAFETY: memfd_create takes a name and flags; ftruncate sizes the
        // anonymous file; mmap maps it shared read-write. Failure paths close
        // the fd before returning.
        unsafe {
            let name = b"zus-fba\0";
            let fd = libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(Errno::last());
            }
            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let e = Errno::last();
                libc::close(fd);
                return Err(e);
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if ptr == libc::MAP_FAILED {
                let e = Errno::last();
                libc::close(fd);
                return Err(e);
            }
            Ok(Fba { fd, ptr: ptr as *mut u8, size })
        }
    }

    /// Page-aligned allocation rounded up to whole pages.
    pub fn alloc_align(size: usize) -> SysResult<Fba> {
        let page = crate::relay::abi::PAGE_SIZE;
        Self::alloc(size.div_ceil(page) * page)
    }

    #[inline(always)]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Fba {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in alloc(); fd is the
        // memfd backing it. Neither is used after this point.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
