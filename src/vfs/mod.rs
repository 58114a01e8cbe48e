// ZUS CORE — VFS MODULE
// The filesystem-facing surface: back-end vtable traits (optional members
// carry their absent-policy as default method bodies), superblock and inode
// bindings, the token tables the kernel's pointer-sized handles index into,
// and the mount/umount/remount paths.

pub mod demux;
pub mod pmem;

use crate::engine::runtime::{dbg_on, Errno, Fba, SysResult, DBG_VFS};
use crate::relay::abi::*;
use crate::relay::Relay;
use pmem::PmemRegion;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// ============================================================================
// TOKEN TABLE
// The kernel refers to filesystems, superblocks and inodes by pointer-sized
// opaque tokens. Tokens here are monotonically issued ids into a table, so
// staleness is detectable instead of undefined behavior.
// ============================================================================

pub struct TokenTable<T> {
    next: AtomicU64,
    map: RwLock<HashMap<u64, Arc<T>>>,
}

impl<T> TokenTable<T> {
    pub fn new() -> TokenTable<T> {
        TokenTable { next: AtomicU64::new(1), map: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, val: Arc<T>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.write().unwrap().insert(token, val);
        token
    }

    pub fn get(&self, token: u64) -> Option<Arc<T>> {
        self.map.read().unwrap().get(&token).cloned()
    }

    pub fn remove(&self, token: u64) -> Option<Arc<T>> {
        self.map.write().unwrap().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map.write().unwrap().clear();
    }
}

impl<T> Default for TokenTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BINDINGS
// ============================================================================

/// One registered filesystem implementation.
pub struct FsInfo {
    pub name: String,
    pub version: u64,
    pub magic: u64,
    /// Non-zero: the mount path allocates a side buffer of this many bytes
    /// per pmem block for the back-end's private per-page state.
    pub user_page_size: u32,
    pub ops: Arc<dyn FsOps>,
}

pub const SBIF_ERROR: u32 = 1;

/// One mounted superblock: the back-end's per-superblock vtable plus the
/// core-owned pmem binding.
pub struct SbInfo {
    pub fs: Arc<FsInfo>,
    pub ops: Arc<dyn SbOps>,
    pub pmem: PmemRegion,
    pub pages: Option<Fba>,
    pub kern_sb_id: u64,
    pub flags: AtomicU32,
}

/// Pointer to an on-medium inode inside a superblock's pmem mapping.
#[derive(Copy, Clone)]
pub struct Zi(pub *const ZusInode);

// SAFETY: the pointee lives inside the pmem mapping of the superblock that
// owns the binding; the mapping outlives every InodeInfo holding a Zi into it.
unsafe impl Send for Zi {}
unsafe impl Sync for Zi {}

/// One in-core inode binding, kernel-referenced through a token from
/// NEW_INODE or LOOKUP until the matching FREE_INODE / EVICT_INODE.
pub struct InodeInfo {
    pub sb: Arc<SbInfo>,
    pub ops: Arc<dyn InodeOps>,
    pub zi: Zi,
}

impl InodeInfo {
    #[inline(always)]
    pub fn zi_raw(&self) -> *const ZusInode {
        self.zi.0
    }

    /// The on-medium inode. Valid as long as this binding exists: the
    /// binding keeps its superblock (and therefore the pmem mapping) alive.
    #[inline(always)]
    pub fn zi(&self) -> &ZusInode {
        // SAFETY: see Zi.
        unsafe { &*self.zi.0 }
    }
}

// ============================================================================
// BACK-END VTABLES
// Optional members encode their absent-policy in the default body; the
// demultiplexer owns the remaining per-op policy (lookup specials, dentry
// rollback, lookup-race suppression).
// ============================================================================

/// Per-filesystem-type operations.
pub trait FsOps: Send + Sync {
    /// Allocate the per-superblock state for a mount in progress.
    fn sbi_alloc(&self, fs: &Arc<FsInfo>) -> SysResult<Arc<dyn SbOps>>;

    /// Initialize a freshly bound superblock; returns the root inode binding.
    fn sbi_init(&self, sb: &Arc<SbInfo>, zmi: &MountInfo) -> SysResult<Arc<InodeInfo>>;

    fn sbi_fini(&self, _sb: &SbInfo) {}

    fn sbi_remount(&self, _sb: &Arc<SbInfo>, _zim: &mut IocMount) -> SysResult<()> {
        Ok(())
    }
}

/// Per-superblock operations.
pub trait SbOps: Send + Sync {
    fn iget(&self, sb: &Arc<SbInfo>, ino: u64) -> SysResult<Arc<InodeInfo>>;

    fn new_inode(
        &self,
        sb: &Arc<SbInfo>,
        app_ptr: *mut u8,
        ioc: &mut IocNewInode,
    ) -> SysResult<Arc<InodeInfo>>;

    fn free_inode(&self, _ii: &InodeInfo) {}

    fn add_dentry(&self, dir: &InodeInfo, ii: &InodeInfo, name: &ZufsStr) -> SysResult<()>;

    fn remove_dentry(&self, dir: &InodeInfo, ii: &InodeInfo, name: &ZufsStr) -> SysResult<()>;

    /// Resolve `name` under `dir`; 0 means not found.
    fn lookup(&self, dir: &InodeInfo, name: &ZufsStr) -> u64;

    fn rename(&self, _old_dir: &InodeInfo, _new_dir: &InodeInfo, _ioc: &mut IocRename) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn readdir(&self, _app_ptr: *mut u8, _dir: &InodeInfo, _ioc: &mut IocReaddir) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn clone_range(&self, _src: &InodeInfo, _dst: &InodeInfo, _ioc: &mut IocClone) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn statfs(&self, _sb: &SbInfo, _ioc: &mut IocStatfs) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }
}

/// Per-inode operations.
pub trait InodeOps: Send + Sync {
    fn read(&self, app_ptr: *mut u8, ioc: &mut IocIo) -> SysResult<()>;

    fn write(&self, app_ptr: *mut u8, ioc: &mut IocIo) -> SysResult<()>;

    fn pre_read(&self, _app_ptr: *mut u8, _ioc: &mut IocIo) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn get_block(&self, _ioc: &mut IocIo) -> SysResult<()> {
        eprintln!("[ZUS-VFS] no get_block operation set");
        Err(Errno(libc::EIO))
    }

    fn put_block(&self, _ioc: &mut IocIo) -> SysResult<()> {
        Ok(())
    }

    fn mmap_close(&self, _ioc: &mut IocMmapClose) -> SysResult<()> {
        Ok(())
    }

    /// Return the on-medium symlink target, or null for "none".
    fn get_symlink(&self, ii: &InodeInfo) -> SysResult<*const u8>;

    fn setattr(&self, _attr_mask: u32, _truncate_size: u64) -> SysResult<()> {
        Ok(())
    }

    fn sync(&self, _ioc: &mut IocRange) -> SysResult<()> {
        Ok(())
    }

    fn fallocate(&self, _ioc: &mut IocRange) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn seek(&self, _ioc: &mut IocSeek) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn ioctl(&self, _ioc: &mut IocIoctl) -> SysResult<()> {
        Err(Errno(libc::ENOTTY))
    }

    fn getxattr(&self, _app_ptr: *mut u8, _ioc: &mut IocXattr) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn setxattr(&self, _app_ptr: *mut u8, _ioc: &mut IocXattr) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    fn listxattr(&self, _app_ptr: *mut u8, _ioc: &mut IocXattr) -> SysResult<()> {
        Err(Errno(libc::ENOTSUP))
    }

    /// Last-reference teardown. Suppressed by the demultiplexer when the
    /// eviction is a lookup race.
    fn evict(&self, _ii: &InodeInfo) {}
}

// ============================================================================
// VFS STATE
// ============================================================================

pub struct VfsState {
    fs_registry: RwLock<Vec<(u64, Arc<FsInfo>)>>,
    pub fs_tokens: TokenTable<FsInfo>,
    pub sb_tokens: TokenTable<SbInfo>,
    pub inode_tokens: TokenTable<InodeInfo>,
}

impl VfsState {
    pub fn new() -> Arc<VfsState> {
        Arc::new(VfsState {
            fs_registry: RwLock::new(Vec::new()),
            fs_tokens: TokenTable::new(),
            sb_tokens: TokenTable::new(),
            inode_tokens: TokenTable::new(),
        })
    }

    /// Add a filesystem implementation to the local registry. The mount
    /// controller announces all registered filesystems to the kernel before
    /// entering its event loop.
    pub fn register_fs(&self, info: FsInfo) -> (u64, Arc<FsInfo>) {
        let info = Arc::new(info);
        let token = self.fs_tokens.insert(info.clone());
        self.fs_registry.write().unwrap().push((token, info.clone()));
        eprintln!("[ZUS-VFS] registered fs [{}] token={}", info.name, token);
        (token, info)
    }

    pub fn registered(&self) -> Vec<(u64, Arc<FsInfo>)> {
        self.fs_registry.read().unwrap().clone()
    }

    pub fn unregister_all(&self) {
        let n = self.fs_registry.read().unwrap().len();
        self.fs_registry.write().unwrap().clear();
        self.fs_tokens.clear();
        self.sb_tokens.clear();
        self.inode_tokens.clear();
        eprintln!("[ZUS-VFS] unregistered {} filesystem(s)", n);
    }
}

pub fn iget(sb: &Arc<SbInfo>, ino: u64) -> SysResult<Arc<InodeInfo>> {
    sb.ops.iget(sb, ino)
}

// ============================================================================
// MOUNT PATHS
// ============================================================================

pub fn mount(vfs: &VfsState, relay: &dyn Relay, zim: &mut IocMount) -> SysResult<()> {
    let fs = match vfs.fs_tokens.get(zim.zmi.zus_zfi) {
        Some(fs) => fs,
        None => {
            eprintln!("[ZUS-VFS] mount: unknown fs token {}", zim.zmi.zus_zfi);
            return Err(Errno(libc::EINVAL));
        }
    };

    let ops = fs.ops.sbi_alloc(&fs)?;
    let pmem = PmemRegion::grab(relay, zim.zmi.pmem_kern_id)?;
    let pages = if fs.user_page_size > 0 {
        Some(Fba::alloc_align(pmem.blocks() as usize * fs.user_page_size as usize)?)
    } else {
        None
    };

    let sb = Arc::new(SbInfo {
        fs: fs.clone(),
        ops,
        pmem,
        pages,
        kern_sb_id: zim.zmi.sb_id,
        flags: AtomicU32::new(0),
    });

    let root = match fs.ops.sbi_init(&sb, &zim.zmi) {
        Ok(root) => root,
        Err(e) => {
            sb.flags.fetch_or(SBIF_ERROR, Ordering::Relaxed);
            fs.ops.sbi_fini(&sb);
            return Err(e);
        }
    };

    zim.zmi.zi_offset = sb.pmem.addr_to_offset(root.zi_raw() as *const u8);
    zim.zmi.zus_sbi = vfs.sb_tokens.insert(sb);
    zim.zmi.zus_ii = vfs.inode_tokens.insert(root);

    if dbg_on(DBG_VFS) {
        eprintln!(
            "[ZUS-VFS] mounted [{}] sb_id={} zi=0x{:x} sbi={} ii={}",
            fs.name, zim.zmi.sb_id, zim.zmi.zi_offset, zim.zmi.zus_sbi, zim.zmi.zus_ii
        );
    }
    Ok(())
}

pub fn umount(vfs: &VfsState, zim: &mut IocMount) -> SysResult<()> {
    let sb = match vfs.sb_tokens.remove(zim.zmi.zus_sbi) {
        Some(sb) => sb,
        None => {
            eprintln!("[ZUS-VFS] umount: unknown sb token {}", zim.zmi.zus_sbi);
            return Err(Errno(libc::EINVAL));
        }
    };
    sb.fs.ops.sbi_fini(&sb);
    Ok(())
}

pub fn remount(vfs: &VfsState, zim: &mut IocMount) -> SysResult<()> {
    let sb = match vfs.sb_tokens.get(zim.zmi.zus_sbi) {
        Some(sb) => sb,
        None => {
            eprintln!("[ZUS-VFS] remount: unknown sb token {}", zim.zmi.zus_sbi);
            return Err(Errno(libc::EINVAL));
        }
    };
    let fs = sb.fs.clone();
    fs.ops.sbi_remount(&sb, zim)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_removable() {
        let table: TokenTable<u32> = TokenTable::new();
        let a = table.insert(Arc::new(1));
        let b = table.insert(Arc::new(2));
        assert_ne!(a, b);
        assert_eq!(*table.get(a).unwrap(), 1);
        assert_eq!(*table.get(b).unwrap(), 2);
        assert_eq!(*table.remove(a).unwrap(), 1);
        assert!(table.get(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_token_reads_none() {
        let table: TokenTable<u32> = TokenTable::new();
        assert!(table.get(77).is_none());
        assert!(table.remove(77).is_none());
    }
}
