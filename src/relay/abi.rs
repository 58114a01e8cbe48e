// ZUS CORE — RELAY: WIRE ABI
// Everything the kernel shim and the runtime agree on: operation codes, the
// operation header, per-operation request structs, the NUMA map page, and
// the ioctl request numbers. All structs are repr(C) Pod with compile-time
// size checks; the shim treats the mapped op buffer as a ring-of-one and both
// sides read and write these in place.

use bytemuck::{Pod, Zeroable};
use std::mem;

// ============================================================================
// GEOMETRY CONSTANTS (part of the relay contract)
// ============================================================================

pub const PAGE_SIZE: usize = 4096;

/// Per-worker payload window: operation data (read/write buffers, readdir
/// pages) lives here, addressed by OpHeader.offset.
pub const MAX_APP_PAGES: usize = 256;
pub const APP_REGION_BYTES: usize = MAX_APP_PAGES * PAGE_SIZE;

/// Per-worker operation window: the header and request struct of the op
/// currently in flight. Mapped at offset APP_REGION_BYTES on the relay fd.
pub const OP_BUFFER_BYTES: usize = 4 * PAGE_SIZE;

pub const MAX_ZT_CHANNELS: usize = 4;

/// CPU bitmap geometry. Must match the OS cpu_set_t width exactly — the
/// kernel copies its masks out verbatim.
pub const CPU_MASK_BITS: usize = 1024;
pub const CPU_MASK_WORDS: usize = CPU_MASK_BITS / 64;
pub const MAX_NUMA_NODES: usize = 16;

/// On-medium block granularity of a pmem region.
pub const PMEM_BLOCK_SIZE: usize = 4096;

// ============================================================================
// OPERATION CODES
// ============================================================================

/// VFS operation codes the kernel relays to workers. The demultiplexer maps
/// every one of these to exactly one handler.
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpCode {
    Null = 0,
    Statfs,
    NewInode,
    FreeInode,
    EvictInode,
    Lookup,
    AddDentry,
    RemoveDentry,
    Rename,
    Readdir,
    Clone,
    Copy,
    Read,
    PreRead,
    Write,
    GetBlock,
    PutBlock,
    MmapClose,
    GetSymlink,
    Setattr,
    Sync,
    Fallocate,
    Llseek,
    Ioctl,
    XattrGet,
    XattrSet,
    XattrList,
    Break,
}

impl OpCode {
    pub fn from_raw(raw: u16) -> Option<OpCode> {
        if raw > OpCode::Break as u16 {
            return None;
        }
        // SAFETY: raw is within the contiguous discriminant range checked above.
        Some(unsafe { mem::transmute::<u16, OpCode>(raw) })
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Null => "NULL",
            OpCode::Statfs => "STATFS",
            OpCode::NewInode => "NEW_INODE",
            OpCode::FreeInode => "FREE_INODE",
            OpCode::EvictInode => "EVICT_INODE",
            OpCode::Lookup => "LOOKUP",
            OpCode::AddDentry => "ADD_DENTRY",
            OpCode::RemoveDentry => "REMOVE_DENTRY",
            OpCode::Rename => "RENAME",
            OpCode::Readdir => "READDIR",
            OpCode::Clone => "CLONE",
            OpCode::Copy => "COPY",
            OpCode::Read => "READ",
            OpCode::PreRead => "PRE_READ",
            OpCode::Write => "WRITE",
            OpCode::GetBlock => "GET_BLOCK",
            OpCode::PutBlock => "PUT_BLOCK",
            OpCode::MmapClose => "MMAP_CLOSE",
            OpCode::GetSymlink => "GET_SYMLINK",
            OpCode::Setattr => "SETATTR",
            OpCode::Sync => "SYNC",
            OpCode::Fallocate => "FALLOCATE",
            OpCode::Llseek => "LLSEEK",
            OpCode::Ioctl => "IOCTL",
            OpCode::XattrGet => "XATTR_GET",
            OpCode::XattrSet => "XATTR_SET",
            OpCode::XattrList => "XATTR_LIST",
            OpCode::Break => "BREAK",
        }
    }
}

/// Mount-channel event codes, carried in the same header field.
pub const M_MOUNT: u16 = 1;
pub const M_UMOUNT: u16 = 2;
pub const M_REMOUNT: u16 = 3;
pub const M_DDBG_RD: u16 = 4;
pub const M_DDBG_WR: u16 = 5;

// ============================================================================
// OPERATION HEADER
// ============================================================================

/// Header flag: the kernel requests interruption of the op in flight.
pub const ZUFS_H_INTR: u16 = 1;

/// New-inode flags.
pub const ZI_TMPFILE: u32 = 1;
pub const ZI_LOOKUP_RACE: u32 = 2;

/// Common prefix of every relayed request. Handlers treat this as the head
/// of a wider per-op struct selected by `operation`. The worker folds the
/// handler result into `err` (kernel sign convention) before re-entering
/// the kernel.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct OpHeader {
    pub in_len: u32,
    pub out_len: u32,
    pub offset: u32,
    pub len: u32,
    pub operation: u16,
    pub flags: u16,
    pub err: i32,
}
const _: () = assert!(mem::size_of::<OpHeader>() == 24);

// ============================================================================
// EMBEDDED NAME STRING
// ============================================================================

pub const ZUFS_NAME_MAX: usize = 252;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ZufsStr {
    pub len: u32,
    pub name: [u8; ZUFS_NAME_MAX],
}
const _: () = assert!(mem::size_of::<ZufsStr>() == 256);

impl ZufsStr {
    pub fn as_bytes(&self) -> &[u8] {
        let n = (self.len as usize).min(ZUFS_NAME_MAX);
        &self.name[..n]
    }

    pub fn set(&mut self, s: &[u8]) {
        let n = s.len().min(ZUFS_NAME_MAX);
        self.name[..n].copy_from_slice(&s[..n]);
        self.len = n as u32;
    }
}

// ============================================================================
// ON-MEDIUM INODE
// ============================================================================

/// The persistent inode as it lives inside a pmem region. 128 bytes. The
/// core reads `i_ino` and `i_parent` for the "." / ".." lookup specials;
/// everything else is back-end territory.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ZusInode {
    pub i_flags: u16,
    pub i_mode: u16,
    pub i_nlink: u32,
    pub i_size: u64,
    pub i_blocks: u64,
    pub i_mtime: u64,
    pub i_ctime: u64,
    pub i_atime: u64,
    pub i_ino: u64,
    pub i_uid: u32,
    pub i_gid: u32,
    pub i_xattr: u64,
    pub i_generation: u64,
    /// Directories: parent ino. Device nodes: rdev.
    pub i_parent: u64,
    /// Short symlink target, inline.
    pub i_sym: [u8; 40],
}
const _: () = assert!(mem::size_of::<ZusInode>() == 128);

// ============================================================================
// CONTROL-CHANNEL STRUCTS
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ZufsCpuSet {
    pub bits: [u64; CPU_MASK_WORDS],
}
// The bitmask width must match the OS CPU-set type: the kernel memcpys its
// per-node masks straight into these words.
const _: () = assert!(mem::size_of::<ZufsCpuSet>() == mem::size_of::<libc::cpu_set_t>());

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocNumaMap {
    pub hdr: OpHeader,
    pub possible_cpus: u32,
    pub possible_nodes: u32,
    pub cpu_set_per_node: [ZufsCpuSet; MAX_NUMA_NODES],
}
const _: () = assert!(mem::size_of::<IocNumaMap>() <= PAGE_SIZE);

/// Page-aligned carrier for the NUMA-map exchange (the ioctl fills a page).
#[repr(C, align(4096))]
#[derive(Copy, Clone)]
pub struct NumaMapPage {
    pub map: IocNumaMap,
    _pad: [u8; PAGE_SIZE - mem::size_of::<IocNumaMap>()],
}

impl NumaMapPage {
    pub fn zeroed() -> Box<NumaMapPage> {
        // SAFETY: NumaMapPage is repr(C) of Pod fields plus padding; the
        // all-zero pattern is valid.
        unsafe { Box::new(mem::zeroed()) }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocInitZt {
    pub hdr: OpHeader,
    pub cpu: u32,
    pub channel: u32,
    pub max_command: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocRegisterFs {
    pub hdr: OpHeader,
    pub zus_zfi: u64,
    pub name: [u8; 16],
    pub version: u64,
    pub magic: u64,
    pub user_page_size: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocGrabPmem {
    pub hdr: OpHeader,
    pub pmem_kern_id: u32,
    pub _pad: u32,
    /// Out: region size in PMEM_BLOCK_SIZE blocks.
    pub pmem_total_blocks: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocAllocBuffer {
    pub hdr: OpHeader,
    pub init_size: u32,
    pub max_size: u32,
}

// ============================================================================
// MOUNT-CHANNEL EVENT
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct MountInfo {
    /// Filesystem token, as announced at registration; echoed by the kernel.
    pub zus_zfi: u64,
    /// Out: superblock token.
    pub zus_sbi: u64,
    /// Out: root inode token.
    pub zus_ii: u64,
    /// Out: pmem offset of the root's on-medium inode.
    pub zi_offset: u64,
    pub sb_id: u64,
    pub mount_flags: u64,
    pub pmem_kern_id: u32,
    pub num_channels: u32,
}

pub const DDBG_MSG_MAX: usize = 504;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct DdbgInfo {
    pub len: u64,
    pub msg: [u8; DDBG_MSG_MAX],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocMount {
    pub hdr: OpHeader,
    pub zmi: MountInfo,
    pub zdi: DdbgInfo,
}
const _: () = assert!(mem::size_of::<IocMount>() <= OP_BUFFER_BYTES);

// ============================================================================
// PER-OPERATION REQUEST STRUCTS
// Each begins with the OpHeader the worker received; the kernel selects the
// wide shape through OpHeader.operation.
// ============================================================================

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocNewInode {
    pub hdr: OpHeader,
    pub dir_ii: u64,
    /// Out: new inode token.
    pub zus_ii: u64,
    /// Out: pmem offset of the new on-medium inode.
    pub zi_offset: u64,
    pub flags: u32,
    pub _pad: u32,
    /// Requested attributes; the back-end copies these onto the medium.
    pub zi: ZusInode,
    pub str_: ZufsStr,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocEvict {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocLookup {
    pub hdr: OpHeader,
    pub dir_ii: u64,
    /// Out: resolved inode token.
    pub zus_ii: u64,
    /// Out: pmem offset of the resolved on-medium inode.
    pub zi_offset: u64,
    pub str_: ZufsStr,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocDentry {
    pub hdr: OpHeader,
    pub zus_dir_ii: u64,
    pub zus_ii: u64,
    pub str_: ZufsStr,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocRename {
    pub hdr: OpHeader,
    pub old_dir_ii: u64,
    pub new_dir_ii: u64,
    pub old_zus_ii: u64,
    pub new_zus_ii: u64,
    pub time: u64,
    pub flags: u32,
    pub _pad: u32,
    pub old_name: ZufsStr,
    pub new_name: ZufsStr,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocReaddir {
    pub hdr: OpHeader,
    pub dir_ii: u64,
    pub pos: u64,
    /// Out: more entries remain past the returned page.
    pub more: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocClone {
    pub hdr: OpHeader,
    pub src_zus_ii: u64,
    pub dst_zus_ii: u64,
    pub pos_in: u64,
    pub pos_out: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocIo {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub filepos: u64,
    /// Out: position reached (GET_BLOCK writes the physical mapping here).
    pub last_pos: u64,
    pub priv_: u64,
    pub rw_flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocMmapClose {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub rw: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocGetLink {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    /// Out: pmem offset of the symlink target.
    pub link_offset: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocAttr {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub truncate_size: u64,
    pub attr_mask: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocRange {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub offset: u64,
    pub length: u64,
    pub opflags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocSeek {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub offset_in: u64,
    /// Out: resolved offset.
    pub offset_out: u64,
    pub whence: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocIoctl {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub arg: u64,
    pub cmd: u32,
    pub _pad: u32,
}

/// Xattr name travels embedded; the value page lives in the app region at
/// OpHeader.offset.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocXattr {
    pub hdr: OpHeader,
    pub zus_ii: u64,
    pub xattr_flags: u32,
    pub user_buf_size: u32,
    pub str_: ZufsStr,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct StatfsData {
    pub f_type: u64,
    pub f_bsize: u64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_namelen: u64,
    pub f_frsize: u64,
    pub f_flags: u64,
    pub f_fsid: [u64; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IocStatfs {
    pub hdr: OpHeader,
    pub zus_sbi: u64,
    pub statfs: StatfsData,
}

// Every request struct must fit the mapped op window.
const _: () = assert!(mem::size_of::<IocNewInode>() <= OP_BUFFER_BYTES);
const _: () = assert!(mem::size_of::<IocRename>() <= OP_BUFFER_BYTES);
const _: () = assert!(mem::size_of::<IocXattr>() <= OP_BUFFER_BYTES);
const _: () = assert!(mem::size_of::<IocStatfs>() <= OP_BUFFER_BYTES);

// ============================================================================
// IOCTL REQUEST NUMBERS
// ============================================================================

const IOC_NRBITS: u64 = 8;
const IOC_TYPEBITS: u64 = 8;
const IOC_SIZEBITS: u64 = 14;
const IOC_READ: u64 = 2;
const IOC_WRITE: u64 = 1;
const ZUFS_IOC_MAGIC: u64 = b'Z' as u64;

const fn zu_iowr(nr: u64, size: usize) -> u64 {
    ((IOC_READ | IOC_WRITE) << (IOC_NRBITS + IOC_TYPEBITS + IOC_SIZEBITS))
        | ((size as u64) << (IOC_NRBITS + IOC_TYPEBITS))
        | (ZUFS_IOC_MAGIC << IOC_NRBITS)
        | nr
}

pub const ZU_IOC_REGISTER_FS: u64 = zu_iowr(10, mem::size_of::<IocRegisterFs>());
pub const ZU_IOC_NUMA_MAP: u64 = zu_iowr(11, mem::size_of::<IocNumaMap>());
pub const ZU_IOC_GRAB_PMEM: u64 = zu_iowr(12, mem::size_of::<IocGrabPmem>());
pub const ZU_IOC_INIT_ZT: u64 = zu_iowr(13, mem::size_of::<IocInitZt>());
pub const ZU_IOC_WAIT_OPT: u64 = zu_iowr(14, mem::size_of::<OpHeader>());
pub const ZU_IOC_BREAK_ALL: u64 = zu_iowr(15, mem::size_of::<OpHeader>());
pub const ZU_IOC_ALLOC_BUFFER: u64 = zu_iowr(16, mem::size_of::<IocAllocBuffer>());
pub const ZU_IOC_MOUNT: u64 = zu_iowr(17, mem::size_of::<OpHeader>());

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for raw in 0..=OpCode::Break as u16 {
            let op = OpCode::from_raw(raw).expect("contiguous code space");
            assert_eq!(op as u16, raw);
            assert_ne!(op.name(), "UNKNOWN");
        }
        assert!(OpCode::from_raw(OpCode::Break as u16 + 1).is_none());
        assert!(OpCode::from_raw(u16::MAX).is_none());
    }

    #[test]
    fn zufs_str_clamps() {
        let mut s = ZufsStr::zeroed();
        s.set(b"hello");
        assert_eq!(s.as_bytes(), b"hello");
        let long = [b'x'; 300];
        s.set(&long);
        assert_eq!(s.as_bytes().len(), ZUFS_NAME_MAX);
    }

    #[test]
    fn ioctl_size_field_fits() {
        // 14-bit size field; the wait/break/mount requests deliberately
        // encode only the header size.
        assert!(mem::size_of::<IocNumaMap>() < (1 << IOC_SIZEBITS));
        assert!(mem::size_of::<IocRegisterFs>() < (1 << IOC_SIZEBITS));
        assert_ne!(ZU_IOC_WAIT_OPT, ZU_IOC_BREAK_ALL);
    }

    #[test]
    fn numa_page_is_page_aligned() {
        let page = NumaMapPage::zeroed();
        assert_eq!(&*page as *const NumaMapPage as usize % PAGE_SIZE, 0);
    }
}
