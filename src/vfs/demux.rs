// ZUS CORE — VFS: OPERATION DEMULTIPLEXER
// Pure routing from (op code, header, app pointer) to the target vtable.
// The header is the prefix of a wider request struct selected by the code;
// every code maps to exactly one handler, and the only fallthrough is the
// UNKNOWN log. Callers fold the returned value through the kernel sign
// convention before writing it back.

use crate::engine::runtime::{dbg_on, fold, Errno, SysResult, DBG_VFS};
use crate::relay::abi::*;
use crate::vfs::{iget, InodeInfo, SbInfo, VfsState};
use std::sync::Arc;

fn ii_of(vfs: &VfsState, token: u64) -> SysResult<Arc<InodeInfo>> {
    match vfs.inode_tokens.get(token) {
        Some(ii) => Ok(ii),
        None => {
            eprintln!("[ZUS-VFS] stale inode token {}", token);
            Err(Errno(libc::EINVAL))
        }
    }
}

fn sb_of(vfs: &VfsState, token: u64) -> SysResult<Arc<SbInfo>> {
    match vfs.sb_tokens.get(token) {
        Some(sb) => Ok(sb),
        None => {
            eprintln!("[ZUS-VFS] stale sb token {}", token);
            Err(Errno(libc::EINVAL))
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

fn new_inode(vfs: &VfsState, app_ptr: *mut u8, ioc: &mut IocNewInode) -> SysResult<()> {
    let dir = ii_of(vfs, ioc.dir_ii)?;
    let sb = dir.sb.clone();

    // Protocol starts at zero refs; add_dentry takes the first one. (The
    // kernel counts one here, except for O_TMPFILE.)
    ioc.zi.i_nlink = 0;
    let tmpfile = ioc.flags & ZI_TMPFILE != 0;

    let zii = sb.ops.new_inode(&sb, app_ptr, ioc)?;
    ioc.zi_offset = sb.pmem.addr_to_offset(zii.zi_raw() as *const u8);
    let token = vfs.inode_tokens.insert(zii.clone());
    ioc.zus_ii = token;

    if tmpfile {
        return Ok(());
    }

    if let Err(e) = sb.ops.add_dentry(&dir, &zii, &ioc.str_) {
        sb.ops.free_inode(&zii);
        vfs.inode_tokens.remove(token);
        ioc.zus_ii = 0;
        return Err(e);
    }
    Ok(())
}

fn evict(vfs: &VfsState, ioc: &mut IocEvict, code: OpCode) -> SysResult<()> {
    let zii = match vfs.inode_tokens.remove(ioc.zus_ii) {
        Some(zii) => zii,
        None => {
            eprintln!("[ZUS-VFS] evict: no binding for token {}", ioc.zus_ii);
            return Ok(());
        }
    };

    if code == OpCode::FreeInode {
        zii.sb.ops.free_inode(&zii);
    } else {
        // A lost lookup race delivers EVICT_INODE for the extra binding the
        // losing thread allocated; only the release applies, not evict.
        if ioc.flags & ZI_LOOKUP_RACE == 0 {
            zii.ops.evict(&zii);
        }
    }
    // Dropping the binding is the release; the back-end's Drop is its
    // zii teardown hook.
    Ok(())
}

fn lookup(vfs: &VfsState, ioc: &mut IocLookup) -> SysResult<()> {
    let name = ioc.str_.as_bytes();
    if name.is_empty() || name[0] == 0 {
        eprintln!("[ZUS-VFS] lookup NULL string");
        return Ok(());
    }

    let dir = ii_of(vfs, ioc.dir_ii)?;
    let ino = if name == b"." {
        dir.zi().i_ino
    } else if name == b".." {
        dir.zi().i_parent
    } else {
        dir.sb.ops.lookup(&dir, &ioc.str_)
    };

    if ino == 0 {
        if dbg_on(DBG_VFS) {
            eprintln!("[ZUS-VFS] [{}] NOT FOUND", String::from_utf8_lossy(name));
        }
        return Err(Errno(libc::ENOENT));
    }

    let zii = match iget(&dir.sb, ino) {
        Ok(zii) => zii,
        Err(_) => return Err(Errno(libc::ENOENT)),
    };
    ioc.zi_offset = zii.sb.pmem.addr_to_offset(zii.zi_raw() as *const u8);
    ioc.zus_ii = vfs.inode_tokens.insert(zii);
    Ok(())
}

fn dentry(vfs: &VfsState, ioc: &mut IocDentry, code: OpCode) -> SysResult<()> {
    let dir = ii_of(vfs, ioc.zus_dir_ii)?;
    let zii = ii_of(vfs, ioc.zus_ii)?;
    if code == OpCode::RemoveDentry {
        dir.sb.ops.remove_dentry(&dir, &zii, &ioc.str_)
    } else {
        dir.sb.ops.add_dentry(&dir, &zii, &ioc.str_)
    }
}

fn rename(vfs: &VfsState, ioc: &mut IocRename) -> SysResult<()> {
    let old_dir = ii_of(vfs, ioc.old_dir_ii)?;
    let new_dir = ii_of(vfs, ioc.new_dir_ii)?;
    old_dir.sb.ops.rename(&old_dir, &new_dir, ioc)
}

fn readdir(vfs: &VfsState, app_ptr: *mut u8, ioc: &mut IocReaddir) -> SysResult<()> {
    let dir = ii_of(vfs, ioc.dir_ii)?;
    dir.sb.ops.readdir(app_ptr, &dir, ioc)
}

fn clone_range(vfs: &VfsState, ioc: &mut IocClone) -> SysResult<()> {
    let src = ii_of(vfs, ioc.src_zus_ii)?;
    let dst = ii_of(vfs, ioc.dst_zus_ii)?;
    src.sb.ops.clone_range(&src, &dst, ioc)
}

fn io_rw(vfs: &VfsState, app_ptr: *mut u8, ioc: &mut IocIo, code: OpCode) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    match code {
        OpCode::Read => zii.ops.read(app_ptr, ioc),
        OpCode::PreRead => zii.ops.pre_read(app_ptr, ioc),
        OpCode::Write => zii.ops.write(app_ptr, ioc),
        _ => unreachable!(),
    }
}

fn get_put_block(vfs: &VfsState, ioc: &mut IocIo, code: OpCode) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    if code == OpCode::PutBlock {
        zii.ops.put_block(ioc)
    } else {
        zii.ops.get_block(ioc)
    }
}

fn mmap_close(vfs: &VfsState, ioc: &mut IocMmapClose) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    zii.ops.mmap_close(ioc)
}

fn get_symlink(vfs: &VfsState, ioc: &mut IocGetLink) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    let sym = zii.ops.get_symlink(&zii)?;
    if !sym.is_null() {
        ioc.link_offset = zii.sb.pmem.addr_to_offset(sym);
    }
    Ok(())
}

fn setattr(vfs: &VfsState, ioc: &mut IocAttr) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    zii.ops.setattr(ioc.attr_mask, ioc.truncate_size)
}

fn range_op(vfs: &VfsState, ioc: &mut IocRange, code: OpCode) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    if code == OpCode::Sync {
        zii.ops.sync(ioc)
    } else {
        zii.ops.fallocate(ioc)
    }
}

fn seek(vfs: &VfsState, ioc: &mut IocSeek) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    zii.ops.seek(ioc)
}

fn ioctl(vfs: &VfsState, ioc: &mut IocIoctl) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    zii.ops.ioctl(ioc)
}

fn xattr(vfs: &VfsState, app_ptr: *mut u8, ioc: &mut IocXattr, code: OpCode) -> SysResult<()> {
    let zii = ii_of(vfs, ioc.zus_ii)?;
    match code {
        OpCode::XattrGet => zii.ops.getxattr(app_ptr, ioc),
        OpCode::XattrSet => zii.ops.setxattr(app_ptr, ioc),
        OpCode::XattrList => zii.ops.listxattr(app_ptr, ioc),
        _ => unreachable!(),
    }
}

fn statfs(vfs: &VfsState, ioc: &mut IocStatfs) -> SysResult<()> {
    let sb = sb_of(vfs, ioc.zus_sbi)?;
    sb.ops.statfs(&sb, ioc)
}

// ── Dispatch ────────────────────────────────────────────────────────────

/// Route one operation. `app_ptr` is the worker's app window plus the
/// header offset; `hdr` heads the mapped op window. Returns the raw handler
/// result; the worker applies the kernel sign convention.
pub fn do_command(vfs: &VfsState, app_ptr: *mut u8, hdr: *mut OpHeader) -> i32 {
    // SAFETY: hdr heads a live OP_BUFFER_BYTES window owned by the calling
    // worker; every request struct below fits it (asserted in abi) and the
    // kernel selected the shape through hdr.operation.
    unsafe {
        let raw = (*hdr).operation;
        let code = match OpCode::from_raw(raw) {
            Some(code) => code,
            None => {
                eprintln!("[ZUS-VFS] unknown OP={}", raw);
                return 0;
            }
        };

        if dbg_on(DBG_VFS) {
            eprintln!(
                "[ZUS-VFS] [{}] OP={} off=0x{:x} len=0x{:x}",
                code.name(),
                raw,
                (*hdr).offset,
                (*hdr).len
            );
        }

        let res: SysResult<()> = match code {
            OpCode::Null => Ok(()),
            OpCode::Statfs => statfs(vfs, &mut *(hdr as *mut IocStatfs)),
            OpCode::NewInode => new_inode(vfs, app_ptr, &mut *(hdr as *mut IocNewInode)),
            OpCode::FreeInode | OpCode::EvictInode => {
                evict(vfs, &mut *(hdr as *mut IocEvict), code)
            }
            OpCode::Lookup => lookup(vfs, &mut *(hdr as *mut IocLookup)),
            OpCode::AddDentry | OpCode::RemoveDentry => {
                dentry(vfs, &mut *(hdr as *mut IocDentry), code)
            }
            OpCode::Rename => rename(vfs, &mut *(hdr as *mut IocRename)),
            OpCode::Readdir => readdir(vfs, app_ptr, &mut *(hdr as *mut IocReaddir)),
            OpCode::Clone | OpCode::Copy => clone_range(vfs, &mut *(hdr as *mut IocClone)),
            OpCode::Read | OpCode::PreRead | OpCode::Write => {
                io_rw(vfs, app_ptr, &mut *(hdr as *mut IocIo), code)
            }
            OpCode::GetBlock | OpCode::PutBlock => {
                get_put_block(vfs, &mut *(hdr as *mut IocIo), code)
            }
            OpCode::MmapClose => mmap_close(vfs, &mut *(hdr as *mut IocMmapClose)),
            OpCode::GetSymlink => get_symlink(vfs, &mut *(hdr as *mut IocGetLink)),
            OpCode::Setattr => setattr(vfs, &mut *(hdr as *mut IocAttr)),
            OpCode::Sync | OpCode::Fallocate => {
                range_op(vfs, &mut *(hdr as *mut IocRange), code)
            }
            OpCode::Llseek => seek(vfs, &mut *(hdr as *mut IocSeek)),
            OpCode::Ioctl => ioctl(vfs, &mut *(hdr as *mut IocIoctl)),
            OpCode::XattrGet | OpCode::XattrSet | OpCode::XattrList => {
                xattr(vfs, app_ptr, &mut *(hdr as *mut IocXattr), code)
            }
            // Poison pill: the stop flag decides whether the loop exits.
            OpCode::Break => Ok(()),
        };
        fold(res)
    }
}

// ============================================================================
// TESTS
// ============================================================================
