// ZUS CORE — CRATE ROOT (LIBRARY)
// User-space half of the zuf/zus filesystem protocol: a grid of CPU-pinned
// dispatcher threads blocks inside the kernel relay, executes VFS operations
// against memory-mapped persistent-memory regions, and returns results inline.
//
// Module hierarchy:
//   engine/   — runtime infrastructure: fatal exit, config, topology map,
//               thread primitive, wait-for-zero barrier, file-backed buffers
//   relay/    — kernel control-device protocol: wire ABI, transport seam,
//               real ioctl/mmap transport
//   vfs/      — back-end vtable traits, superblock/inode bindings, token
//               tables, pmem regions, mount paths, operation demultiplexer
//   dispatch/ — the runtime handle, the worker grid, the mount controller

pub mod dispatch;
pub mod engine;
pub mod relay;
pub mod vfs;
