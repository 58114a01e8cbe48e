// ZUSD — EXECUTIVE
// Process bring-up for the user-space filesystem runtime: argument parsing,
// signal handlers, memory locking, then the mount controller. Back-ends link
// against the library and register through zus_core::vfs before start; the
// stock daemon ships with none and simply serves whatever was registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zus_core::dispatch::Runtime;
use zus_core::engine::runtime::{
    apply_mlock, fatal, set_dbg_mask, MlockMode, E_BAD_ARGS, E_MLOCK_FAIL, E_MOUNT_THREAD,
    E_RELAY_OPEN,
};
use zus_core::engine::thread::{SchedPolicy, ThreadParams};
use zus_core::relay::kernel::KernelRelay;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn usage() -> ! {
    eprintln!(
        "Usage: zusd [--root <path>] [--debug <hexmask>] [--policy rr:<prio>|fifo:<prio>|other] [--mlock none|current|all]"
    );
    std::process::exit(E_BAD_ARGS);
}

struct Config {
    root: Option<String>,
    dbg_mask: u64,
    policy: SchedPolicy,
    mlock: MlockMode,
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = Config {
        root: std::env::var("ZUFS_ROOT").ok(),
        dbg_mask: std::env::var("ZUS_DBGMASK")
            .ok()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0),
        policy: SchedPolicy::Other,
        mlock: MlockMode::Current,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--root" if i + 1 < args.len() => {
                cfg.root = Some(args[i + 1].clone());
                i += 1;
            }
            "--debug" if i + 1 < args.len() => {
                let s = args[i + 1].trim_start_matches("0x");
                cfg.dbg_mask = match u64::from_str_radix(s, 16) {
                    Ok(m) => m,
                    Err(_) => fatal(E_BAD_ARGS, "bad --debug mask"),
                };
                i += 1;
            }
            "--policy" if i + 1 < args.len() => {
                let v = args[i + 1].as_str();
                cfg.policy = if v == "other" {
                    SchedPolicy::Other
                } else if let Some(p) = v.strip_prefix("rr:") {
                    match p.parse() {
                        Ok(p) => SchedPolicy::Rr(p),
                        Err(_) => fatal(E_BAD_ARGS, "bad rr priority"),
                    }
                } else if let Some(p) = v.strip_prefix("fifo:") {
                    match p.parse() {
                        Ok(p) => SchedPolicy::Fifo(p),
                        Err(_) => fatal(E_BAD_ARGS, "bad fifo priority"),
                    }
                } else {
                    fatal(E_BAD_ARGS, "bad --policy")
                };
                i += 1;
            }
            "--mlock" if i + 1 < args.len() => {
                cfg.mlock = match args[i + 1].as_str() {
                    "none" => MlockMode::None,
                    "current" => MlockMode::Current,
                    "all" => MlockMode::All,
                    _ => fatal(E_BAD_ARGS, "bad --mlock mode"),
                };
                i += 1;
            }
            "--help" | "-h" => usage(),
            other => {
                eprintln!("[ZUS-EXEC] unknown argument: {}", other);
                usage();
            }
        }
        i += 1;
    }
    cfg
}

// ── MAIN ───────────────────────────────────────────────────────────────────

fn main() {
    let cfg = parse_args();
    set_dbg_mask(cfg.dbg_mask);

    // SAFETY: the handler performs a single atomic store, which is
    // async-signal-safe. SIGINT/SIGTERM also interrupt the mount thread's
    // blocking receive, which is what lets shutdown join it.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[ZUS-EXEC] PANIC: {}", info);
        std::process::exit(1);
    }));

    if apply_mlock(cfg.mlock).is_err() {
        fatal(E_MLOCK_FAIL, "mlockall failed (missing CAP_IPC_LOCK?)");
    }

    let relay = match KernelRelay::new(cfg.root.as_deref()) {
        Ok(r) => r,
        Err(_) => fatal(E_RELAY_OPEN, "bad relay root path"),
    };
    eprintln!("[ZUS-EXEC] relay root [{}] dbgmask=0x{:x}", relay.root(), cfg.dbg_mask);

    let rt = Runtime::new(Arc::new(relay));

    let mut ztp = ThreadParams::new();
    ztp.policy = cfg.policy;
    if rt.mount_thread_start(ztp).is_err() {
        fatal(E_MOUNT_THREAD, "mount thread start failed");
    }

    while !SHUTDOWN.load(Ordering::Relaxed) {
        if rt.mount_err() != 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    eprintln!("[ZUS-EXEC] shutting down");
    rt.mount_thread_stop();

    let err = rt.mount_err();
    if err != 0 {
        eprintln!("[ZUS-EXEC] exit with mount error {}", err);
        std::process::exit(1);
    }
    eprintln!("[ZUS-EXEC] clean exit");
}
