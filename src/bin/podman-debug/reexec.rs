//! The binary's two re-entry modes: the PID 1 init helper and the rootless
//! re-exec under `podman unshare`.

use std::{env, ffi::CString, os::unix::ffi::OsStrExt, process};

use nix::{
    mount::{mount, MsFlags},
    unistd::{execv, execvp},
};

/// Guards against infinite re-exec recursion.
pub const UNSHARED_ENV: &str = "_PODMAN_DEBUG_UNSHARED";

/// `--init-proc` handler. Runs as PID 1 inside the new PID namespace
/// created for snapshot/image sessions: mount a fresh /proc so ps/top only
/// show the session's own processes, then exec the shell.
pub fn init_proc(shell: &str, args: &[String]) -> ! {
    // best-effort: without /proc the session is degraded, not broken
    let _ = mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    );

    let argv: Option<Vec<CString>> = std::iter::once(shell)
        .chain(args.iter().map(String::as_str))
        .map(|a| CString::new(a).ok())
        .collect();

    if let (Ok(path), Some(argv)) = (CString::new(shell), argv) {
        let _ = execv(&path, &argv);
    }
    eprintln!(
        "Error: exec {}: {}",
        shell,
        std::io::Error::last_os_error()
    );
    process::exit(125);
}

/// Re-exec the current binary under `podman unshare` so we run inside
/// podman's user namespace (the one its containers use) with full
/// subordinate ID mappings and CAP_SYS_ADMIN. Replaces the process to
/// preserve the TTY, signals, and exit code.
pub fn via_podman_unshare() -> ! {
    let self_exe = match env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: cannot determine own executable path: {e}");
            process::exit(125);
        }
    };

    env::set_var(UNSHARED_ENV, "1");

    // podman unshare -- <self> <args...>; the "--" keeps podman unshare
    // from parsing our flags
    let argv: Option<Vec<CString>> = ["podman", "unshare", "--"]
        .into_iter()
        .map(|a| CString::new(a).ok())
        .chain(std::iter::once(
            CString::new(self_exe.as_os_str().as_bytes()).ok(),
        ))
        .chain(env::args().skip(1).map(|a| CString::new(a).ok()))
        .collect();

    if let Some(argv) = argv {
        let _ = execvp(c"podman", &argv);
    }
    eprintln!(
        "Error: exec podman unshare: {}",
        std::io::Error::last_os_error()
    );
    process::exit(125);
}
