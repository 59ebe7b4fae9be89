//! Core debug session construction: overlay filesystem assembly, namespace
//! joining, and supervised shell execution.
//!
//! A session runs as two tasks. The worker is a dedicated OS thread that
//! performs every mount, namespace, and chroot syscall (these bind to the
//! kernel task, so the thread must never run anything else) and finally
//! spawns and reaps the shell. The supervisor is the calling thread; it
//! receives the PTY master over a bounded channel and pumps terminal I/O.

mod environment;
mod namespaces;
mod overlay;
mod payload;
pub mod terminal;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
    sync::mpsc,
    thread,
};

use anyhow::{Context, Result};
use nix::{
    mount::{mount, MsFlags},
    sched::{unshare, CloneFlags},
    sys::prctl,
    unistd::{chdir, chroot},
};
use tracing::trace;

use crate::{err, error::DebugError, newmount, podman::EntrypointInfo};

pub use terminal::RawModeGuard;

/// bin directory of the toolbox's default nix profile
pub const NIX_PROFILE_BIN: &str = "/nix/var/nix/profiles/default/bin";

/// Session target, fixed for the session lifetime.
#[derive(Debug, Clone)]
pub enum Target {
    /// Running or paused container; namespaces are joined via this PID.
    Live { pid: i32 },
    /// Stopped container, mounted host-side.
    Snapshot { host_root: PathBuf },
    /// Bare image, mounted host-side.
    Image { host_root: PathBuf },
}

/// Session configuration beyond the target itself.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Write through to the live target instead of a discarded overlay.
    /// Only honored for [`Target::Live`].
    pub writable: bool,
    pub entrypoint: Option<EntrypointInfo>,
}

/// I/O handles for the session. An absent stdin means non-interactive.
pub struct Streams {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

/// Resolve the target path for an absolute in-session path like
/// `/.podman-debug/bin` under the merged view.
pub(crate) fn under(root: &Path, abs: &str) -> PathBuf {
    root.join(abs.trim_start_matches('/'))
}

/// Pick the shell binary from the user preference. `auto` means bash from
/// the toolbox profile; relative names resolve against the profile bin.
pub fn detect_shell(preference: &str) -> PathBuf {
    if !preference.is_empty() && preference != "auto" {
        let p = Path::new(preference);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        return Path::new(NIX_PROFILE_BIN).join(preference);
    }
    Path::new(NIX_PROFILE_BIN).join("bash")
}

struct Session {
    target: Target,
    nix_path: PathBuf,
    shell: PathBuf,
    shell_args: Vec<String>,
    opts: Options,
}

/// Run a debug session against `target`, blocking until the shell exits.
/// Returns the shell's exit code.
pub fn exec(
    target: Target,
    nix_path: &Path,
    shell: &Path,
    shell_args: &[String],
    streams: Streams,
    opts: Options,
) -> Result<i32> {
    // the supervisor's signalfd must own SIGWINCH delivery in every thread
    // spawned from here on
    terminal::block_sigwinch()?;

    let interactive = shell_args.is_empty();
    let sup_stdin = streams
        .stdin
        .as_ref()
        .map(File::try_clone)
        .transpose()
        .context("duplicating stdin")?;
    let sup_stdout = streams
        .stdout
        .as_ref()
        .map(File::try_clone)
        .transpose()
        .context("duplicating stdout")?;

    let (res_tx, res_rx) = mpsc::sync_channel::<Result<i32>>(1);
    let (pty_tx, pty_rx) = mpsc::sync_channel(1);

    let session = Session {
        target,
        nix_path: nix_path.to_path_buf(),
        shell: shell.to_path_buf(),
        shell_args: shell_args.to_vec(),
        opts,
    };

    let worker = thread::Builder::new()
        .name("session-worker".into())
        .spawn(move || {
            let res = worker_main(session, streams, interactive, pty_tx);
            let _ = res_tx.send(res);
        })
        .context("spawning session worker")?;

    let code = terminal::supervise(pty_rx, res_rx, sup_stdin, sup_stdout);
    let _ = worker.join();
    code
}

fn worker_main(
    session: Session,
    streams: Streams,
    interactive: bool,
    pty_tx: mpsc::SyncSender<std::os::fd::OwnedFd>,
) -> Result<i32> {
    // the worker must not outlive the dispatcher process
    unsafe {
        let _ = err(libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0));
    }
    let _ = prctl::set_no_new_privs();

    // Clone the toolbox tree before any namespace change; the detached
    // descriptor is the only thing that survives the switches below.
    trace!(path = %session.nix_path.display(), "cloning toolbox mount tree");
    let nix_tree = newmount::open_tree(
        &session.nix_path,
        libc::OPEN_TREE_CLOEXEC | libc::OPEN_TREE_CLONE | libc::AT_RECURSIVE as u32,
    )
    .map_err(|e| {
        DebugError::from_newmount_errno(format!("open_tree({})", session.nix_path.display()), e)
    })?;

    let scratch = overlay::scratch_base();
    let writable = session.opts.writable && matches!(session.target, Target::Live { .. });

    let merged = match &session.target {
        Target::Live { pid } => {
            namespaces::join_container(*pid)?;
            setup_live_view(&scratch, nix_tree, writable)?
        }
        Target::Snapshot { host_root } | Target::Image { host_root } => {
            trace!("unshare mount namespace");
            unshare(CloneFlags::CLONE_NEWNS)
                .map_err(|e| DebugError::from_mount_errno("unshare mount namespace", e))?;
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .context("making / private")?;
            setup_snapshot_view(&scratch, host_root, nix_tree)?
        }
    };

    environment::write_nix_config(&merged);
    payload::write_builtins(&merged, session.opts.entrypoint.as_ref());

    trace!(merged = %merged.display(), "entering merged view");
    chroot(&merged).map_err(|e| DebugError::from_mount_errno("chroot to overlay", e))?;
    chdir("/").context("chdir to /")?;

    environment::setup(&session.shell);

    let mut cmd = match session.target {
        Target::Live { .. } => {
            let mut c = Command::new(&session.shell);
            c.args(&session.shell_args);
            c
        }
        Target::Snapshot { .. } | Target::Image { .. } => {
            // A fresh PID namespace binds children only, so it must exist
            // before the spawn. The init helper becomes PID 1 there and
            // mounts a fresh /proc before exec'ing the shell.
            unshare(CloneFlags::CLONE_NEWPID)
                .map_err(|e| DebugError::from_mount_errno("unshare pid namespace", e))?;
            let mut c = Command::new(payload::INIT_BINARY_PATH);
            c.arg("--init-proc").arg(&session.shell).args(&session.shell_args);
            c
        }
    };
    cmd.current_dir("/");

    let exit_code = terminal::run_shell(cmd, streams, interactive, pty_tx)?;

    if writable {
        // the /nix bind sits on the target's real root; everything else
        // disappears with this mount namespace
        overlay::cleanup_live_nix_dir();
    }

    Ok(exit_code)
}

fn setup_live_view(
    scratch: &Path,
    nix_tree: std::os::fd::OwnedFd,
    writable: bool,
) -> Result<PathBuf> {
    let merged = overlay::create_overlay(scratch, Path::new("/"), writable)?;

    let nix_mount = merged.join("nix");
    if writable {
        overlay::create_live_nix_dir(&nix_mount)?;
    } else {
        fs::create_dir_all(&nix_mount).context("creating /nix in overlay")?;
    }
    overlay::mount_nix_store(nix_tree, &nix_mount, scratch)?;

    if !writable {
        // the overlay lower does not carry the container's submounts
        overlay::bind_host_mounts(&merged);
    }

    Ok(merged)
}

fn setup_snapshot_view(
    scratch: &Path,
    host_root: &Path,
    nix_tree: std::os::fd::OwnedFd,
) -> Result<PathBuf> {
    let merged = overlay::create_overlay(scratch, host_root, false)?;

    let nix_mount = merged.join("nix");
    fs::create_dir_all(&nix_mount).context("creating /nix in overlay")?;
    overlay::mount_nix_store(nix_tree, &nix_mount, scratch)?;

    overlay::bind_snapshot_mounts(&merged);

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_auto_resolves_to_profile_bash() {
        assert_eq!(
            detect_shell("auto"),
            Path::new("/nix/var/nix/profiles/default/bin/bash")
        );
        assert_eq!(
            detect_shell(""),
            Path::new("/nix/var/nix/profiles/default/bin/bash")
        );
    }

    #[test]
    fn shell_relative_joins_profile_bin() {
        assert_eq!(
            detect_shell("zsh"),
            Path::new("/nix/var/nix/profiles/default/bin/zsh")
        );
    }

    #[test]
    fn shell_absolute_used_verbatim() {
        assert_eq!(detect_shell("/bin/sh"), Path::new("/bin/sh"));
    }

    #[test]
    fn under_strips_leading_slash() {
        assert_eq!(
            under(Path::new("/tmp/merged"), "/.podman-debug/bin"),
            Path::new("/tmp/merged/.podman-debug/bin")
        );
        assert_eq!(
            under(Path::new("/tmp/merged"), "/etc/nix"),
            Path::new("/tmp/merged/etc/nix")
        );
    }
}
