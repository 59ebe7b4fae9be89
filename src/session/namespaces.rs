//! Namespace joining for live targets.
//!
//! The order below is load-bearing:
//!
//! 1. unshare(CLONE_NEWNS) decouples the worker from the host's mounts.
//! 2. setns(pid) comes before any spawn because CLONE_NEWPID binds
//!    children only.
//! 3. setns(mnt) switches to the target's filesystem view.
//! 4. A second unshare plus MS_REC|MS_PRIVATE on `/` gives a private copy
//!    so overlay and bind mounts never leak into the container.
//! 5. net/ipc/uts joins are order-independent among themselves.

use std::fs::File;

use anyhow::{Context, Result};
use nix::{
    mount::{mount, MsFlags},
    sched::{setns, unshare, CloneFlags},
};
use tracing::trace;

use crate::{error::DebugError, podman};

const OPTIONAL_NAMESPACES: [(&str, CloneFlags); 4] = [
    ("pid", CloneFlags::CLONE_NEWPID),
    ("net", CloneFlags::CLONE_NEWNET),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
];

/// Join the namespaces of the container whose init is `pid`. Must run on
/// the worker thread; the caller's mount view changes permanently.
pub fn join_container(pid: i32) -> Result<()> {
    let mnt_path = podman::namespace_path(pid, "mnt");
    let mnt = File::open(&mnt_path)
        .with_context(|| format!("opening mount namespace {}", mnt_path))?;

    // pid/net/ipc/uts handles are tolerated missing (host-network
    // containers, hidden pid dirs); mnt is fatal above
    let optional: Vec<(File, CloneFlags)> = OPTIONAL_NAMESPACES
        .iter()
        .filter_map(|(kind, flag)| {
            File::open(podman::namespace_path(pid, kind))
                .ok()
                .map(|f| (f, *flag))
        })
        .collect();

    trace!("unshare mount namespace");
    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|e| DebugError::from_mount_errno("unshare mount namespace", e))?;

    for (fd, flag) in &optional {
        if *flag == CloneFlags::CLONE_NEWPID {
            trace!("join target pid namespace");
            let _ = setns(fd, *flag);
        }
    }

    trace!("join target mount namespace");
    setns(&mnt, CloneFlags::CLONE_NEWNS)
        .map_err(|e| DebugError::from_mount_errno("joining mount namespace", e))?;

    trace!("unshare mount namespace (private copy)");
    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|e| DebugError::from_mount_errno("unshare mount namespace (private copy)", e))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("making / private")?;

    for (fd, flag) in &optional {
        if *flag != CloneFlags::CLONE_NEWPID {
            trace!(?flag, "join target namespace");
            let _ = setns(fd, *flag);
        }
    }

    // handles close here, after every setns is done
    Ok(())
}
