//! Scratch area and overlay construction for the merged view.

use std::{
    fs::{self, File},
    io,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
};
use tracing::trace;

use super::under;
use crate::{error::DebugError, newmount};

/// Marks /nix directories we created on a live target's real root, so
/// cleanup never deletes one the image already had.
const NIX_DIR_XATTR: &str = "user.podman-debug";

/// Scratch root for the session's tmpfs. Per-process so two sessions on
/// one host never race; the whole tree disappears with the worker's mount
/// namespace.
pub fn scratch_base() -> PathBuf {
    PathBuf::from(format!("/tmp/.podman-debug-overlay.{}", std::process::id()))
}

fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    )
}

fn mount_overlay(target: &Path, lower: &Path, upper: &Path, work: &Path) -> Result<()> {
    let options = overlay_options(lower, upper, work);
    trace!(target = %target.display(), %options, "mounting overlay");
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| match e {
        // an existing overlay (or other unstackable fs) cannot be a lower
        Errno::EINVAL => DebugError::OverlayUnsupported {
            lower: lower.display().to_string(),
            errno: e,
        }
        .into(),
        e => DebugError::from_mount_errno("mounting overlay", e),
    })
}

/// Build the root overlay on top of `lower_dir` and return the merged
/// directory. With `writable` the finished overlay is immediately shadowed
/// by a recursive bind of `lower_dir`, turning copy-on-write into
/// write-through while keeping the same return path.
pub fn create_overlay(base: &Path, lower_dir: &Path, writable: bool) -> Result<PathBuf> {
    fs::create_dir_all(base).context("creating overlay base")?;
    mount(
        Some("tmpfs"),
        base,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=1G"),
    )
    .map_err(|e| DebugError::from_mount_errno("mounting scratch tmpfs", e))?;

    let upper = base.join("upper");
    let work = base.join("work");
    let merged = base.join("merged");
    for dir in [&upper, &work, &merged] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    mount_overlay(&merged, lower_dir, &upper, &work)?;

    if writable {
        mount(
            Some(lower_dir),
            &merged,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .context("rebinding root into overlay")?;
    }

    Ok(merged)
}

/// Move the detached toolbox tree into the scratch area and overlay a
/// writable layer on top at `nix_mount_point`, so in-session package
/// installs work without mutating the toolbox image.
pub fn mount_nix_store(nix_tree: OwnedFd, nix_mount_point: &Path, base: &Path) -> Result<()> {
    let nix_lower = base.join("nix-lower");
    fs::create_dir_all(&nix_lower).context("creating nix temp mount")?;
    trace!(dest = %nix_lower.display(), "attaching toolbox tree");
    newmount::move_mount(nix_tree, &nix_lower)
        .map_err(|e| DebugError::from_newmount_errno("move_mount nix to temp".into(), e))?;

    let upper = base.join("nix-upper");
    let work = base.join("nix-work");
    for dir in [&upper, &work] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    mount_overlay(nix_mount_point, &nix_lower, &upper, &work)
}

/// Live variant: bind /proc, /sys, /dev recursively. The worker already
/// joined the target's PID namespace, so the bound /proc reflects the
/// target. All best-effort.
pub fn bind_host_mounts(merged: &Path) {
    for mp in ["/proc", "/sys", "/dev"] {
        bind_recursive(merged, mp);
    }
    bind_network_config(merged);
}

/// Snapshot/image variant: /proc is only an empty mountpoint here; the
/// init helper mounts a fresh procfs inside the new PID namespace so the
/// session sees its own processes only.
pub fn bind_snapshot_mounts(merged: &Path) {
    let _ = fs::create_dir_all(under(merged, "/proc"));

    for mp in ["/sys", "/dev"] {
        bind_recursive(merged, mp);
    }
    bind_network_config(merged);
}

fn bind_recursive(merged: &Path, source: &str) {
    if fs::metadata(source).is_err() {
        return;
    }
    let target = under(merged, source);
    if fs::create_dir_all(&target).is_err() {
        return;
    }
    let _ = mount(
        Some(source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    );
}

/// Bind resolv.conf/hosts/hostname from the current namespace view so DNS
/// works inside the session. An empty or missing source is skipped rather
/// than shadowed with an empty file that would break resolution.
fn bind_network_config(merged: &Path) {
    for config in ["/etc/resolv.conf", "/etc/hosts", "/etc/hostname"] {
        let Ok(meta) = fs::metadata(config) else {
            continue;
        };
        if meta.len() == 0 {
            continue;
        }

        let target = under(merged, config);
        if let Some(parent) = target.parent() {
            if fs::create_dir_all(parent).is_err() {
                continue;
            }
        }
        if !target.exists() && File::create(&target).is_err() {
            continue;
        }
        let _ = mount(
            Some(config),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        );
    }
}

/// Create /nix on a live target's real root (seen through the write-through
/// bind), stamping it with an xattr when it is ours to remove later.
pub fn create_live_nix_dir(nix_mount_point: &Path) -> Result<()> {
    match fs::metadata(nix_mount_point) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(nix_mount_point).context("creating /nix")?;
            let _ = xattr::set(nix_mount_point, NIX_DIR_XATTR, b"1");
            Ok(())
        }
        Err(e) => Err(e).context("creating /nix"),
    }
}

/// Writable-mode teardown, after the chroot: detach the toolbox bind and
/// remove the now-empty /nix if the stamp says we created it. Errors are
/// deliberately dropped; the session is already over.
pub fn cleanup_live_nix_dir() {
    let _ = umount2("/nix", MntFlags::MNT_DETACH);
    if let Ok(Some(_)) = xattr::get("/nix", NIX_DIR_XATTR) {
        let _ = fs::remove_dir("/nix");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_options_format() {
        let opts = overlay_options(
            Path::new("/"),
            Path::new("/tmp/s/upper"),
            Path::new("/tmp/s/work"),
        );
        assert_eq!(opts, "lowerdir=/,upperdir=/tmp/s/upper,workdir=/tmp/s/work");
    }

    #[test]
    fn scratch_base_is_per_process() {
        let base = scratch_base();
        let s = base.to_str().unwrap();
        assert!(s.starts_with("/tmp/.podman-debug-overlay."));
        assert!(s
            .rsplit('.')
            .next()
            .unwrap()
            .chars()
            .all(|c| c.is_ascii_digit()));
    }
}
