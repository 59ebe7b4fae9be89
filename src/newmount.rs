//! Wrappers for the new mount API (Linux 5.2+).
//!
//! A detached tree from `open_tree(OPEN_TREE_CLONE)` is the only way to carry
//! the toolbox mount across the session's later mount-namespace switches:
//! bind mounts taken before `unshare(CLONE_NEWNS)` do not survive it, and
//! after joining the target's namespace the source path is gone.

use std::{
    ffi::CString,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use libc::{syscall, SYS_move_mount, SYS_open_tree, AT_FDCWD};
use nix::errno::Errno;

use crate::err;

// musl is missing this
const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x00000004;

fn cstring_path(path: &Path) -> nix::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Clone `path` (recursively) into a detached mount tree descriptor.
pub fn open_tree(path: &Path, flags: u32) -> nix::Result<OwnedFd> {
    let path = cstring_path(path)?;
    let fd = unsafe { err(syscall(SYS_open_tree, AT_FDCWD, path.as_ptr(), flags))? };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// Attach a detached mount tree at `dest`, consuming the descriptor.
pub fn move_mount(tree: OwnedFd, dest: &Path) -> nix::Result<()> {
    let dest = cstring_path(dest)?;
    unsafe {
        err(syscall(
            SYS_move_mount,
            tree.as_raw_fd(),
            c"".as_ptr(),
            AT_FDCWD,
            dest.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        ))?
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_with_nul() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let bad = Path::new(OsStr::from_bytes(b"/tmp/\0oops"));
        assert_eq!(cstring_path(bad), Err(Errno::EINVAL));
    }
}
