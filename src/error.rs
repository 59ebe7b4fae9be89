use nix::errno::Errno;
use thiserror::Error;

/// Failure kinds that change dispatcher or user-facing behavior. Everything
/// else travels as plain `anyhow` context on the way to the 125 exit.
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("no container with name or ID {0} found")]
    TargetNotFound(String),

    #[error("container {name} is in unsupported state: {state}")]
    UnsupportedState { name: String, state: String },

    #[error("{op}: {errno} (the new mount API requires Linux 5.2 or newer)")]
    KernelUnsupported { op: String, errno: Errno },

    #[error("{0}: operation not permitted (need CAP_SYS_ADMIN in the current user namespace)")]
    CapabilityDenied(String),

    #[error("overlay mount on {lower}: {errno} (this filesystem cannot back an overlay lower layer)")]
    OverlayUnsupported { lower: String, errno: Errno },

    #[error("spawning debug shell: {0}")]
    SpawnFailure(String),

    #[error("{0}")]
    TargetUnmountable(String),
}

impl DebugError {
    /// Classify an errno from one of the privileged mount/namespace calls.
    /// EPERM in rootless flows means the re-exec layer failed to provide a
    /// user namespace.
    pub fn from_mount_errno(op: &str, errno: Errno) -> anyhow::Error {
        match errno {
            Errno::EPERM => DebugError::CapabilityDenied(op.to_string()).into(),
            e => anyhow::Error::new(e).context(op.to_string()),
        }
    }

    /// Classify an errno from `open_tree`/`move_mount`, which old kernels
    /// report as ENOSYS (no syscall) or EINVAL (unknown flags).
    pub fn from_newmount_errno(op: String, errno: Errno) -> anyhow::Error {
        match errno {
            Errno::ENOSYS | Errno::EINVAL => DebugError::KernelUnsupported { op, errno }.into(),
            Errno::EPERM => DebugError::CapabilityDenied(op).into(),
            e => anyhow::Error::new(e).context(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_unsupported_names_minimum_kernel() {
        let err = DebugError::KernelUnsupported {
            op: "open_tree(/mnt/toolbox/nix)".to_string(),
            errno: Errno::ENOSYS,
        };
        assert!(err.to_string().contains("Linux 5.2"));
    }

    #[test]
    fn newmount_errno_classification() {
        let err = DebugError::from_newmount_errno("open_tree(/nix)".into(), Errno::EINVAL);
        assert!(matches!(
            err.downcast_ref::<DebugError>(),
            Some(DebugError::KernelUnsupported { .. })
        ));

        let err = DebugError::from_newmount_errno("open_tree(/nix)".into(), Errno::EPERM);
        assert!(matches!(
            err.downcast_ref::<DebugError>(),
            Some(DebugError::CapabilityDenied(_))
        ));

        let err = DebugError::from_newmount_errno("open_tree(/nix)".into(), Errno::ENOENT);
        assert!(err.downcast_ref::<DebugError>().is_none());
    }

    #[test]
    fn mount_errno_classification() {
        let err = DebugError::from_mount_errno("mounting scratch tmpfs", Errno::EPERM);
        assert!(matches!(
            err.downcast_ref::<DebugError>(),
            Some(DebugError::CapabilityDenied(_))
        ));
    }
}
