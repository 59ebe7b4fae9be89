//! Helper scripts and entrypoint metadata injected into the merged view.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use tracing::trace;

use super::under;
use crate::podman::EntrypointInfo;

pub const BUILTINS_DIR: &str = "/.podman-debug/bin";
pub const METADATA_DIR: &str = "/.podman-debug";

/// Where the running executable lands inside the overlay, for use as the
/// PID 1 `--init-proc` helper in snapshot/image sessions.
pub const INIT_BINARY_PATH: &str = "/.podman-debug/bin/init";

/// Inject helper scripts, the init binary, and entrypoint metadata. All of
/// this is best-effort: a session without builtins is degraded, not dead.
pub fn write_builtins(merged: &Path, ep: Option<&EntrypointInfo>) {
    let bin_dir = under(merged, BUILTINS_DIR);
    if fs::create_dir_all(&bin_dir).is_err() {
        return;
    }

    write_script(&bin_dir, "install", INSTALL_SCRIPT);
    write_script(&bin_dir, "uninstall", UNINSTALL_SCRIPT);
    write_script(&bin_dir, "builtins", BUILTINS_SCRIPT);
    write_script(&bin_dir, "entrypoint", ENTRYPOINT_SCRIPT);

    copy_self(&bin_dir, "init");

    if let Some(ep) = ep {
        write_entrypoint_metadata(merged, ep);
    }
}

fn write_script(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if fs::write(&path, content).is_ok() {
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o755));
    }
}

fn copy_self(dir: &Path, name: &str) {
    let Ok(self_path) = std::env::current_exe() else {
        return;
    };
    let dst = dir.join(name);
    trace!(dst = %dst.display(), "copying own binary into overlay");
    if fs::copy(&self_path, &dst).is_err() {
        return;
    }
    let _ = fs::set_permissions(&dst, fs::Permissions::from_mode(0o755));
}

fn write_entrypoint_metadata(merged: &Path, ep: &EntrypointInfo) {
    let meta_dir = under(merged, METADATA_DIR);
    let _ = fs::create_dir_all(&meta_dir);

    if let Ok(data) = serde_json::to_string_pretty(ep) {
        let _ = fs::write(meta_dir.join("entrypoint.json"), data);
    }

    // One plain file per field, space-joined, so the entrypoint script can
    // read them with cat (no jq or python in the target).
    if !ep.entrypoint.is_empty() {
        let _ = fs::write(meta_dir.join("ep_bin"), ep.entrypoint.join(" "));
    }
    if !ep.cmd.is_empty() {
        let _ = fs::write(meta_dir.join("ep_cmd"), ep.cmd.join(" "));
    }
    if !ep.working_dir.is_empty() {
        let _ = fs::write(meta_dir.join("ep_workdir"), &ep.working_dir);
    }
    let effective = effective_command(ep);
    if !effective.is_empty() {
        let _ = fs::write(meta_dir.join("ep_effective"), effective.join(" "));
    }

    let _ = fs::write(meta_dir.join("entrypoint.txt"), entrypoint_summary(ep));
}

fn effective_command(ep: &EntrypointInfo) -> Vec<String> {
    ep.entrypoint.iter().chain(ep.cmd.iter()).cloned().collect()
}

fn entrypoint_summary(ep: &EntrypointInfo) -> String {
    let mut summary = String::new();

    if !ep.entrypoint.is_empty() {
        summary.push_str(&format!("ENTRYPOINT {}\n", format_args_list(&ep.entrypoint)));
    } else {
        summary.push_str("ENTRYPOINT (not set)\n");
    }

    if !ep.cmd.is_empty() {
        summary.push_str(&format!("CMD {}\n", format_args_list(&ep.cmd)));
    } else {
        summary.push_str("CMD (not set)\n");
    }

    if !ep.working_dir.is_empty() {
        summary.push_str(&format!("WORKDIR {}\n", ep.working_dir));
    }

    let effective = effective_command(ep);
    if !effective.is_empty() {
        summary.push_str(&format!("\nEffective command:\n  {}\n", effective.join(" ")));
    } else {
        summary.push_str("\nEffective command: (none)\n");
    }

    summary
}

fn format_args_list(args: &[String]) -> String {
    let quoted: Vec<String> = args
        .iter()
        .map(|a| {
            if a.chars().any(|c| " \t\"'\\".contains(c)) {
                format!("{:?}", a)
            } else {
                a.clone()
            }
        })
        .collect();
    format!("[{}]", quoted.join(", "))
}

const INSTALL_SCRIPT: &str = r#"#!/nix/var/nix/profiles/default/bin/sh
set -e

if [ $# -eq 0 ]; then
    echo "Usage: install <package> [package...]"
    echo ""
    echo "Install packages from nixpkgs into the debug session."
    echo "Browse available packages at: https://search.nixos.org/packages"
    echo ""
    echo "Examples:"
    echo "  install curl"
    echo "  install nmap strace tcpdump"
    echo ""
    echo "Note: installed packages only persist for this debug session."
    exit 1
fi

for pkg in "$@"; do
    echo "Installing $pkg..."
    nix-env -iA "nixpkgs.$pkg"
done
"#;

const UNINSTALL_SCRIPT: &str = r#"#!/nix/var/nix/profiles/default/bin/sh
set -e

if [ $# -eq 0 ]; then
    echo "Usage: uninstall <package> [package...]"
    echo ""
    echo "Uninstall packages from the debug session."
    echo ""
    echo "Examples:"
    echo "  uninstall curl"
    echo "  uninstall nmap strace tcpdump"
    exit 1
fi

for pkg in "$@"; do
    echo "Uninstalling $pkg..."
    nix-env -e "$pkg"
done
"#;

const BUILTINS_SCRIPT: &str = r#"#!/nix/var/nix/profiles/default/bin/sh
echo "podman-debug builtin commands:"
echo ""
echo "  install <pkg> [pkg...]   Install nix packages (https://search.nixos.org/packages)"
echo "  uninstall <pkg> [pkg...] Uninstall nix packages"
echo "  entrypoint               Show, lint, or run the container/image entrypoint"
echo "  builtins                 Show this help"
"#;

const ENTRYPOINT_SCRIPT: &str = r#"#!/nix/var/nix/profiles/default/bin/sh
META_DIR="/.podman-debug"
EP_JSON="$META_DIR/entrypoint.json"
EP_TEXT="$META_DIR/entrypoint.txt"

usage() {
    echo "Usage: entrypoint [--print|--lint|--run|--json]"
    echo ""
    echo "Inspect the ENTRYPOINT and CMD of the container or image."
    echo ""
    echo "Options:"
    echo "  (no args)   Show entrypoint details and lint results"
    echo "  --print     Print only the effective command"
    echo "  --lint      Lint the entrypoint configuration"
    echo "  --run       Execute the entrypoint"
    echo "  --json      Print raw JSON metadata"
}

if [ ! -f "$EP_JSON" ]; then
    echo "Error: no entrypoint metadata found."
    echo "This can happen if the container or image has no entrypoint configured."
    exit 1
fi

# Read pre-rendered plain-text files written by podman-debug (no JSON parsing needed).
ENTRYPOINT=""
CMD=""
WORKDIR=""
EFFECTIVE=""
[ -f "$META_DIR/ep_bin" ] && ENTRYPOINT=$(cat "$META_DIR/ep_bin")
[ -f "$META_DIR/ep_cmd" ] && CMD=$(cat "$META_DIR/ep_cmd")
[ -f "$META_DIR/ep_workdir" ] && WORKDIR=$(cat "$META_DIR/ep_workdir")
[ -f "$META_DIR/ep_effective" ] && EFFECTIVE=$(cat "$META_DIR/ep_effective")

do_lint() {
    echo "Lint results:"
    PASS=true

    if [ -n "$ENTRYPOINT" ]; then
        EP_BIN="${ENTRYPOINT%% *}"
        if [ -x "$EP_BIN" ] || command -v "$EP_BIN" >/dev/null 2>&1; then
            echo "  PASS: '$EP_BIN' found"
        else
            echo "  WARN: '$EP_BIN' not found in PATH or filesystem"
            PASS=false
        fi
    else
        echo "  INFO: no ENTRYPOINT set (using CMD only)"
    fi

    if [ -z "$ENTRYPOINT" ] && [ -z "$CMD" ]; then
        echo "  WARN: neither ENTRYPOINT nor CMD is set"
        PASS=false
    fi

    if [ "$PASS" = true ]; then
        echo ""
        echo "No issues found."
    fi
}

case "${1:-}" in
    --print)
        if [ -z "$EFFECTIVE" ]; then
            echo "(no entrypoint or cmd configured)"
            exit 1
        fi
        echo "$EFFECTIVE"
        ;;
    --json)
        cat "$EP_JSON"
        ;;
    --run)
        if [ -z "$EFFECTIVE" ]; then
            echo "Error: no entrypoint or cmd to run."
            exit 1
        fi
        echo "Running: $EFFECTIVE"
        echo "---"
        if [ -n "$WORKDIR" ] && [ -d "$WORKDIR" ]; then
            cd "$WORKDIR"
        fi
        exec $EFFECTIVE
        ;;
    --lint)
        do_lint
        ;;
    --help|-h)
        usage
        ;;
    "")
        # Default: show details + lint.
        echo "Entrypoint and CMD configuration:"
        echo ""
        if [ -f "$EP_TEXT" ]; then
            cat "$EP_TEXT"
        fi
        echo ""
        do_lint
        ;;
    *)
        echo "Error: unknown option '$1'"
        echo ""
        usage
        exit 1
        ;;
esac
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entrypoint() -> EntrypointInfo {
        EntrypointInfo {
            entrypoint: vec!["/docker-entrypoint.sh".into()],
            cmd: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
            working_dir: "/srv".into(),
        }
    }

    #[test]
    fn builtins_land_on_path_with_exec_bits() {
        let merged = tempfile::tempdir().unwrap();
        write_builtins(merged.path(), Some(&sample_entrypoint()));

        let bin_dir = merged.path().join(".podman-debug/bin");
        for name in ["install", "uninstall", "builtins", "entrypoint", "init"] {
            let meta = fs::metadata(bin_dir.join(name)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o755, "{name}");
        }
    }

    #[test]
    fn metadata_files_are_cat_friendly() {
        let merged = tempfile::tempdir().unwrap();
        write_builtins(merged.path(), Some(&sample_entrypoint()));

        let meta_dir = merged.path().join(".podman-debug");
        assert_eq!(
            fs::read_to_string(meta_dir.join("ep_bin")).unwrap(),
            "/docker-entrypoint.sh"
        );
        assert_eq!(
            fs::read_to_string(meta_dir.join("ep_cmd")).unwrap(),
            "nginx -g daemon off;"
        );
        assert_eq!(
            fs::read_to_string(meta_dir.join("ep_workdir")).unwrap(),
            "/srv"
        );
        assert_eq!(
            fs::read_to_string(meta_dir.join("ep_effective")).unwrap(),
            "/docker-entrypoint.sh nginx -g daemon off;"
        );

        let json = fs::read_to_string(meta_dir.join("entrypoint.json")).unwrap();
        let parsed: EntrypointInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.working_dir, "/srv");
    }

    #[test]
    fn no_metadata_without_entrypoint() {
        let merged = tempfile::tempdir().unwrap();
        write_builtins(merged.path(), None);

        assert!(merged.path().join(".podman-debug/bin/install").exists());
        assert!(!merged.path().join(".podman-debug/entrypoint.json").exists());
    }

    #[test]
    fn summary_quotes_awkward_args() {
        let ep = sample_entrypoint();
        let summary = entrypoint_summary(&ep);
        assert!(summary.contains("ENTRYPOINT [/docker-entrypoint.sh]"));
        assert!(summary.contains(r#"CMD [nginx, -g, "daemon off;"]"#));
        assert!(summary.contains("WORKDIR /srv"));
        assert!(summary.contains("Effective command:\n  /docker-entrypoint.sh nginx -g daemon off;"));
    }

    #[test]
    fn summary_marks_unset_fields() {
        let summary = entrypoint_summary(&EntrypointInfo::default());
        assert!(summary.contains("ENTRYPOINT (not set)"));
        assert!(summary.contains("CMD (not set)"));
        assert!(!summary.contains("WORKDIR"));
        assert!(summary.contains("Effective command: (none)"));
    }

    #[test]
    fn format_args_list_quoting() {
        let args = vec!["plain".to_string(), "has space".to_string(), "q'uote".to_string()];
        assert_eq!(
            format_args_list(&args),
            r#"[plain, "has space", "q'uote"]"#
        );
    }
}
