//! Single-user nix configuration and the shell's environment.

use std::{env, fs, path::Path};

use super::{payload::BUILTINS_DIR, under, NIX_PROFILE_BIN};

/// Single-user mode: no daemon, no build users, the default binary cache
/// trusted, flakes on for ad-hoc `nix run`.
const NIX_CONFIG: &str = "# Podman debug single-user mode config
build-users-group =
sandbox = false
trusted-public-keys = cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=
experimental-features = nix-command flakes
";

const NIX_CA_BUNDLE: &str = "/nix/var/nix/profiles/default/etc/ssl/certs/ca-bundle.crt";

pub fn write_nix_config(merged: &Path) {
    let config_dir = under(merged, "/etc/nix");
    if fs::create_dir_all(&config_dir).is_ok() {
        let _ = fs::write(config_dir.join("nix.conf"), NIX_CONFIG);
    }
}

/// Builtins first, then the nix profiles, then the container's usual PATH.
fn shell_path() -> String {
    format!(
        "{}:/root/.nix-profile/bin:{}:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        BUILTINS_DIR, NIX_PROFILE_BIN
    )
}

fn env_unset_or_empty(key: &str) -> bool {
    env::var_os(key).map_or(true, |v| v.is_empty())
}

/// Configure the environment the shell will inherit. Runs after the chroot,
/// so file checks see the merged view.
pub fn setup(shell: &Path) {
    env::set_var("HOME", "/root");
    env::set_var("PATH", shell_path());

    if env_unset_or_empty("TERM") {
        env::set_var("TERM", "xterm-256color");
    }

    // NIX_SSL_CERT_FILE rather than SSL_CERT_FILE: the toolbox tools need a
    // CA bundle, but the container's own tools keep their own configuration.
    if env_unset_or_empty("NIX_SSL_CERT_FILE") && Path::new(NIX_CA_BUNDLE).exists() {
        env::set_var("NIX_SSL_CERT_FILE", NIX_CA_BUNDLE);
    }

    env::set_var("SHELL", shell);
    env::set_var("PS1", "debug> ");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_starts_with_builtins_then_profiles() {
        let path = shell_path();
        assert!(path.starts_with("/.podman-debug/bin:/root/.nix-profile/bin:/nix/var/nix/profiles/default/bin:"));
        assert!(path.ends_with("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"));
    }

    #[test]
    fn nix_config_is_single_user() {
        assert!(NIX_CONFIG.contains("sandbox = false"));
        assert!(NIX_CONFIG.contains("build-users-group =\n"));
        assert!(NIX_CONFIG.contains("trusted-public-keys = cache.nixos.org-1:"));
        assert!(NIX_CONFIG.contains("experimental-features = nix-command flakes"));
    }

    #[test]
    fn nix_config_lands_under_etc() {
        let merged = tempfile::tempdir().unwrap();
        write_nix_config(merged.path());
        let written = fs::read_to_string(merged.path().join("etc/nix/nix.conf")).unwrap();
        assert_eq!(written, NIX_CONFIG);
    }
}
