//! Client for the podman engine. Every operation shells out to the `podman`
//! CLI and parses `--format json` output where structure is needed.

use std::fmt;
use std::process::{Command, Output};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::DebugError;

/// Default nix toolbox image.
pub const DEFAULT_DEBUG_IMAGE: &str = "docker.io/nixos/nix:latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PullPolicy {
    Always,
    Missing,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Paused,
    Stopped,
    Exited,
    Created,
    Configured,
    Other(String),
}

impl ContainerState {
    pub fn parse(status: &str) -> Self {
        match status {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "stopped" => ContainerState::Stopped,
            "exited" => ContainerState::Exited,
            "created" => ContainerState::Created,
            "configured" => ContainerState::Configured,
            other => ContainerState::Other(other.to_string()),
        }
    }

    /// Live targets have a running init whose namespaces can be joined.
    pub fn is_live(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }

    /// Non-live states whose filesystem can still be mounted host-side.
    pub fn has_snapshot(&self) -> bool {
        matches!(
            self,
            ContainerState::Stopped
                | ContainerState::Exited
                | ContainerState::Created
                | ContainerState::Configured
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopped => "stopped",
            ContainerState::Exited => "exited",
            ContainerState::Created => "created",
            ContainerState::Configured => "configured",
            ContainerState::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Subset of container metadata a debug session needs.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub state: ContainerState,
    /// Only valid when running/paused.
    pub pid: i32,
}

/// ENTRYPOINT, CMD, and WorkingDir metadata from a container or image
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntrypointInfo {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

#[derive(Deserialize)]
struct InspectResult {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Pid", default)]
    pid: i32,
}

#[derive(Deserialize)]
struct ConfigResult {
    #[serde(rename = "Config", default)]
    config: InspectConfig,
}

#[derive(Deserialize, Default)]
struct InspectConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: Option<String>,
}

impl From<InspectConfig> for EntrypointInfo {
    fn from(c: InspectConfig) -> Self {
        EntrypointInfo {
            entrypoint: c.entrypoint.unwrap_or_default(),
            cmd: c.cmd.unwrap_or_default(),
            working_dir: c.working_dir.unwrap_or_default(),
        }
    }
}

fn podman(args: &[&str]) -> Result<Output> {
    trace!(?args, "running podman");
    Command::new("podman")
        .args(args)
        .output()
        .context("running podman")
}

fn stderr_text(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

fn looks_not_found(message: &str) -> bool {
    message.contains("no container with name or ID") || message.contains("no such container")
}

/// Whether an error means the reference names no container, so the
/// dispatcher should retry it as an image.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    if matches!(
        err.downcast_ref::<DebugError>(),
        Some(DebugError::TargetNotFound(_))
    ) {
        return true;
    }
    let msg = format!("{err:#}");
    looks_not_found(&msg) || msg.contains("inspecting container")
}

fn parse_single<T: serde::de::DeserializeOwned>(name: &str, stdout: &[u8]) -> Result<T> {
    let mut results: Vec<T> =
        serde_json::from_slice(stdout).context("parsing inspect output")?;
    if results.is_empty() {
        bail!("no inspect data for {}", name);
    }
    Ok(results.remove(0))
}

/// Resolve a container reference into its ID, state, and PID. `container
/// inspect` (not bare `inspect`) keeps image references from matching here,
/// so they fall through to image mode.
pub fn inspect_container(name: &str) -> Result<ContainerInfo> {
    let out = podman(&["container", "inspect", "--format", "json", name])?;
    if !out.status.success() {
        let stderr = stderr_text(&out);
        if looks_not_found(&stderr) {
            return Err(DebugError::TargetNotFound(name.to_string()).into());
        }
        bail!("inspecting container {}: {}", name, stderr);
    }

    let result: InspectResult = parse_single(name, &out.stdout)?;
    Ok(ContainerInfo {
        id: result.id,
        state: ContainerState::parse(&result.state.status),
        pid: result.state.pid,
    })
}

pub fn inspect_container_entrypoint(name: &str) -> Result<EntrypointInfo> {
    let out = podman(&["container", "inspect", "--format", "json", name])?;
    if !out.status.success() {
        bail!("inspecting container {}: {}", name, stderr_text(&out));
    }
    let result: ConfigResult = parse_single(name, &out.stdout)?;
    Ok(result.config.into())
}

pub fn inspect_image_entrypoint(image: &str) -> Result<EntrypointInfo> {
    let out = podman(&["image", "inspect", "--format", "json", image])?;
    if !out.status.success() {
        bail!("inspecting image {}: {}", image, stderr_text(&out));
    }
    let result: ConfigResult = parse_single(image, &out.stdout)?;
    Ok(result.config.into())
}

/// Mount a container's root filesystem and return the host-side path.
pub fn mount_container(name: &str) -> Result<String> {
    let out = podman(&["mount", name])?;
    if !out.status.success() {
        return Err(DebugError::TargetUnmountable(format!(
            "mounting container {}: {}",
            name,
            stderr_text(&out)
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub fn unmount_container(name: &str) -> Result<()> {
    podman(&["unmount", name]).map(|_| ())
}

/// Mount an image's root filesystem and return the host-side path.
pub fn mount_image(image: &str) -> Result<String> {
    let out = podman(&["image", "mount", image])?;
    if !out.status.success() {
        return Err(DebugError::TargetUnmountable(format!(
            "mounting image {}: {}",
            image,
            stderr_text(&out)
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub fn unmount_image(image: &str) -> Result<()> {
    podman(&["image", "unmount", image]).map(|_| ())
}

fn image_exists(image: &str) -> Result<bool> {
    Ok(podman(&["image", "exists", image])?.status.success())
}

pub fn pull_image(image: &str, policy: PullPolicy) -> Result<()> {
    match policy {
        PullPolicy::Always => pull(image),
        PullPolicy::Never => {
            if !image_exists(image)? {
                return Err(anyhow!(
                    "image {} not found and pull policy is 'never'",
                    image
                ));
            }
            Ok(())
        }
        PullPolicy::Missing => {
            if !image_exists(image)? {
                return pull(image);
            }
            Ok(())
        }
    }
}

fn pull(image: &str) -> Result<()> {
    let out = podman(&["pull", image])?;
    if !out.status.success() {
        bail!("pulling image {}: {}", image, stderr_text(&out));
    }
    Ok(())
}

/// `/proc/<pid>/ns/<kind>` for the given PID.
pub fn namespace_path(pid: i32, kind: &str) -> String {
    format!("/proc/{}/ns/{}", pid, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT_JSON: &str = r#"[
      {
        "Id": "9f0c5af1ab1c",
        "State": { "Status": "running", "Pid": 4242 },
        "Config": {
          "Entrypoint": ["/docker-entrypoint.sh"],
          "Cmd": ["nginx", "-g", "daemon off;"],
          "WorkingDir": "/srv"
        }
      }
    ]"#;

    #[test]
    fn parses_inspect_state() {
        let result: InspectResult = parse_single("x", INSPECT_JSON.as_bytes()).unwrap();
        assert_eq!(result.id, "9f0c5af1ab1c");
        assert_eq!(result.state.status, "running");
        assert_eq!(result.state.pid, 4242);
    }

    #[test]
    fn parses_entrypoint_config() {
        let result: ConfigResult = parse_single("x", INSPECT_JSON.as_bytes()).unwrap();
        let ep: EntrypointInfo = result.config.into();
        assert_eq!(ep.entrypoint, vec!["/docker-entrypoint.sh"]);
        assert_eq!(ep.cmd, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(ep.working_dir, "/srv");
    }

    #[test]
    fn null_entrypoint_becomes_empty() {
        let json = r#"[{"Config": {"Entrypoint": null, "Cmd": null}}]"#;
        let result: ConfigResult = parse_single("x", json.as_bytes()).unwrap();
        let ep: EntrypointInfo = result.config.into();
        assert!(ep.entrypoint.is_empty());
        assert!(ep.cmd.is_empty());
        assert!(ep.working_dir.is_empty());
    }

    #[test]
    fn empty_inspect_array_is_an_error() {
        assert!(parse_single::<InspectResult>("x", b"[]").is_err());
    }

    #[test]
    fn state_policy() {
        assert!(ContainerState::parse("running").is_live());
        assert!(ContainerState::parse("paused").is_live());
        for s in ["stopped", "exited", "created", "configured"] {
            let state = ContainerState::parse(s);
            assert!(state.has_snapshot(), "{s} should be snapshot");
            assert!(!state.is_live());
        }
        let odd = ContainerState::parse("removing");
        assert!(!odd.is_live() && !odd.has_snapshot());
        assert_eq!(odd.to_string(), "removing");
    }

    #[test]
    fn not_found_detection() {
        let err = anyhow::Error::from(DebugError::TargetNotFound("web".into()));
        assert!(is_not_found(&err));

        let err = anyhow!("no such container \"web\"");
        assert!(is_not_found(&err));

        let err = anyhow!("inspecting container web: connection refused");
        assert!(is_not_found(&err));

        let err = anyhow!("mounting container web: permission denied");
        assert!(!is_not_found(&err));
    }

    #[test]
    fn namespace_path_format() {
        assert_eq!(namespace_path(4242, "mnt"), "/proc/4242/ns/mnt");
        assert_eq!(namespace_path(1, "uts"), "/proc/1/ns/uts");
    }
}
