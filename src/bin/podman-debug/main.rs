use std::{
    env,
    fs::File,
    io,
    os::fd::AsFd,
    path::{Path, PathBuf},
    process,
};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use nix::unistd::Uid;
use podman_debug::{
    error::DebugError,
    podman::{self, ContainerState, PullPolicy},
    session::{self, Options, RawModeGuard, Streams, Target},
};

mod reexec;

/// Get a debug shell into any container or image, even if it has no shell.
///
/// Uses a toolbox image with Nix to provide debugging tools without
/// modifying the target. The /nix directory is never visible to the actual
/// container or image. By default, all filesystem changes are discarded
/// when leaving the shell; use --writable to make changes visible to a
/// running or paused container.
#[derive(Parser)]
#[command(
    name = "podman-debug",
    version,
    about = "Get a shell into any container or image",
    after_help = "Examples:
  podman-debug my-container
  podman-debug --writable my-container
  podman-debug --shell sh my-container
  podman-debug -c \"cat /etc/os-release\" my-container
  podman-debug --image my-toolbox:v1 my-container
  podman-debug nginx:latest
  podman-debug my-stopped-container"
)]
struct Cli {
    /// Shell to use: bash, sh, auto
    #[arg(long, default_value = "auto")]
    shell: String,

    /// Execute a command instead of an interactive shell
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Debug toolbox image
    #[arg(long, default_value = podman::DEFAULT_DEBUG_IMAGE)]
    image: String,

    /// Pull policy for the toolbox image
    #[arg(long, value_enum, default_value_t = PullPolicy::Missing)]
    pull: PullPolicy,

    /// Keep STDIN open
    #[arg(
        short = 'i',
        long,
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    interactive: bool,

    /// Allocate a pseudo-TTY
    #[arg(
        short = 't',
        long,
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    tty: bool,

    /// Make filesystem changes visible to the container
    #[arg(short = 'w', long)]
    writable: bool,

    /// Container or image reference
    target: String,

    /// Command and arguments to run instead of the shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command_args: Vec<String>,
}

fn main() {
    // Init-proc mode: running as PID 1 inside a fresh PID namespace, before
    // any flag parsing. Mount /proc and exec the shell.
    let raw_args: Vec<String> = env::args().collect();
    if raw_args.len() >= 3 && raw_args[1] == "--init-proc" {
        reexec::init_proc(&raw_args[2], &raw_args[3..]);
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // Rootless: re-exec under podman's user namespace helper so that image
    // mounts work and we hold CAP_SYS_ADMIN for overlays and setns.
    if !Uid::effective().is_root() && env::var_os(reexec::UNSHARED_ENV).is_none() {
        reexec::via_podman_unshare();
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(125);
        }
    }
}

/// Positional arguments after the target are a command, joined by spaces;
/// a leading "-c" is tolerated for podman-exec muscle memory.
fn join_command_args(args: &[String]) -> String {
    let args = match args {
        [first, rest @ ..] if first == "-c" && !rest.is_empty() => rest,
        args => args,
    };
    args.join(" ")
}

fn run(cli: Cli) -> Result<i32> {
    let mut command = cli.command.clone();
    if command.is_none() && !cli.command_args.is_empty() {
        command = Some(join_command_args(&cli.command_args));
    }

    // Pull and mount the toolbox image; its /nix subtree is the tool source.
    podman::pull_image(&cli.image, cli.pull).context("pulling debug image")?;
    let toolbox_root = podman::mount_image(&cli.image).context("mounting debug image")?;
    let _toolbox_guard = ImageMountGuard(cli.image.clone());

    let nix_path = Path::new(&toolbox_root).join("nix");
    if !nix_path.exists() {
        bail!(
            "nix store not found in debug image at {}",
            nix_path.display()
        );
    }

    let shell = session::detect_shell(&cli.shell);
    let shell_args: Vec<String> = match &command {
        Some(c) => vec!["-c".to_string(), c.clone()],
        None => Vec::new(),
    };
    let raw_wanted = cli.tty && cli.interactive && command.is_none();

    // Try the reference as a container first; not-found falls through to
    // image mode.
    match try_container(&cli, &nix_path, &shell, &shell_args, raw_wanted) {
        Ok(code) => Ok(code),
        Err(e) if podman::is_not_found(&e) => {
            try_image(&cli, &nix_path, &shell, &shell_args, raw_wanted)
                .with_context(|| format!("no container or image found for {:?}", cli.target))
        }
        Err(e) => Err(e),
    }
}

fn try_container(
    cli: &Cli,
    nix_path: &Path,
    shell: &Path,
    shell_args: &[String],
    raw_wanted: bool,
) -> Result<i32> {
    let ctr = podman::inspect_container(&cli.target)?;

    // best-effort; a session without entrypoint metadata still works
    let entrypoint = podman::inspect_container_entrypoint(&cli.target).ok();

    let streams = resolve_streams(cli.interactive)?;
    let _raw = raw_mode(raw_wanted, &streams);

    if ctr.state.is_live() {
        if ctr.state == ContainerState::Paused {
            eprintln!(
                "Note: Container is paused. Processes are frozen but filesystem is accessible."
            );
        }
        session::exec(
            Target::Live { pid: ctr.pid },
            nix_path,
            shell,
            shell_args,
            streams,
            Options {
                writable: cli.writable,
                entrypoint,
            },
        )
    } else if ctr.state.has_snapshot() {
        eprintln!("Note: Container is not running. Changes will be discarded on exit.");
        let mountpoint = podman::mount_container(&cli.target)?;
        let _mount_guard = ContainerMountGuard(cli.target.clone());
        session::exec(
            Target::Snapshot {
                host_root: PathBuf::from(mountpoint),
            },
            nix_path,
            shell,
            shell_args,
            streams,
            Options {
                writable: false,
                entrypoint,
            },
        )
    } else {
        Err(DebugError::UnsupportedState {
            name: cli.target.clone(),
            state: ctr.state.to_string(),
        }
        .into())
    }
}

fn try_image(
    cli: &Cli,
    nix_path: &Path,
    shell: &Path,
    shell_args: &[String],
    raw_wanted: bool,
) -> Result<i32> {
    eprintln!("Note: Debugging an image. Changes will be discarded on exit.");

    podman::pull_image(&cli.target, PullPolicy::Missing)
        .with_context(|| format!("pulling image {}", cli.target))?;

    let entrypoint = podman::inspect_image_entrypoint(&cli.target).ok();

    let mountpoint = podman::mount_image(&cli.target)
        .with_context(|| format!("mounting image {}", cli.target))?;
    let _mount_guard = ImageMountGuard(cli.target.clone());

    let streams = resolve_streams(cli.interactive)?;
    let _raw = raw_mode(raw_wanted, &streams);

    session::exec(
        Target::Image {
            host_root: PathBuf::from(mountpoint),
        },
        nix_path,
        shell,
        shell_args,
        streams,
        Options {
            writable: false,
            entrypoint,
        },
    )
}

fn raw_mode(wanted: bool, streams: &Streams) -> Option<RawModeGuard> {
    if !wanted {
        return None;
    }
    streams.stdin.as_ref().and_then(RawModeGuard::enable)
}

fn resolve_streams(interactive: bool) -> Result<Streams> {
    let dup = |fd: &dyn AsFd| -> Result<File> {
        Ok(File::from(
            fd.as_fd()
                .try_clone_to_owned()
                .context("duplicating stdio")?,
        ))
    };

    Ok(Streams {
        stdin: if interactive {
            Some(dup(&io::stdin())?)
        } else {
            None
        },
        stdout: Some(dup(&io::stdout())?),
        stderr: Some(dup(&io::stderr())?),
    })
}

struct ImageMountGuard(String);

impl Drop for ImageMountGuard {
    fn drop(&mut self) {
        let _ = podman::unmount_image(&self.0);
    }
}

struct ContainerMountGuard(String);

impl Drop for ContainerMountGuard {
    fn drop(&mut self) {
        let _ = podman::unmount_container(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn positional_command_joins_with_spaces() {
        assert_eq!(join_command_args(&strings(&["uname", "-r"])), "uname -r");
    }

    #[test]
    fn leading_dash_c_is_stripped() {
        assert_eq!(
            join_command_args(&strings(&["-c", "cat /etc/os-release"])),
            "cat /etc/os-release"
        );
        // a bare -c with nothing after it is left alone
        assert_eq!(join_command_args(&strings(&["-c"])), "-c");
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["podman-debug", "web"]).unwrap();
        assert_eq!(cli.shell, "auto");
        assert_eq!(cli.image, podman::DEFAULT_DEBUG_IMAGE);
        assert_eq!(cli.pull, PullPolicy::Missing);
        assert!(cli.interactive);
        assert!(cli.tty);
        assert!(!cli.writable);
        assert_eq!(cli.target, "web");
        assert!(cli.command_args.is_empty());
    }

    #[test]
    fn cli_command_mode() {
        let cli =
            Cli::try_parse_from(["podman-debug", "-c", "uname -r", "web"]).unwrap();
        assert_eq!(cli.command.as_deref(), Some("uname -r"));
        assert_eq!(cli.target, "web");
    }

    #[test]
    fn cli_trailing_command() {
        let cli = Cli::try_parse_from(["podman-debug", "web", "uname", "-r"]).unwrap();
        assert_eq!(cli.target, "web");
        assert_eq!(cli.command_args, strings(&["uname", "-r"]));
    }

    #[test]
    fn cli_boolean_overrides() {
        let cli = Cli::try_parse_from([
            "podman-debug",
            "--interactive=false",
            "--tty=false",
            "-w",
            "web",
        ])
        .unwrap();
        assert!(!cli.interactive);
        assert!(!cli.tty);
        assert!(cli.writable);
    }
}
