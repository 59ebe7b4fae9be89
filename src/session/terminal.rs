//! Terminal supervision: raw mode, PTY plumbing, window sizing, and the
//! worker/supervisor handoff.
//!
//! The worker sends the PTY master over a capacity-1 channel strictly after
//! a successful spawn; if it fails earlier it just drops the sender, which
//! unblocks the supervisor straight into the result channel. The output
//! pump finishing (the child closed its slave side) is the shell-exit
//! signal; the input pump is abandoned.

use std::{
    fs::File,
    io::{self, IsTerminal},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, ExitStatus, Stdio},
    sync::mpsc::{Receiver, SyncSender},
    thread,
};

use anyhow::{anyhow, Context, Result};
use libc::{TIOCGWINSZ, TIOCSCTTY, TIOCSWINSZ};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    pty::{openpty, OpenptyResult, Winsize},
    sys::{
        signal::{SigSet, Signal},
        signalfd::{SfdFlags, SignalFd},
        termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios},
    },
    unistd::{pipe, setsid},
};
use tracing::trace;

use super::Streams;
use crate::{err, error::DebugError, set_cloexec};

/// Puts a terminal into raw mode and restores it on drop. Interactive
/// sessions only: raw mode disables output processing, which corrupts the
/// output of plain `-c` commands.
pub struct RawModeGuard {
    fd: OwnedFd,
    saved: Termios,
}

impl RawModeGuard {
    pub fn enable(stdin: &File) -> Option<RawModeGuard> {
        if !stdin.is_terminal() {
            return None;
        }
        let fd = stdin.as_fd().try_clone_to_owned().ok()?;
        let saved = tcgetattr(&fd).ok()?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&fd, SetArg::TCSANOW, &raw).ok()?;
        Some(RawModeGuard { fd, saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved);
    }
}

/// Block SIGWINCH for this thread and everything it spawns, so the
/// supervisor's signalfd owns delivery. Must run before the worker thread
/// exists.
pub fn block_sigwinch() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGWINCH);
    mask.thread_block().context("blocking SIGWINCH")?;
    Ok(())
}

pub fn window_size(fd: BorrowedFd<'_>) -> nix::Result<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { err(libc::ioctl(fd.as_raw_fd(), TIOCGWINSZ as _, &mut ws))? };
    Ok(ws)
}

fn set_window_size(fd: BorrowedFd<'_>, ws: &Winsize) -> nix::Result<()> {
    unsafe { err(libc::ioctl(fd.as_raw_fd(), TIOCSWINSZ as _, ws))? };
    Ok(())
}

fn create_pty(win: Option<&Winsize>) -> nix::Result<OpenptyResult> {
    let pty = openpty(win, None)?;
    set_cloexec(pty.master.as_raw_fd())?;
    Ok(pty)
}

/// Spawn the shell with the PTY slave as its stdio and controlling
/// terminal, in its own session.
fn spawn_in_pty(cmd: &mut Command, pty: &OpenptyResult) -> io::Result<std::process::Child> {
    cmd.stdin(Stdio::from(pty.slave.try_clone()?));
    cmd.stdout(Stdio::from(pty.slave.try_clone()?));
    cmd.stderr(Stdio::from(pty.slave.try_clone()?));
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            // stdin is the pty slave at this point
            if libc::ioctl(0, TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
}

fn exit_code(status: ExitStatus) -> i32 {
    // signal death maps to the shell convention
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Worker side: spawn the shell and reap it. In interactive mode the PTY
/// master goes to the supervisor right after the spawn; in non-interactive
/// mode the sender is dropped and the stream handles are wired directly.
pub fn run_shell(
    mut cmd: Command,
    streams: Streams,
    interactive: bool,
    pty_tx: SyncSender<OwnedFd>,
) -> Result<i32> {
    let interactive = interactive && streams.stdin.is_some();

    let status = if interactive {
        let win = streams
            .stdin
            .as_ref()
            .and_then(|f| window_size(f.as_fd()).ok());
        drop(streams);

        let pty = create_pty(win.as_ref())
            .map_err(|e| DebugError::SpawnFailure(format!("allocating pty: {e}")))?;
        let mut child =
            spawn_in_pty(&mut cmd, &pty).map_err(|e| DebugError::SpawnFailure(e.to_string()))?;
        drop(pty.slave);

        trace!("shell spawned, handing pty to supervisor");
        let _ = pty_tx.send(pty.master);

        child.wait().context("waiting for shell")?
    } else {
        cmd.stdin(streams.stdin.map_or_else(Stdio::inherit, Stdio::from));
        cmd.stdout(streams.stdout.map_or_else(Stdio::inherit, Stdio::from));
        cmd.stderr(streams.stderr.map_or_else(Stdio::inherit, Stdio::from));

        // supervisor unblocks straight into the result channel
        drop(pty_tx);

        let mut child = cmd
            .spawn()
            .map_err(|e| DebugError::SpawnFailure(e.to_string()))?;
        child.wait().context("waiting for shell")?
    };

    Ok(exit_code(status))
}

/// Supervisor side, on the calling thread: wait for either a PTY handle or
/// the final result, pump terminal I/O while the shell lives, then report
/// the worker's result.
pub fn supervise(
    pty_rx: Receiver<OwnedFd>,
    res_rx: Receiver<Result<i32>>,
    stdin: Option<File>,
    stdout: Option<File>,
) -> Result<i32> {
    // a dropped sender means the worker failed before spawning, or went
    // non-interactive; either way the result channel is next
    if let Ok(master) = pty_rx.recv() {
        pump_session(master, stdin, stdout)?;
    }

    match res_rx.recv() {
        Ok(res) => res,
        Err(_) => Err(anyhow!("session worker exited without reporting a result")),
    }
}

fn pump_session(master: OwnedFd, stdin: Option<File>, stdout: Option<File>) -> Result<()> {
    let (done_rd, done_wr) = pipe().context("creating done pipe")?;

    if let Some(stdin) = stdin {
        // window-change watcher, stopped by the done pipe closing
        if let Ok(watch_stdin) = stdin.as_fd().try_clone_to_owned() {
            if let Ok(watch_master) = master.try_clone() {
                let _ = thread::Builder::new()
                    .name("sigwinch".into())
                    .spawn(move || watch_window_size(watch_stdin, watch_master, done_rd));
            }
        }

        // the input pump is abandoned once the shell exits; it dies with
        // the process
        let mut stdin = stdin;
        let mut master_in = File::from(master.try_clone().context("duplicating pty master")?);
        thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || {
                let _ = io::copy(&mut stdin, &mut master_in);
            })
            .context("spawning stdin pump")?;
    }

    // the output pump finishing is the shell-exit signal; EIO here just
    // means the last slave fd closed
    let mut master_out = File::from(master);
    match stdout {
        Some(mut out) => {
            let _ = io::copy(&mut master_out, &mut out);
        }
        None => {
            let _ = io::copy(&mut master_out, &mut io::stdout().lock());
        }
    }

    drop(done_wr);
    Ok(())
}

fn watch_window_size(stdin: OwnedFd, master: OwnedFd, done: OwnedFd) {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGWINCH);
    let Ok(mut sfd) = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
    else {
        return;
    };

    loop {
        let winch;
        {
            let mut fds = [
                PollFd::new(sfd.as_fd(), PollFlags::POLLIN),
                PollFd::new(done.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                Err(_) => return,
                Ok(_) => {}
            }
            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                // session over
                return;
            }
            winch = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
        }
        if !winch {
            continue;
        }

        while let Ok(Some(_)) = sfd.read_signal() {
            if let Ok(ws) = window_size(stdin.as_fd()) {
                let _ = set_window_size(master.as_fd(), &ws);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passes_through() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn exit_code_maps_signal_death() {
        // raw wait status 9 = killed by SIGKILL
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
    }

    #[test]
    fn dropped_pty_sender_falls_through_to_result() {
        use std::sync::mpsc;

        let (pty_tx, pty_rx) = mpsc::sync_channel::<OwnedFd>(1);
        let (res_tx, res_rx) = mpsc::sync_channel::<Result<i32>>(1);

        // worker fails before spawning: result only, sender dropped
        drop(pty_tx);
        res_tx.send(Ok(7)).unwrap();

        let code = supervise(pty_rx, res_rx, None, None).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn missing_result_is_an_error() {
        use std::sync::mpsc;

        let (pty_tx, pty_rx) = mpsc::sync_channel::<OwnedFd>(1);
        let (res_tx, res_rx) = mpsc::sync_channel::<Result<i32>>(1);
        drop(pty_tx);
        drop(res_tx);

        assert!(supervise(pty_rx, res_rx, None, None).is_err());
    }
}
