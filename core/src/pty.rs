//! Portable PTY: spawn a login shell and bridge its bytes to the async side.
//! The child is wrapped in a Mutex so a watcher thread can poll try_wait()
//! and report exit exactly once, and so kill can escalate from SIGHUP to a
//! hard kill if the shell ignores the hangup.

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Grace period between SIGHUP and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How often the watcher polls the child for exit.
const EXIT_POLL: Duration = Duration::from_millis(200);

/// Exit report, delivered exactly once when the child terminates.
/// `signal` is the terminating signal name, if any.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub exit_code: u32,
    pub signal: Option<String>,
}

/// Shell command: login shell on Unix, cmd on Windows.
/// Injects TERM and COLORTERM so the session is seen as a modern truecolor
/// terminal, plus UTF-8 LANG/LC_ALL defaults when the host has none set.
#[cfg(unix)]
fn shell_command() -> CommandBuilder {
    let shell = crate::config::ensure_loaded()
        .shell
        .clone()
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "/bin/bash".to_string());
    let mut c = CommandBuilder::new(shell);
    c.arg("-l");
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    if std::env::var("LANG").map_or(true, |v| v.is_empty()) {
        c.env("LANG", "en_US.UTF-8");
    }
    if std::env::var("LC_ALL").map_or(true, |v| v.is_empty()) {
        c.env("LC_ALL", "en_US.UTF-8");
    }
    if let Ok(home) = std::env::var("HOME") {
        c.cwd(home);
    }
    c
}

#[cfg(windows)]
fn shell_command() -> CommandBuilder {
    let mut c = CommandBuilder::new("cmd.exe");
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    c
}

/// PTY bridge: writer for stdin; reader runs in a thread. Resize via
/// `resize_tx`. Child kept so the process stays alive and can be hung up.
pub struct PtyBridge {
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
}

/// Sender to request a PTY resize (cols, rows). A dedicated thread runs
/// master.resize() so the request never blocks an async task.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Spawn a login shell in a PTY with the given initial window size, applied
/// before the first byte is read. Returns the bridge, the PTY output
/// receiver, the resize sender, and the exit-report receiver.
pub fn spawn_pty(
    cols: u16,
    rows: u16,
) -> std::io::Result<(
    PtyBridge,
    mpsc::Receiver<Bytes>,
    ResizeSender,
    mpsc::Receiver<ExitReport>,
)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(std::io::Error::other)?;

    let child = pair
        .slave
        .spawn_command(shell_command())
        .map_err(std::io::Error::other)?;
    let pid = child.process_id();

    let mut reader = pair.master.try_clone_reader().map_err(std::io::Error::other)?;
    let writer = pair.master.take_writer().map_err(std::io::Error::other)?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Bytes>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = mpsc::channel::<ExitReport>(1);

    let child = Arc::new(Mutex::new(child));

    // Blocking thread: read PTY output and hand chunks to the async side.
    // Chunk boundaries carry no meaning and may split escape sequences.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        debug!("PTY reader thread exited");
    });

    // Dedicated thread: resize the PTY when a client reports (cols, rows).
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            let _ = master.resize(size);
        }
    });

    // Poll child.try_wait(); send the exit report once when the process ends.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(s)) => Some(s),
                Err(_) => break,
            }
        };
        if let Some(status) = status {
            let _ = exit_tx.blocking_send(ExitReport {
                exit_code: status.exit_code(),
                signal: status.signal().map(|s| s.to_string()),
            });
            break;
        }
        std::thread::sleep(EXIT_POLL);
    });

    let bridge = PtyBridge {
        writer: Mutex::new(writer),
        child,
        pid,
    };
    Ok((bridge, rx, resize_tx, exit_rx))
}

impl PtyBridge {
    /// Deliver bytes to the child's stdin. Short writes are retried until the
    /// whole buffer is accepted or the child is gone.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("writer mutex poisoned"))?;
        guard.write_all(bytes)?;
        guard.flush()
    }

    /// Hang up the child: SIGHUP first so the shell can run its exit hooks,
    /// then a hard kill if it is still alive after the grace period. The
    /// read stream ends within the grace period either way.
    pub fn hangup(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
        }
        let child = Arc::clone(&self.child);
        std::thread::spawn(move || {
            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                {
                    let mut guard = match child.lock() {
                        Ok(g) => g,
                        Err(_) => return,
                    };
                    match guard.try_wait() {
                        Ok(Some(_)) => return,
                        Ok(None) => {}
                        Err(_) => return,
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            if let Ok(mut guard) = child.lock() {
                let _ = guard.kill();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn spawn_produces_output_and_exit_report() {
        let (bridge, mut pty_rx, _resize_tx, mut exit_rx) =
            spawn_pty(80, 24).expect("spawn shell");

        bridge.write(b"exit\n").expect("write to shell");

        // The shell should close the PTY and the watcher should report exit.
        let report = timeout(Duration::from_secs(10), exit_rx.recv())
            .await
            .expect("exit report within deadline")
            .expect("exit report delivered");
        assert!(report.signal.is_none(), "clean exit has no signal");

        // Reader ends with the channel closing after (at most) some output.
        let drained = timeout(Duration::from_secs(10), async {
            while pty_rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "PTY stream should end after exit");
    }

    #[tokio::test]
    async fn hangup_ends_the_stream() {
        let (bridge, mut pty_rx, _resize_tx, mut exit_rx) =
            spawn_pty(80, 24).expect("spawn shell");

        bridge.hangup();

        let report = timeout(Duration::from_secs(10), exit_rx.recv())
            .await
            .expect("exit report within deadline");
        assert!(report.is_some(), "watcher reports exit after hangup");

        let drained = timeout(Duration::from_secs(10), async {
            while pty_rx.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "PTY stream should end after hangup");
    }

    #[tokio::test]
    async fn resize_is_accepted_while_running() {
        let (bridge, _pty_rx, resize_tx, _exit_rx) = spawn_pty(80, 24).expect("spawn shell");
        resize_tx.send((120, 40)).expect("resize request");
        // Give the resize thread a moment, then shut down.
        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.hangup();
    }
}
