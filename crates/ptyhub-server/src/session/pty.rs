//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running the agent command inside a session's
//! workspace, providing blocking write, resize and terminate operations.
//! The output side is handed out once via [`PtyProcess::take_reader`] to the
//! session's draining thread.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptyhub_core::{HubError, HubResult};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often to poll for child exit during the termination grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters for launching one agent process.
pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    /// Extra environment for the child only. Values are never logged.
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// A running process attached to a pseudo-terminal.
///
/// Owned exclusively by one session; dropping it closes the terminal.
pub trait PtyProcess: Send {
    /// Hand out the output stream. Succeeds once.
    fn take_reader(&mut self) -> HubResult<Box<dyn Read + Send>>;

    /// Write bytes to the process input and flush.
    fn write_all(&mut self, data: &[u8]) -> HubResult<()>;

    /// Change the terminal geometry.
    fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()>;

    /// Ask the process to exit, force-killing it after `grace`.
    fn terminate(&mut self, grace: Duration) -> HubResult<()>;

    fn pid(&self) -> Option<u32>;
}

/// Launches [`PtyProcess`]es.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest<'_>) -> HubResult<Box<dyn PtyProcess>>;
}

/// Spawner backed by the platform's native PTY implementation.
#[derive(Debug, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest<'_>) -> HubResult<Box<dyn PtyProcess>> {
        Ok(Box::new(PtyHandle::spawn(request)?))
    }
}

/// A managed PTY instance.
pub struct PtyHandle {
    reader: Option<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    /// The master side, kept for resize.
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Spawn the requested command on a fresh PTY.
    pub fn spawn(request: SpawnRequest<'_>) -> HubResult<Self> {
        if request.program.trim().is_empty() {
            return Err(HubError::SpawnFailure("empty agent command".into()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| HubError::SpawnFailure(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(request.program);
        cmd.args(request.args);
        cmd.cwd(request.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::SpawnFailure(format!("failed to spawn command: {e}")))?;
        // Only the child keeps the slave side open, so reads fail once it exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HubError::SpawnFailure(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HubError::SpawnFailure(format!("failed to take PTY writer: {e}")))?;

        info!(
            pid = child.process_id(),
            cols = request.cols,
            rows = request.rows,
            program = request.program,
            "PTY spawned"
        );

        Ok(Self {
            reader: Some(reader),
            writer,
            master: pair.master,
            child,
        })
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl PtyProcess for PtyHandle {
    fn take_reader(&mut self) -> HubResult<Box<dyn Read + Send>> {
        self.reader
            .take()
            .ok_or_else(|| HubError::Internal("PTY reader already taken".into()))
    }

    fn write_all(&mut self, data: &[u8]) -> HubResult<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| HubError::Io(std::io::Error::other(format!("PTY resize failed: {e}"))))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn terminate(&mut self, grace: Duration) -> HubResult<()> {
        if self.has_exited() {
            return Ok(());
        }

        let pid = self.child.process_id();
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGTERM);
        }

        if self.wait_for_exit(grace) {
            debug!(?pid, "PTY child exited after SIGTERM");
            return Ok(());
        }

        warn!(?pid, grace_ms = grace.as_millis() as u64, "PTY child ignored SIGTERM, killing");
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGKILL);
        }
        if !self.has_exited() {
            self.child.kill()?;
        }
        self.child.wait()?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

/// Signal the child's whole process group; portable-pty makes the child a
/// session leader, so agents' own subprocesses go down with it.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) {
    if pid == 0 || pid > i32::MAX as u32 {
        warn!(pid, "PID out of range, cannot signal");
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc != 0 {
        debug!(pid, signal, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_sh(script: &str, dir: &Path) -> PtyHandle {
        let args = vec!["-c".to_string(), script.to_string()];
        PtyHandle::spawn(SpawnRequest {
            program: "/bin/sh",
            args: &args,
            cwd: dir,
            env: vec![("PTYHUB_TEST_VAR".into(), "from-env".into())],
            cols: 80,
            rows: 24,
        })
        .unwrap()
    }

    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 1024];
        while !out.contains(needle) {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
        out
    }

    #[test]
    fn runs_in_workspace_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut pty = spawn_sh("echo \"$PTYHUB_TEST_VAR:$(pwd)\"", dir.path());
        let mut reader = pty.take_reader().unwrap();
        let out = read_until(&mut reader, "from-env:");
        assert!(out.contains("from-env:"), "output was {out:?}");
        assert!(pty.take_reader().is_err());
        pty.terminate(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn write_reaches_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut pty = spawn_sh("read line; echo \"got:$line\"", dir.path());
        let mut reader = pty.take_reader().unwrap();
        pty.write_all(b"ping\n").unwrap();
        let out = read_until(&mut reader, "got:ping");
        assert!(out.contains("got:ping"), "output was {out:?}");
        pty.terminate(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn terminate_kills_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut pty = spawn_sh("trap '' TERM; sleep 30", dir.path());
        pty.resize(100, 30).unwrap();
        pty.terminate(Duration::from_millis(200)).unwrap();
        assert!(pty.has_exited());
        // already dead: second terminate is a no-op
        pty.terminate(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn empty_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = PtyHandle::spawn(SpawnRequest {
            program: " ",
            args: &[],
            cwd: dir.path(),
            env: Vec::new(),
            cols: 80,
            rows: 24,
        })
        .err()
        .unwrap();
        assert!(matches!(err, HubError::SpawnFailure(_)));
    }
}
