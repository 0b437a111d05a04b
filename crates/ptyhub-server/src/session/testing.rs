//! In-memory PTY doubles for tests.
//!
//! A fake process's output stream blocks until the test emits data, and ends
//! when the process is terminated or told to exit, like a real PTY whose
//! child went away.

use super::pty::{PtyProcess, PtySpawner, SpawnRequest};
use ptyhub_core::{HubError, HubResult};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakeShared {
    output_tx: Mutex<Option<Sender<Vec<u8>>>>,
    input: Mutex<Vec<u8>>,
    size: Mutex<(u16, u16)>,
    terminate_calls: AtomicUsize,
    fail_io: AtomicBool,
    fail_terminate: AtomicBool,
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

/// Test-side handle onto one fake process.
#[derive(Clone)]
pub struct FakeControl {
    shared: Arc<FakeShared>,
}

impl FakeControl {
    /// Make the process print `text`.
    pub fn emit(&self, text: &str) {
        if let Some(tx) = self.shared.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    /// Make the process exit on its own.
    pub fn exit(&self) {
        self.shared.output_tx.lock().unwrap().take();
    }

    /// Make subsequent writes and resizes fail.
    pub fn fail_io(&self) {
        self.shared.fail_io.store(true, Ordering::SeqCst);
    }

    /// Make `terminate` report an error. The process still goes away.
    pub fn fail_terminate(&self) {
        self.shared.fail_terminate.store(true, Ordering::SeqCst);
    }

    pub fn input(&self) -> Vec<u8> {
        self.shared.input.lock().unwrap().clone()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.shared.size.lock().unwrap()
    }

    pub fn terminate_calls(&self) -> usize {
        self.shared.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> bool {
        self.terminate_calls() > 0 && self.shared.output_tx.lock().unwrap().is_none()
    }

    pub fn cwd(&self) -> PathBuf {
        self.shared.cwd.clone()
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.shared.env.clone()
    }
}

struct FakeProcess {
    shared: Arc<FakeShared>,
    reader: Option<ChannelReader>,
}

impl PtyProcess for FakeProcess {
    fn take_reader(&mut self) -> HubResult<Box<dyn Read + Send>> {
        match self.reader.take() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(HubError::Internal("reader already taken".into())),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> HubResult<()> {
        if self.shared.fail_io.load(Ordering::SeqCst) {
            return Err(HubError::Io(std::io::Error::other("broken pipe")));
        }
        self.shared.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> HubResult<()> {
        if self.shared.fail_io.load(Ordering::SeqCst) {
            return Err(HubError::Io(std::io::Error::other("ioctl failed")));
        }
        *self.shared.size.lock().unwrap() = (cols, rows);
        Ok(())
    }

    fn terminate(&mut self, _grace: Duration) -> HubResult<()> {
        self.shared.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.output_tx.lock().unwrap().take();
        if self.shared.fail_terminate.load(Ordering::SeqCst) {
            return Err(HubError::Io(std::io::Error::other("kill: operation not permitted")));
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// `Read` over a channel of byte vectors; EOF once every sender is gone.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(data) => {
                    self.pending = data;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Spawner handing out [`FakeProcess`]es and remembering each one.
#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<Vec<FakeControl>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A spawner whose every spawn fails.
    pub fn failing() -> Self {
        let spawner = Self::default();
        spawner.fail.store(true, Ordering::SeqCst);
        spawner
    }

    /// A spawner that takes `delay` to start each process.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Number of spawn attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> FakeControl {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing spawned")
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, request: SpawnRequest<'_>) -> HubResult<Box<dyn PtyProcess>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(HubError::SpawnFailure(format!(
                "{}: no such file or directory",
                request.program
            )));
        }

        let (tx, rx) = channel();
        let shared = Arc::new(FakeShared {
            output_tx: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            size: Mutex::new((request.cols, request.rows)),
            terminate_calls: AtomicUsize::new(0),
            fail_io: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            cwd: request.cwd.to_path_buf(),
            env: request.env,
        });
        self.spawned.lock().unwrap().push(FakeControl {
            shared: shared.clone(),
        });
        Ok(Box::new(FakeProcess {
            shared,
            reader: Some(ChannelReader {
                rx,
                pending: Vec::new(),
                pos: 0,
            }),
        }))
    }
}
