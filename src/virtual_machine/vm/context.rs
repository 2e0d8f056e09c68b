use crate::virtual_machine::sandbox::SandboxConfig;
use std::env;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Chunk size used when pumping a blocking reader into a [`ChannelInput`].
const PUMP_CHUNK: usize = 4096;

/// Wall-clock budget used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host resources a run talks to.
///
/// Console input and output are trait objects so the same VM serves a terminal, a TCP
/// session or an in-memory test buffer.
pub struct Host {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub sandbox: SandboxConfig,
}

impl Host {
    pub fn new(
        stdin: impl Read + Send + 'static,
        stdout: impl Write + Send + 'static,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            sandbox,
        }
    }

    /// Process stdin and stdout. Stdin is pumped through a [`ChannelInput`], so a guest
    /// blocked on an idle terminal still stops at `deadline`.
    pub fn console(sandbox: SandboxConfig, deadline: Deadline) -> Self {
        Self::new(
            ChannelInput::pump(io::stdin(), deadline),
            io::stdout(),
            sandbox,
        )
    }
}

/// Execution limits applied by [`run_image`](super::run_image).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock budget for the whole run.
    pub timeout: Duration,
    /// Optional instruction cap; reaching it ends the run `TimedOut`.
    pub max_steps: Option<u64>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_steps: None,
        }
    }
}

impl RunLimits {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            max_steps: None,
        }
    }

    /// Defaults with the timeout taken from `XVM_TIMEOUT_MS` when set and valid.
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(ms) = env::var("XVM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            limits.timeout = Duration::from_millis(ms);
        }
        limits
    }
}

/// Point in time after which a run must stop.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Expires `budget` from now. A budget too large to represent never expires.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    pub fn never() -> Self {
        Self { at: None }
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` for a deadline that never expires,
    /// `Some(ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Guest stdin fed from a channel of byte chunks.
///
/// A read blocks until a chunk arrives, the sender is dropped (end of input) or the
/// run's deadline passes, which surfaces as [`io::ErrorKind::TimedOut`].
pub struct ChannelInput {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    deadline: Deadline,
}

impl ChannelInput {
    pub fn new(rx: Receiver<Vec<u8>>, deadline: Deadline) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
            deadline,
        }
    }

    /// Reads `source` on a background thread and forwards what it produces.
    ///
    /// The thread stops at end of input, on a read error or once the input is dropped.
    pub fn pump(mut source: impl Read + Send + 'static, deadline: Deadline) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; PUMP_CHUNK];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        });
        Self::new(rx, deadline)
    }

    /// Waits for the next chunk. `Ok(None)` means the sender is gone.
    fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let received = match self.deadline.remaining() {
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(left) => self.rx.recv_timeout(left),
        };
        match received {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "console input deadline passed",
            )),
        }
    }
}

impl Read for ChannelInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.pending.len() {
            match self.next_chunk()? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

/// Cloneable in-memory output sink; every clone appends to the same buffer.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
