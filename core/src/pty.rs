//! Portable PTY: spawn a child process and bridge its stdin/stdout to the
//! rest of the system. One reader thread, one resize thread, one writer
//! thread and one wait-poller thread per PTY — the thread-per-blocking-
//! resource model required by spec.md §5, generalized to an arbitrary
//! argv/cwd/env configuration (spec.md §3 `SessionConfig`).

use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};

/// Immutable configuration for one session's PTY, set at creation time
/// (spec.md §3: "Configuration (immutable after creation)").
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: vec!["bash".to_string(), "-l".to_string()],
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }
}

fn build_command(config: &PtyConfig) -> Result<CommandBuilder> {
    let mut iter = config.command.iter();
    let program = iter
        .next()
        .ok_or_else(|| CoreError::ConfigError("command must have at least one argument".into()))?;
    let mut cmd = CommandBuilder::new(program);
    for arg in iter {
        cmd.arg(arg);
    }
    if let Some(cwd) = &config.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (k, v) in &config.env {
        cmd.env(k, v);
    }
    Ok(cmd)
}

/// Run state of the PTY child, mirroring spec.md §3's dynamic session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyRunState {
    Running,
    Exited { exit_code: u32 },
}

/// Capacity of the bounded input channel. `write_input` surfaces backpressure
/// instead of buffering unboundedly once this fills (spec.md §4.1).
const INPUT_QUEUE_CAP: usize = 256;
/// Output reader channel capacity.
const OUTPUT_QUEUE_CAP: usize = 256;
/// Single read() chunk size; spec.md §4.1 allows 4-64 KiB.
const READ_CHUNK_BYTES: usize = 8192;

/// Sender for window-resize requests (cols, rows). A dedicated thread applies
/// them serially to the PTY master, so concurrent callers are tolerated
/// (last-writer-wins, per spec.md §4.1).
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Handle to a spawned PTY: input writer, resize sender, and child control.
pub struct PtyHandle {
    input_tx: mpsc::Sender<Vec<u8>>,
    pub resize_tx: ResizeSender,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl PtyHandle {
    /// Deliver bytes to the child's stdin, unmodified, in order. Returns
    /// `CoreError::WouldBlock` if the bounded input queue is full instead of
    /// blocking the caller (spec.md §4.1).
    pub fn write_input(&self, bytes: Vec<u8>) -> Result<()> {
        self.input_tx
            .try_send(bytes)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CoreError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => {
                    CoreError::Conflict("session PTY is closed".into())
                }
            })
    }

    /// Update the PTY window size. Non-blocking; applied asynchronously by
    /// the resize thread.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.resize_tx
            .send((cols, rows))
            .map_err(|_| CoreError::Conflict("session PTY is closed".into()))
    }

    /// Send a terminate signal to the child. Idempotent; returns immediately.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| CoreError::Conflict("child mutex poisoned".into()))?;
        let _ = guard.kill();
        Ok(())
    }
}

/// Spawn a child process in a PTY. Returns the handle plus two receivers: raw
/// output chunks (PTY order, non-empty, no framing) and run-state transitions
/// (`Running` once, then a terminal `Exited`).
pub fn spawn(
    config: PtyConfig,
) -> Result<(PtyHandle, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<PtyRunState>)> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;

    let cmd = build_command(&config)?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| CoreError::SpawnFailed(e.to_string()))?;
    let master = pair.master;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE_CAP);
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_CAP);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (state_tx, state_rx) = mpsc::channel::<PtyRunState>(4);

    let child = Arc::new(Mutex::new(child));

    // Dedicated reader thread: single read() call per loop iteration, forwards
    // chunks in PTY order with no artificial latency.
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated writer thread: drains the bounded input queue onto the PTY
    // master. Backpressure is surfaced at `write_input` (try_send), not here.
    tokio::spawn(async move {
        while let Some(chunk) = in_rx.recv().await {
            if writer.write_all(&chunk).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    // Dedicated resize thread: applies resize requests serially to the master.
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

    // Dedicated wait-poller thread: reports Running once, then a terminal Exited.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || {
        let mut sent_running = false;
        loop {
            let exit_status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => None,
                    Ok(Some(s)) => Some(s.exit_code()),
                    Err(_) => break,
                }
            };
            if let Some(code) = exit_status {
                let _ = state_tx.blocking_send(PtyRunState::Exited { exit_code: code });
                break;
            }
            if !sent_running {
                sent_running = true;
                let _ = state_tx.blocking_send(PtyRunState::Running);
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
    });

    let handle = PtyHandle {
        input_tx: in_tx,
        resize_tx,
        child,
    };
    Ok((handle, out_rx, state_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn echo_produces_output_and_exits() {
        let config = PtyConfig {
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            ..Default::default()
        };
        let (_handle, mut out_rx, mut state_rx) = spawn(config).unwrap();

        let mut collected = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), out_rx.recv()).await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hi"));

        let mut saw_exit = false;
        while let Ok(Some(state)) = timeout(Duration::from_secs(5), state_rx.recv()).await {
            if matches!(state, PtyRunState::Exited { .. }) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[test]
    fn build_command_rejects_empty_argv() {
        let config = PtyConfig {
            command: vec![],
            ..Default::default()
        };
        assert!(matches!(
            build_command(&config),
            Err(CoreError::ConfigError(_))
        ));
    }
}
