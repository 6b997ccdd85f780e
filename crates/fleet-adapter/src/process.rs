//! Capture process supervision

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fleet_core::events::CaptureEvent;
use fleet_core::prelude::*;

/// Read buffer for capture output; one chunk becomes one frame event
const CHUNK_SIZE: usize = 64 * 1024;

/// How long to wait for the OS to reap a force-killed child
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How long the exit task waits for stdout to drain before emitting `Exited`
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Exclusive handle to a long-running capture subprocess.
///
/// The `Child` is moved into a dedicated `wait_for_exit` task which is the only
/// place that reaps it, so exactly one [`CaptureEvent::Exited`] is emitted with
/// the real exit code, after stdout has drained.
///
/// The handle keeps a kill channel ([`kill_tx`]) to request a force-kill, an
/// atomic flag ([`exited`]) for synchronous `has_exited()` checks, and a
/// [`Notify`] so `shutdown()` can await exit without polling. Dropping a handle
/// whose process is still running kills it.
pub struct CaptureProcess {
    /// Control input for the tool; dropping it closes the child's stdin
    stdin_tx: Option<mpsc::Sender<Bytes>>,
    pid: Option<u32>,
    /// Consumed on first use (or on drop)
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl std::fmt::Debug for CaptureProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureProcess")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl CaptureProcess {
    /// Spawn `program args...` and start relaying its output to `event_tx`
    pub fn spawn(
        program: &str,
        args: &[String],
        event_tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<Self> {
        info!("Spawning capture: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true) // Critical: cleanup on drop
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound {
                        tool: program.to_string(),
                    }
                } else {
                    Error::ProcessSpawn {
                        reason: e.to_string(),
                    }
                }
            })?;

        let pid = child.id();
        info!("Capture process started with PID: {:?}", pid);

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(Error::ProcessSpawn {
                    reason: "capture process stdio was not piped".to_string(),
                })
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(Self::stdin_writer(stdin, stdin_rx));

        let stdout_task = tokio::spawn(Self::stdout_reader(stdout, event_tx.clone()));
        tokio::spawn(Self::stderr_reader(stderr, event_tx.clone()));

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            stdout_task,
            event_tx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Ok(Self {
            stdin_tx: Some(stdin_tx),
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
        })
    }

    /// Background task: owns `child`, waits for it to exit, emits `CaptureEvent::Exited`.
    ///
    /// Two ways the task can end:
    /// 1. The process exits on its own: `child.wait()` resolves.
    /// 2. `kill_rx` fires (or its sender is dropped): kill first, then wait.
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        stdout_task: JoinHandle<()>,
        event_tx: mpsc::Sender<CaptureEvent>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        info!("Capture process exited with status: {:?}", status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for capture process: {}", e);
                        None
                    }
                }
            }
            _ = kill_rx => {
                info!("Kill signal received, force-killing capture process");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill capture process: {}", e);
                }
                match child.wait().await {
                    Ok(status) => {
                        info!("Capture process killed, exit status: {:?}", status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting after kill: {}", e);
                        None
                    }
                }
            }
        };

        // Let the last frames reach the channel so `Exited` is the final event.
        if timeout(DRAIN_WAIT, stdout_task).await.is_err() {
            debug!("stdout reader still busy after exit, emitting Exited anyway");
        }

        // Mark as exited and wake waiters before sending the event, so
        // `has_exited()` is true by the time anyone observes `Exited`.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();

        debug!("Sending CaptureEvent::Exited {{ code: {:?} }}", code);
        let _ = event_tx.send(CaptureEvent::Exited { code }).await;
    }

    /// Read raw stdout chunks and send them as `CaptureEvent::Frame`.
    async fn stdout_reader(
        mut stdout: tokio::process::ChildStdout,
        tx: mpsc::Sender<CaptureEvent>,
    ) {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        loop {
            buf.reserve(CHUNK_SIZE);
            match stdout.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!("stdout: {} bytes", n);
                    let chunk = buf.split().freeze();
                    if tx.send(CaptureEvent::Frame(chunk)).await.is_err() {
                        debug!("frame channel closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read capture output: {}", e);
                    break;
                }
            }
        }

        debug!("stdout reader finished");
    }

    /// Read lines from stderr and send as `CaptureEvent::Stderr`
    async fn stderr_reader(stderr: tokio::process::ChildStderr, tx: mpsc::Sender<CaptureEvent>) {
        let mut reader = BufReader::new(stderr).lines();

        while let Ok(Some(line)) = reader.next_line().await {
            trace!("stderr: {}", line);

            if tx.send(CaptureEvent::Stderr(line)).await.is_err() {
                debug!("stderr channel closed");
                break;
            }
        }

        debug!("stderr reader finished");
    }

    /// Write control bytes to stdin; the pipe closes when the sender is dropped
    async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Bytes>) {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = stdin.write_all(&bytes).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        debug!("stdin writer finished");
    }

    /// Stop the capture process, reaping it before returning.
    ///
    /// 1. Early exit if the process is already gone (atomic check)
    /// 2. Close stdin as a stop request
    /// 3. Wait up to `grace` for a clean exit via `exit_notify`
    /// 4. Force-kill and wait for the wait task to reap the child
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            debug!("Capture process already exited, nothing to stop");
            return Ok(());
        }

        info!("Stopping capture process {:?}", self.pid);
        self.stdin_tx.take();

        if self.wait_exit(grace).await {
            info!("Capture process exited gracefully");
            return Ok(());
        }

        warn!("Timeout waiting for graceful exit, force killing");
        self.force_kill();

        if self.wait_exit(KILL_WAIT).await {
            Ok(())
        } else {
            Err(Error::timeout("capture process kill", KILL_WAIT))
        }
    }

    /// Wait until the process has exited, at most `limit`. Returns whether it did.
    ///
    /// Race-free: the `notified()` future is created before the final
    /// `has_exited()` check so a notification in between cannot be missed.
    pub async fn wait_exit(&self, limit: Duration) -> bool {
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return true;
        }
        timeout(limit, notified).await.is_ok() || self.has_exited()
    }

    /// Force kill the process by signalling the wait task
    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            // The wait task may already have exited naturally
            let _ = tx.send(());
        }
    }

    /// Non-blocking check backed by the flag the wait task sets
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.has_exited()
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl CaptureProcess {
    /// An in-process stand-in for a capture tool, driven by `script`.
    ///
    /// Behaves like a real process from the handle's point of view: frames on
    /// the event channel, a graceful exit (code 0) when stdin is closed, code
    /// `None` when killed, and exactly one `Exited` event.
    pub fn simulated(script: CaptureScript, event_tx: mpsc::Sender<CaptureEvent>) -> Self {
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(16);

        let task_exited = Arc::clone(&exited);
        let task_notify = Arc::clone(&exit_notify);

        tokio::spawn(async move {
            let mut sent = 0usize;

            let startup = tokio::time::sleep(script.first_frame_delay);
            tokio::pin!(startup);
            let early_exit = loop {
                tokio::select! {
                    _ = &mut startup => break None,
                    _ = &mut kill_rx => break Some(None),
                    control = stdin_rx.recv() => {
                        if control.is_none() {
                            break Some(Some(0));
                        }
                    }
                }
            };

            let code = if let Some(code) = early_exit {
                code
            } else {
                loop {
                    if let Some((after, code)) = script.crash_after {
                        if sent >= after {
                            let _ = event_tx
                                .send(CaptureEvent::Stderr("capture crashed".to_string()))
                                .await;
                            break Some(code);
                        }
                    }

                    let frame = if script.frames.is_empty() {
                        Bytes::from_static(b"frame")
                    } else {
                        script.frames[sent % script.frames.len()].clone()
                    };
                    if event_tx.send(CaptureEvent::Frame(frame)).await.is_err() {
                        break Some(0);
                    }
                    sent += 1;

                    tokio::select! {
                        _ = &mut kill_rx => break None,
                        control = stdin_rx.recv() => {
                            if control.is_none() {
                                break Some(0);
                            }
                        }
                        _ = tokio::time::sleep(script.interval) => {}
                    }
                }
            };

            task_exited.store(true, Ordering::Release);
            task_notify.notify_waiters();
            let _ = event_tx.send(CaptureEvent::Exited { code }).await;
        });

        Self {
            stdin_tx: Some(stdin_tx),
            pid: None,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
        }
    }
}

/// Behaviour of a [`CaptureProcess::simulated`] capture
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Clone)]
pub struct CaptureScript {
    /// Payloads to emit, cycled; a fixed payload when empty
    pub frames: Vec<Bytes>,
    pub interval: Duration,
    pub first_frame_delay: Duration,
    /// Exit with this code after emitting this many frames
    pub crash_after: Option<(usize, i32)>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl Default for CaptureScript {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            interval: Duration::from_millis(10),
            first_frame_delay: Duration::ZERO,
            crash_after: None,
        }
    }
}

impl Drop for CaptureProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!("CaptureProcess dropped while process may still be running");
            // If kill_tx was already consumed by shutdown(), this is a no-op;
            // kill_on_drop(true) on the Child is the final safety net.
            self.force_kill();
        }
        debug!("CaptureProcess dropped");
    }
}
