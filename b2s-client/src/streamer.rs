//! Spawns `btrfs send`/`btrfs receive` and gives the caller a plain
//! `AsyncRead`/`AsyncWrite` handle onto the child's stdout/stdin, with a
//! bounded ring buffer over stderr so a failure can be reported with useful
//! context (§4.5).
//!
//! Grounded on the small subprocess-and-check-output idiom of
//! [`b2s_tools::command`], generalized from "wait, then check the exit
//! code" to "stream while it runs, and still check the exit code and
//! captured stderr on close".

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Bound on the captured stderr ring buffer (§4.5: "bounded at a small size
/// (e.g. 64 KiB), newest kept").
const STDERR_RING_CAP: usize = 64 * 1024;

/// Grace period `close()` waits for the child to exit after a terminate
/// signal before escalating to a kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

struct StderrRing {
    buf: Mutex<VecDeque<u8>>,
}

impl StderrRing {
    fn new() -> Arc<Self> {
        Arc::new(StderrRing {
            buf: Mutex::new(VecDeque::new()),
        })
    }

    fn push(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend(data);
        while buf.len() > STDERR_RING_CAP {
            buf.pop_front();
        }
    }

    fn tail_string(&self) -> String {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

fn spawn_stderr_reader(mut stderr: tokio::process::ChildStderr) -> (Arc<StderrRing>, JoinHandle<()>) {
    let ring = StderrRing::new();
    let ring_task = ring.clone();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => ring_task.push(&buf[..n]),
            }
        }
    });
    (ring, handle)
}

/// A running `btrfs send` child, exposing its stdout as a plain
/// `AsyncRead`.
pub struct SendStream {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Arc<StderrRing>,
    stderr_task: JoinHandle<()>,
}

impl SendStream {
    /// Spawns `btrfs send [-p parent] snapshot_path`.
    pub fn open(snapshot_path: &Path, parent_snapshot_path: Option<&Path>) -> Result<Self, Error> {
        let mut cmd = tokio::process::Command::new("btrfs");
        cmd.arg("send");
        if let Some(parent) = parent_snapshot_path {
            cmd.arg("-p").arg(parent);
        }
        cmd.arg(snapshot_path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn btrfs send for {snapshot_path:?}"))?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let (stderr_ring, stderr_task) = spawn_stderr_reader(stderr);

        Ok(SendStream {
            child,
            stdout: Some(stdout),
            stderr: stderr_ring,
            stderr_task,
        })
    }

    /// Borrow the stdout handle to feed into a [`b2s_datastore::Chunker`].
    pub fn stdout(&mut self) -> &mut ChildStdout {
        self.stdout.as_mut().expect("stdout already closed")
    }

    /// Closes stdout, terminates the child if still running, waits with a
    /// bounded grace period then escalates to a kill, and returns the
    /// captured stderr tail alongside the exit status (§4.5).
    pub async fn close(mut self) -> Result<(), Error> {
        self.stdout.take();

        let status = match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(status) => status.context("failed to wait on btrfs send")?,
            Err(_) => {
                let _ = self.child.start_kill();
                self.child.wait().await.context("failed to wait on btrfs send after kill")?
            }
        };

        self.stderr_task.abort();
        let stderr_tail = self.stderr.tail_string();

        if !status.success() {
            bail!("btrfs send exited with {status}: {stderr_tail}");
        }
        Ok(())
    }
}

/// A running `btrfs receive` child, exposing its stdin as a plain
/// `AsyncWrite`.
pub struct ReceiveStream {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Arc<StderrRing>,
    stderr_task: JoinHandle<()>,
}

impl ReceiveStream {
    /// Spawns `btrfs receive <parent_dir>`; the restored subvolume appears
    /// as a child of `parent_dir` named after the source snapshot.
    pub fn open(parent_dir: &Path) -> Result<Self, Error> {
        let mut cmd = tokio::process::Command::new("btrfs");
        cmd.arg("receive").arg(parent_dir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn btrfs receive into {parent_dir:?}"))?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let (stderr_ring, stderr_task) = spawn_stderr_reader(stderr);

        Ok(ReceiveStream {
            child,
            stdin: Some(stdin),
            stderr: stderr_ring,
            stderr_task,
        })
    }

    pub fn stdin(&mut self) -> &mut ChildStdin {
        self.stdin.as_mut().expect("stdin already closed")
    }

    /// Flushes and drops stdin, then waits for the child to exit normally.
    /// On failure, behaves like [`SendStream::close`]: terminate, bounded
    /// wait, escalate, report stderr tail.
    pub async fn close(mut self) -> Result<(), Error> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush().await;
            drop(stdin);
        }

        let status = match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(status) => status.context("failed to wait on btrfs receive")?,
            Err(_) => {
                let _ = self.child.kill().await;
                self.child
                    .wait()
                    .await
                    .context("failed to wait on btrfs receive after kill")?
            }
        };

        self.stderr_task.abort();
        let stderr_tail = self.stderr.tail_string();

        if !status.success() {
            bail!("btrfs receive exited with {status}: {stderr_tail}");
        }
        Ok(())
    }
}
