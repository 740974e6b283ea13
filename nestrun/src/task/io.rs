//! Task stdio over named pipes.
//!
//! The daemon opens the FIFOs for writing; background relays copy whatever
//! arrives to this process's stdout and stderr. The relays hold the pipes
//! open read-write, so they never see EOF on their own: after the task exits
//! they drain until the pipe stays idle and then stop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nestrun_shared::records::TaskStdio;
use nestrun_shared::{NestrunError, NestrunResult};
use nix::sys::stat::Mode;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long a relay waits for more output once the task has exited.
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// FIFO pair for one task plus the relays reading it.
pub struct TaskIo {
    _dir: TempDir,
    stdout: PathBuf,
    stderr: PathBuf,
    exited: watch::Sender<bool>,
    relays: Vec<JoinHandle<()>>,
}

impl TaskIo {
    /// Relay to this process's stdout and stderr.
    pub fn create() -> NestrunResult<Self> {
        Self::with_writers(tokio::io::stdout(), tokio::io::stderr())
    }

    /// Relay to the given writers.
    pub fn with_writers<O, E>(stdout: O, stderr: E) -> NestrunResult<Self>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let dir = tempfile::Builder::new()
            .prefix("nestrun-io-")
            .tempdir()
            .map_err(|e| NestrunError::TaskCreate(format!("create fifo directory: {}", e)))?;

        let stdout_path = dir.path().join("stdout");
        let stderr_path = dir.path().join("stderr");
        make_fifo(&stdout_path)?;
        make_fifo(&stderr_path)?;

        let (exited, watcher) = watch::channel(false);
        let relays = vec![
            tokio::spawn(relay(open_fifo(&stdout_path)?, stdout, watcher.clone())),
            tokio::spawn(relay(open_fifo(&stderr_path)?, stderr, watcher)),
        ];

        tracing::debug!(dir = %dir.path().display(), "Task FIFOs created");
        Ok(Self {
            _dir: dir,
            stdout: stdout_path,
            stderr: stderr_path,
            exited,
            relays,
        })
    }

    /// Stdio wiring handed to the daemon: no stdin, no terminal.
    pub fn stdio(&self) -> TaskStdio {
        TaskStdio {
            stdin: None,
            stdout: Some(self.stdout.clone()),
            stderr: Some(self.stderr.clone()),
            terminal: false,
        }
    }

    /// Drain remaining output and wait for the relays to stop.
    pub async fn finish(mut self) {
        let _ = self.exited.send(true);
        for relay in std::mem::take(&mut self.relays) {
            if let Err(e) = relay.await {
                tracing::debug!(error = %e, "Stdio relay ended abnormally");
            }
        }
    }
}

impl Drop for TaskIo {
    fn drop(&mut self) {
        for relay in &self.relays {
            relay.abort();
        }
    }
}

fn make_fifo(path: &Path) -> NestrunResult<()> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
        NestrunError::TaskCreate(format!("create fifo {}: {}", path.display(), e))
    })
}

fn open_fifo(path: &Path) -> NestrunResult<tokio::net::unix::pipe::Receiver> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options
        .open_receiver(path)
        .map_err(|e| NestrunError::TaskCreate(format!("open fifo {}: {}", path.display(), e)))
}

async fn relay<R, W>(mut reader: R, mut writer: W, mut exited: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Stdio relay read failed");
                    break;
                }
            },
            _ = exited.changed() => break,
        }
    }

    while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_IDLE, reader.read(&mut buf)).await {
        if n == 0 || writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Writer collecting everything into a shared buffer.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for Capture {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_output_written_before_exit_is_relayed() {
        let out = Capture::default();
        let io = TaskIo::with_writers(out.clone(), Capture::default()).unwrap();
        let stdio = io.stdio();
        assert!(stdio.stdin.is_none());
        assert!(!stdio.terminal);

        let path = stdio.stdout.unwrap();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut fifo = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            fifo.write_all(b"engine started\n").unwrap();
        })
        .await
        .unwrap();

        io.finish().await;
        assert_eq!(&*out.0.lock().unwrap(), b"engine started\n");
    }

    #[tokio::test]
    async fn test_finish_without_output_returns() {
        let io = TaskIo::with_writers(Capture::default(), Capture::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), io.finish())
            .await
            .unwrap();
    }
}
