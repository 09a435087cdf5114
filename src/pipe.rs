//! Streaming the archive to stdout through a named pipe.
//!
//! The archive writer only knows how to write to a path, so stdout is
//! exposed as a FIFO in a private temporary directory.  A blocking task
//! drains the FIFO into stdout and reports the outcome over a one-shot
//! channel.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use tracing::{debug, error};

const FIFO_NAME: &str = "archive.fifo";
const FIFO_MODE: libc::mode_t = 0o600;
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(5);

type DrainResult = io::Result<u64>;

pub struct PipeStreamer {
    dir: TempDir,
    fifo: PathBuf,
    done: oneshot::Receiver<DrainResult>,
    /// Drain result observed while waiting for the reader to show up.
    early: Option<DrainResult>,
    writer_attached: bool,
}

impl PipeStreamer {
    /// Start draining a fresh FIFO into stdout.
    pub fn start() -> io::Result<Self> {
        Self::start_with(io::stdout())
    }

    /// Start draining a fresh FIFO into `sink`.  Must be called from within
    /// a tokio runtime.
    pub fn start_with<S>(mut sink: S) -> io::Result<Self>
    where
        S: Write + Send + 'static,
    {
        let dir = tempfile::Builder::new()
            .prefix("image-creator-pipe-")
            .tempdir()?;
        let fifo = dir.path().join(FIFO_NAME);
        make_fifo(&fifo)?;
        debug!(path = %fifo.display(), "created output pipe");

        let (tx, done) = oneshot::channel();
        let reader_path = fifo.clone();
        tokio::task::spawn_blocking(move || {
            let result: DrainResult = (|| {
                let mut pipe = File::open(&reader_path)?;
                let copied = io::copy(&mut pipe, &mut sink)?;
                sink.flush()?;
                Ok(copied)
            })();
            let _ = tx.send(result);
        });

        Ok(Self {
            dir,
            fifo,
            done,
            early: None,
            writer_attached: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.fifo
    }

    /// Open the write end of the FIFO once the drain task is reading it.
    pub async fn open_writer(&mut self) -> io::Result<File> {
        let file = self.open_write_side().await?;
        self.writer_attached = true;
        Ok(file)
    }

    async fn open_write_side(&mut self) -> io::Result<File> {
        loop {
            // Non-blocking so a reader that never arrives cannot hang us.
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.fifo)
            {
                Ok(nonblocking) => {
                    let file = OpenOptions::new().write(true).open(&self.fifo)?;
                    drop(nonblocking);
                    return Ok(file);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if self.early.is_none() {
                        if let Ok(result) = self.done.try_recv() {
                            self.early = Some(result);
                        }
                    }
                    if self.early.is_some() {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "pipe reader exited before the archive was written",
                        ));
                    }
                    tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tear the pipe down and wait for the drain task.  Any writer handed
    /// out by [`open_writer`](Self::open_writer) must be dropped first.
    ///
    /// Returns the number of bytes streamed.
    pub async fn finish(mut self) -> io::Result<u64> {
        if !self.writer_attached {
            // Give a reader blocked in open() its EOF.
            if let Ok(file) = self.open_write_side().await {
                drop(file);
            }
        }

        let dir = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            error!(path = %dir.display(), error = %e, "failed to remove named pipe");
        }

        match self.early {
            Some(result) => result,
            None => self
                .done
                .await
                .map_err(|_| io::Error::other("pipe reader terminated without a result"))?,
        }
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
