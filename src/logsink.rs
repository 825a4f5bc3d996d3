use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{self, ErrorKind, Write},
    path::PathBuf,
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};

/// how long the writer waits before retrying the same entry
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

const TIMESTAMP_FORMAT: &str = "%Y/%-m/%-d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }

    /// `<timestamp>,<message>` followed by a newline
    pub fn to_line(&self) -> String {
        format!(
            "{},{}\n",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.message
        )
    }
}

#[derive(Debug)]
enum Command {
    Write(LogEntry),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("log file is held by someone else: {0}")]
    Contended(io::Error),
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::PermissionDenied => WriteError::Contended(err),
            _ => WriteError::Io(err),
        }
    }
}

/// Append-only log file fed through an unbounded queue.
///
/// `record` never blocks. A dedicated thread writes the entries in the order
/// they were recorded, and keeps retrying the entry at the head of the queue
/// until it lands in the file. Nothing is dropped once recorded.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    queue: Option<mpsc::UnboundedSender<Command>>,
    writer: Option<JoinHandle<()>>,
}

impl LogSink {
    pub fn spawn(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_retry_delay(path, RETRY_DELAY)
    }

    pub fn with_retry_delay(path: impl Into<PathBuf>, retry_delay: Duration) -> io::Result<Self> {
        let path = path.into();
        let (queue, rx) = mpsc::unbounded_channel();
        let writer = Writer {
            path: path.clone(),
            retry_delay,
        };
        let writer = thread::Builder::new()
            .name("log-sink".to_string())
            .spawn(move || writer.run(rx))?;

        Ok(Self {
            path,
            queue: Some(queue),
            writer: Some(writer),
        })
    }

    pub fn record(&self, message: impl Into<String>) {
        self.send(Command::Write(LogEntry::now(message)));
    }

    /// resolves once everything recorded before this call is on disk
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush(done));
        let _ = wait.await;
    }

    /// Close the queue and block until the writer has drained it.
    /// This blocks for as long as the backing file stays inaccessible.
    pub fn shutdown(mut self) {
        self.queue.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("log writer for {} panicked", self.path.display());
            }
        }
    }

    fn send(&self, cmd: Command) {
        if let Some(queue) = &self.queue {
            if queue.send(cmd).is_err() {
                tracing::error!("log writer for {} is gone", self.path.display());
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        // the writer is detached and still drains what was queued
        self.queue.take();
    }
}

struct Writer {
    path: PathBuf,
    retry_delay: Duration,
}

impl Writer {
    fn run(self, mut queue: mpsc::UnboundedReceiver<Command>) {
        if let Err(err) = self.open() {
            tracing::warn!("cannot create log file {}: {err}", self.path.display());
        }

        while let Some(cmd) = queue.blocking_recv() {
            match cmd {
                Command::Write(entry) => self.write_until_done(&entry),
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("log queue for {} closed", self.path.display());
    }

    fn write_until_done(&self, entry: &LogEntry) {
        let line = entry.to_line();
        // bytes of `line` already in the file, kept across retries
        let mut written = 0;
        let mut attempt = 0u64;
        loop {
            match self.append(line.as_bytes(), &mut written) {
                Ok(()) => return,
                Err(WriteError::Contended(err)) => {
                    tracing::debug!(
                        "log file {} unavailable (attempt {attempt}): {err}",
                        self.path.display()
                    );
                }
                Err(WriteError::Io(err)) => {
                    tracing::warn!(
                        "failed to write to log file {} (attempt {attempt}, {written}/{} bytes in): {err}",
                        self.path.display(),
                        line.len()
                    );
                }
            }
            attempt += 1;
            thread::sleep(self.retry_delay);
        }
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    fn append(&self, line: &[u8], written: &mut usize) -> Result<(), WriteError> {
        let file = self.open()?;
        lock(&file)?;
        let mut out = &file;
        write_from(&mut out, line, written)
    }
}

/// Exclusive advisory lock, held until `file` is closed. Another process
/// holding the lock is contention.
fn lock(file: &File) -> Result<(), WriteError> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(WriteError::Contended(ErrorKind::WouldBlock.into())),
        Err(TryLockError::Error(err)) if err.kind() == ErrorKind::Unsupported => {
            tracing::trace!("file locking unsupported, writing unlocked");
            Ok(())
        }
        Err(TryLockError::Error(err)) => Err(err.into()),
    }
}

/// Log file as seen by `write_from`.
trait Durable: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl Durable for &File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write what's left of `line` past `written`, then sync. A failure leaves
/// `written` pointing at the first byte not yet in the file, so the retry
/// neither repeats nor skips anything. Once everything is written only the
/// sync is retried.
fn write_from<W: Durable>(out: &mut W, line: &[u8], written: &mut usize) -> Result<(), WriteError> {
    while *written < line.len() {
        match out.write(&line[*written..]) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => *written += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    out.sync()?;
    Ok(())
}
