//! Line-oriented command channel.
//!
//! Commands arrive as single-line, case-insensitive ASCII tokens (`START`,
//! `STOP`, `QUIT`) on a named FIFO and, optionally, on the console. Each source
//! is drained by a dedicated reader thread. A read is truncated at its first
//! line terminator, so only one command is taken from each read no matter how
//! many were written in one go.
//!
//! The channel holds at most one pending command. Whichever source delivers
//! first wins; a command that arrives while another is still pending is
//! dropped, not queued.

use crate::error::{AppResult, SimError};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest command read in one go, terminator included.
pub const MAX_CMD_LEN: usize = 64;

/// How long a reader waits for input before checking whether its channel is gone.
const READER_POLL_MS: i32 = 100;

/// A recognised control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Commit a scan using the current `SCANLEN`/`STRTDMJD`.
    Start,
    /// Abort the scan in progress.
    Stop,
    /// Shut the pipeline down.
    Quit,
}

impl Command {
    /// Canonical token.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Quit => "QUIT",
        }
    }

    /// Parse one raw read. Anything after the first `\n` is discarded.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.split('\n').next().unwrap_or_default();
        line.trim().parse().ok()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for text that is not a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommand(pub String);

impl fmt::Display for InvalidCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid command '{}'", self.0)
    }
}

impl std::error::Error for InvalidCommand {}

impl FromStr for Command {
    type Err = InvalidCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("START") {
            Ok(Command::Start)
        } else if s.eq_ignore_ascii_case("STOP") {
            Ok(Command::Stop)
        } else if s.eq_ignore_ascii_case("QUIT") {
            Ok(Command::Quit)
        } else {
            Err(InvalidCommand(s.to_string()))
        }
    }
}

/// Anything that can be polled for commands.
pub trait CommandSource: Send {
    /// Wait up to `timeout` for one command.
    fn poll(&mut self, timeout: Duration) -> Option<Command>;
}

/// Path of the control FIFO for a user and instance.
pub fn control_fifo_path(dir: &Path, user: &str, instance: u32) -> PathBuf {
    dir.join(format!("{user}_scan_control_{instance}"))
}

/// Options for [`CommandChannel::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelOptions {
    /// Create the FIFO if it does not exist.
    pub create: bool,
    /// Also accept commands typed on stdin.
    pub console: bool,
}

/// The receiving end of the command channel.
///
/// Dropping it stops the reader threads and closes the FIFO, after which
/// [`send_command`] to the same path fails.
pub struct CommandChannel {
    rx: Receiver<Command>,
    path: Option<PathBuf>,
    closed: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
}

/// Hands commands to a [`CommandChannel`] with the same single-slot semantics
/// as the FIFO readers.
#[derive(Clone)]
pub struct CommandInjector {
    tx: SyncSender<Command>,
}

impl CommandInjector {
    /// Deliver `command`; returns `false` if it was dropped because another
    /// command is still pending or the channel is gone.
    pub fn send(&self, command: Command) -> bool {
        deliver(&self.tx, command, "injector") == Delivery::Accepted
    }
}

impl CommandChannel {
    /// A channel fed only through the returned injector.
    pub fn detached() -> (CommandInjector, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        let channel = Self {
            rx,
            path: None,
            closed: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
        };
        (CommandInjector { tx }, channel)
    }

    /// Open the control FIFO at `path` and start its reader threads.
    ///
    /// Any failure here is fatal to initialisation.
    #[cfg(unix)]
    pub fn open(path: &Path, options: ChannelOptions) -> AppResult<Self> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::FileTypeExt;

        let channel_err = |reason: String| SimError::Channel {
            path: path.to_path_buf(),
            reason,
        };

        if !path.exists() {
            if !options.create {
                return Err(channel_err("no such FIFO".into()));
            }
            make_fifo(path).map_err(|e| channel_err(format!("mkfifo failed: {e}")))?;
            info!(path = %path.display(), "Created control FIFO");
        }

        let meta = std::fs::metadata(path).map_err(|e| channel_err(e.to_string()))?;
        if !meta.file_type().is_fifo() {
            return Err(channel_err("path exists but is not a FIFO".into()));
        }

        // Read+write keeps a writer attached, so the reader never sees EOF when
        // an external writer closes its end.
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| channel_err(e.to_string()))?;

        let (tx, rx) = mpsc::sync_channel(1);
        let mut channel = Self {
            rx,
            path: Some(path.to_path_buf()),
            closed: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
        };
        channel.readers.push(spawn_reader(
            "cmd-fifo",
            fifo,
            tx.clone(),
            Arc::clone(&channel.closed),
        )?);
        if options.console {
            channel.readers.push(spawn_reader(
                "cmd-console",
                std::io::stdin(),
                tx,
                Arc::clone(&channel.closed),
            )?);
        }

        info!(path = %path.display(), console = options.console, "Command channel open");
        Ok(channel)
    }

    /// FIFO path, if this channel is backed by one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                warn!("Command reader thread panicked");
            }
        }
        if let Some(path) = &self.path {
            debug!(path = %path.display(), "Command channel closed");
        }
    }
}

impl CommandSource for CommandChannel {
    fn poll(&mut self, timeout: Duration) -> Option<Command> {
        if timeout.is_zero() {
            return self.rx.try_recv().ok();
        }
        match self.rx.recv_timeout(timeout) {
            Ok(cmd) => Some(cmd),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Every reader is gone; behave like an idle channel.
                thread::sleep(timeout);
                None
            }
        }
    }
}

/// Write one command line into a running simulator's FIFO.
///
/// Fails immediately if nobody has the FIFO open for reading.
#[cfg(unix)]
pub fn send_command(path: &Path, command: Command) -> AppResult<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| SimError::Channel {
            path: path.to_path_buf(),
            reason: if e.raw_os_error() == Some(libc::ENXIO) {
                "no simulator is listening".into()
            } else {
                e.to_string()
            },
        })?;
    fifo.write_all(format!("{command}\n").as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    #[allow(unsafe_code)]
    let rv = unsafe { libc::mkfifo(c_path.as_ptr(), 0o660) };
    if rv == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn spawn_reader<R>(
    name: &str,
    mut reader: R,
    tx: SyncSender<Command>,
    closed: Arc<AtomicBool>,
) -> AppResult<JoinHandle<()>>
where
    R: Read + std::os::unix::io::AsRawFd + Send + 'static,
{
    let source = name.to_string();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let fd = reader.as_raw_fd();
            let mut buf = [0u8; MAX_CMD_LEN];
            while !closed.load(Ordering::Acquire) {
                match wait_readable(fd, READER_POLL_MS) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(source = %source, error = %e, "Command source poll failed");
                        break;
                    }
                }
                match reader.read(&mut buf[..MAX_CMD_LEN - 1]) {
                    Ok(0) => {
                        debug!(source = %source, "Command source reached EOF");
                        break;
                    }
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        let Some(cmd) = Command::parse(&text) else {
                            debug!(
                                source = %source,
                                text = %text.trim(),
                                "Ignoring invalid command"
                            );
                            continue;
                        };
                        if deliver(&tx, cmd, &source) == Delivery::Closed {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(source = %source, error = %e, "Command source read failed");
                        break;
                    }
                }
            }
            debug!(source = %source, "Command reader stopped");
        })?;
    Ok(handle)
}

/// Wait up to `timeout_ms` for `fd` to become readable.
#[cfg(unix)]
#[allow(unsafe_code)]
fn wait_readable(fd: std::os::unix::io::RawFd, timeout_ms: i32) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pfd` is a valid pollfd and the count matches.
    match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
        -1 => Err(std::io::Error::last_os_error()),
        0 => Ok(false),
        _ => Ok(true),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Accepted,
    Dropped,
    Closed,
}

fn deliver(tx: &SyncSender<Command>, command: Command, source: &str) -> Delivery {
    match tx.try_send(command) {
        Ok(()) => Delivery::Accepted,
        Err(TrySendError::Full(dropped)) => {
            warn!(source, command = %dropped, "Command dropped; another command is still pending");
            Delivery::Dropped
        }
        Err(TrySendError::Disconnected(_)) => Delivery::Closed,
    }
}
