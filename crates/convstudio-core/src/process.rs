//! Child process plumbing: spawning, line pumps and termination

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};

/// Longest line kept from a child; longer lines are replaced by a truncation notice
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Bytes of an over-long line quoted in its truncation notice
const TRUNCATED_PREVIEW_BYTES: usize = 256;

/// Everything needed to launch one attempt
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

pub fn spawn_child(spec: &SpawnSpec) -> std::io::Result<Child> {
    let (program, args) = spec.argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    // Own process group so termination reaches grandchildren too
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Line pump tasks of one child; aborted when dropped
pub struct Pumps {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Pumps {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Start reading the child's stdout and stderr into `tx`.
///
/// The channel closes once both streams reach end of file.
pub fn spawn_pumps(child: &mut Child, tx: mpsc::Sender<OutputLine>) -> Pumps {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        handles.push(tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(tokio::spawn(pump(stderr, OutputStream::Stderr, tx)));
    }
    Pumps { handles }
}

enum Frame {
    Line(Bytes),
    /// Start of a line longer than `MAX_LINE_BYTES`; the rest is skipped
    Truncated(String),
}

/// Newline framing that survives over-long lines.
///
/// After `MaxChunkLengthExceeded` the inner codec discards up to the next
/// newline on its own; the error is turned into a frame so `FramedRead` keeps
/// going instead of ending the stream.
struct LineCodec {
    inner: AnyDelimiterCodec,
}

impl LineCodec {
    fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                Vec::new(),
                MAX_LINE_BYTES,
            ),
        }
    }

    fn frame(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
        buf: &BytesMut,
    ) -> std::io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                let end = buf.len().min(TRUNCATED_PREVIEW_BYTES);
                Ok(Some(Frame::Truncated(
                    String::from_utf8_lossy(&buf[..end]).into_owned(),
                )))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let result = self.inner.decode(buf);
        Self::frame(result, buf)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let result = self.inner.decode_eof(buf);
        Self::frame(result, buf)
    }
}

async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LineCodec::new());

    while let Some(frame) = lines.next().await {
        let text = match frame {
            Ok(Frame::Line(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                let text = text.trim_end_matches('\r');
                if text.trim().is_empty() {
                    continue;
                }
                text.to_string()
            }
            Ok(Frame::Truncated(preview)) => {
                tracing::warn!(
                    "Child {:?} wrote a line over {} bytes, truncating it",
                    stream,
                    MAX_LINE_BYTES
                );
                format!(
                    "{}... [line truncated, longer than {} bytes]",
                    preview.trim_end(),
                    MAX_LINE_BYTES
                )
            }
            Err(e) => {
                tracing::warn!("Failed to read child {:?}: {}", stream, e);
                return;
            }
        };
        if tx.send(OutputLine { stream, text }).await.is_err() {
            return;
        }
    }
}

/// Stop a child: SIGTERM to its process group, then SIGKILL after `grace`
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                "Child {:?} ignored SIGTERM for {:?}, killing",
                child.id(),
                grace
            );
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
            }
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        tracing::debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
    }
}

/// Exit code and terminating signal of a finished child
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

/// Human readable explanation of an exit code
pub fn exit_message(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(1), _) => "The agent exited with an error. Check its arguments and configuration.".to_string(),
        (Some(2), _) => "The agent could not access a required file or directory.".to_string(),
        (Some(126), _) => "Permission denied while starting the agent.".to_string(),
        (Some(127), _) => "Agent command not found. Is it installed and on PATH?".to_string(),
        (Some(130), _) | (None, Some(2)) => "The agent was interrupted.".to_string(),
        (Some(137), _) | (None, Some(9)) => {
            "The agent was killed, possibly because it ran out of memory.".to_string()
        }
        (Some(code), _) => format!("The agent exited with code {}.", code),
        (None, Some(signal)) => format!("The agent was terminated by signal {}.", signal),
        (None, None) => "The agent exited with an unknown status.".to_string(),
    }
}

/// Friendly message for a spawn failure
pub fn spawn_message(program: &str, err: &std::io::Error) -> String {
    match err.kind() {
        std::io::ErrorKind::NotFound => format!("Command not found: {}", program),
        std::io::ErrorKind::PermissionDenied => format!("Permission denied running {}", program),
        _ => format!("Failed to start {}: {}", program, err),
    }
}

/// Bounded buffer of the most recent lines
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
