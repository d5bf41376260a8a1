//! Duplex line transport to the player process.
//!
//! One command per line goes to the child's stdin; status lines are read one
//! at a time by whoever owns the [`LineReader`]. The child's stdout and stderr
//! share a single pipe, so error text shows up in the same stream.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn player process '{executable}': {source}")]
    Spawn {
        executable: String,
        source: io::Error,
    },
    #[error("player process has no stdin")]
    NoStdin,
    #[error("player process has no stdout")]
    NoStdout,
    #[error("failed to write to player: {0}")]
    Write(io::Error),
    #[error("failed to wait for player process: {0}")]
    Wait(io::Error),
    #[error("player process did not exit within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Result of a blocking line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    EndOfStream,
}

/// Reading half of a channel.
pub struct LineReader {
    inner: Box<dyn BufRead + Send>,
    decode_errors: Arc<AtomicU64>,
}

impl LineReader {
    pub fn new(inner: impl BufRead + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            decode_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of lines skipped because they were not valid UTF-8.
    pub fn decode_errors(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.decode_errors)
    }

    /// Block until a full line is available. The trailing newline is
    /// stripped; undecodable lines are counted and skipped.
    pub fn read_line(&mut self) -> ReadOutcome {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.inner.read_until(b'\n', &mut buf) {
                Ok(0) => return ReadOutcome::EndOfStream,
                Ok(_) => match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(mut line) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']).len();
                        line.truncate(trimmed);
                        return ReadOutcome::Line(line);
                    }
                    Err(err) => {
                        let count = self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(
                            error = %err.utf8_error(),
                            skipped = count,
                            "skipping undecodable player output line"
                        );
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(error = %err, "player output read failed; treating as closed");
                    return ReadOutcome::EndOfStream;
                }
            }
        }
    }
}

/// Owned handle on the player process and its stdin.
pub struct LineChannel {
    child: Option<Child>,
    stdin: Box<dyn Write + Send>,
    reader: Option<LineReader>,
    terminated: bool,
}

impl LineChannel {
    /// Start `executable` with a piped stdin and stdout and stderr merged
    /// into one output pipe.
    pub fn spawn(executable: &str, args: &[String]) -> Result<Self, ChannelError> {
        tracing::info!(executable, ?args, "starting player process");
        let spawn_error = |source: io::Error| ChannelError::Spawn {
            executable: executable.to_string(),
            source,
        };
        let (output, stdout) = io::pipe().map_err(spawn_error)?;
        let stderr = stdout.try_clone().map_err(spawn_error)?;

        // The Command holds the only copies of the write end; once it is
        // dropped the reader sees end of stream when the child exits.
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(spawn_error)?;

        let stdin = child.stdin.take().ok_or(ChannelError::NoStdin)?;
        tracing::debug!(pid = child.id(), "player process started");

        Ok(Self {
            child: Some(child),
            stdin: Box::new(stdin),
            reader: Some(LineReader::new(BufReader::new(output))),
            terminated: false,
        })
    }

    /// Build a channel over arbitrary streams, without a process behind it.
    pub fn from_streams(
        writer: impl Write + Send + 'static,
        reader: impl BufRead + Send + 'static,
    ) -> Self {
        Self {
            child: None,
            stdin: Box::new(writer),
            reader: Some(LineReader::new(reader)),
            terminated: false,
        }
    }

    /// Hand the reading half to the read loop. Only the first call succeeds.
    pub fn take_reader(&mut self) -> Option<LineReader> {
        self.reader.take()
    }

    /// Write `text` followed by a newline and flush.
    pub fn write_line(&mut self, text: &str) -> Result<(), ChannelError> {
        writeln!(self.stdin, "{}", text).map_err(ChannelError::Write)?;
        self.stdin.flush().map_err(ChannelError::Write)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => !self.terminated,
        }
    }

    /// Send `QUIT` and wait up to `grace` for the process to exit. The
    /// process is never killed; a timeout is returned for the caller to
    /// report.
    pub fn terminate(&mut self, grace: Duration) -> Result<(), ChannelError> {
        if let Err(err) = self.write_line("QUIT") {
            tracing::debug!(error = %err, "QUIT not delivered; player input already closed");
        }
        self.terminated = true;

        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = child.try_wait().map_err(ChannelError::Wait)? {
                tracing::info!(%status, "player process exited");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::ShutdownTimeout(grace));
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reader_strips_newlines_and_reports_end() {
        let mut reader = LineReader::new(Cursor::new(b"@P 2\r\n@SAMPLE 1 2\n@J".to_vec()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("@P 2".into()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("@SAMPLE 1 2".into()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("@J".into()));
        assert_eq!(reader.read_line(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn undecodable_lines_are_skipped_and_counted() {
        let mut input = b"@I ICY-NAME: ok\n".to_vec();
        input.extend_from_slice(b"@I ICY-META: StreamTitle='\xff\xfe';\n");
        input.extend_from_slice(b"@P 0\n");
        let mut reader = LineReader::new(Cursor::new(input));
        let counter = reader.decode_errors();

        assert_eq!(reader.read_line(), ReadOutcome::Line("@I ICY-NAME: ok".into()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("@P 0".into()));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn write_line_appends_newline() {
        #[derive(Clone, Default)]
        struct Shared(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = Shared::default();
        let mut channel = LineChannel::from_streams(sink.clone(), Cursor::new(Vec::new()));
        channel.write_line("LOAD a.mp3").unwrap();
        assert!(channel.is_running());
        channel.terminate(Duration::from_millis(10)).unwrap();
        assert!(!channel.is_running());
        assert_eq!(sink.0.lock().as_slice(), b"LOAD a.mp3\nQUIT\n");
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let err = LineChannel::spawn("/nonexistent/webradio-player-binary", &[])
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, ChannelError::Spawn { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn terminate_waits_for_quit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"#!/bin/sh
echo "@R MPG123 (fake)"
while IFS= read -r line; do
    [ "$line" = "QUIT" ] && exit 0
done
"#
        )
        .unwrap();
        file.flush().unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let script = file.into_temp_path();

        let mut channel = LineChannel::spawn(script.to_str().unwrap(), &[]).expect("spawn");
        let mut reader = channel.take_reader().expect("reader available once");
        assert!(channel.take_reader().is_none());
        assert_eq!(reader.read_line(), ReadOutcome::Line("@R MPG123 (fake)".into()));

        channel.terminate(Duration::from_secs(5)).expect("script exits on QUIT");
        assert!(!channel.is_running());
        assert_eq!(reader.read_line(), ReadOutcome::EndOfStream);
    }

    #[test]
    #[cfg(unix)]
    fn stderr_arrives_on_the_output_stream() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"#!/bin/sh
echo "@R MPG123 (fake)"
echo "[decoder] bad frame" >&2
echo "@P 0"
"#
        )
        .unwrap();
        file.flush().unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let script = file.into_temp_path();

        let mut channel = LineChannel::spawn(script.to_str().unwrap(), &[]).expect("spawn");
        let mut reader = channel.take_reader().expect("reader");
        assert_eq!(reader.read_line(), ReadOutcome::Line("@R MPG123 (fake)".into()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("[decoder] bad frame".into()));
        assert_eq!(reader.read_line(), ReadOutcome::Line("@P 0".into()));
        assert_eq!(reader.read_line(), ReadOutcome::EndOfStream);
    }
}
