//! Line-by-line streaming of child process output.
//!
//! Both local builds and remote ssh sessions go through [`spawn_stream`]: the
//! producer task owns the child until it exits, the consumer reads an ordered,
//! finite sequence of lines that ends with exactly one terminal event.

use futures::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lines buffered before the producer blocks on the consumer.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Line(OutputLine),
    /// Terminal: the process exited with this code (-1 when killed by a signal).
    Exit(i32),
    /// Terminal: the process was killed because the token was cancelled.
    Cancelled,
}

/// How a stream ended, once fully consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Exited(i32),
    Cancelled,
}

impl StreamEnd {
    pub fn success(&self) -> bool {
        matches!(self, StreamEnd::Exited(0))
    }
}

pub struct OutputStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl OutputStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream, handing every line to `on_line` in order.
    pub async fn forward<F>(mut self, mut on_line: F) -> StreamEnd
    where
        F: FnMut(OutputLine),
    {
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Line(line) => on_line(line),
                StreamEvent::Exit(code) => return StreamEnd::Exited(code),
                StreamEvent::Cancelled => return StreamEnd::Cancelled,
            }
        }
        // Producer vanished without a terminal event (runtime shutdown).
        StreamEnd::Exited(-1)
    }
}

impl Stream for OutputStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Spawn `command` and stream its output.
///
/// `guard` is kept alive until the child exits (e.g. a temporary key file).
pub fn spawn_stream<G>(
    mut command: Command,
    cancel: CancellationToken,
    guard: G,
) -> std::io::Result<OutputStream>
where
    G: Send + 'static,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        let _guard = guard;
        let mut out = stdout.map(|s| LineReader::new(BufReader::new(s)));
        let mut err = stderr.map(|s| LineReader::new(BufReader::new(s)));

        while out.is_some() || err.is_some() {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = tx.send(StreamEvent::Cancelled).await;
                    return;
                }
                line = next_line(&mut out), if out.is_some() => match line {
                    Some(l) => StreamEvent::Line(OutputLine::Stdout(l)),
                    None => { out = None; continue; }
                },
                line = next_line(&mut err), if err.is_some() => match line {
                    Some(l) => StreamEvent::Line(OutputLine::Stderr(l)),
                    None => { err = None; continue; }
                },
            };
            if tx.send(event).await.is_err() {
                // Consumer went away; nobody will read the rest.
                let _ = child.kill().await;
                return;
            }
        }

        let terminal = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                StreamEvent::Cancelled
            }
            status = child.wait() => match status {
                Ok(status) => StreamEvent::Exit(status.code().unwrap_or(-1)),
                Err(e) => {
                    tracing::warn!("Failed to wait for child: {}", e);
                    StreamEvent::Exit(-1)
                }
            },
        };
        let _ = tx.send(terminal).await;
    });

    Ok(OutputStream { rx })
}

/// Newline-delimited reader that survives bytes which are not UTF-8.
///
/// Partial lines stay in `buf` across calls, so a read dropped by `select!`
/// resumes where it stopped.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// The next line without its terminator, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

async fn next_line<R>(reader: &mut Option<LineReader<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match reader {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read child output: {}", e);
                None
            }
        },
        None => None,
    }
}

/// `sh -c <script>` for local commands.
pub fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_orders_lines_and_ends_with_exit_code() {
        let stream = spawn_stream(
            shell_command("echo one; echo two; echo oops 1>&2; exit 3"),
            CancellationToken::new(),
            (),
        )
        .unwrap();

        let events: Vec<StreamEvent> = stream.collect().await;
        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Line(OutputLine::Stdout(l)) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(events.contains(&StreamEvent::Line(OutputLine::Stderr("oops".into()))));
        assert_eq!(events.last(), Some(&StreamEvent::Exit(3)));
    }

    #[tokio::test]
    async fn test_cancel_kills_child_and_reports_cancelled() {
        let cancel = CancellationToken::new();
        let stream = spawn_stream(
            shell_command("echo started; sleep 30; echo never"),
            cancel.clone(),
            (),
        )
        .unwrap();

        let mut seen = Vec::new();
        let canceller = cancel.clone();
        let end = tokio::time::timeout(
            Duration::from_secs(10),
            stream.forward(|line| {
                seen.push(line.text().to_string());
                canceller.cancel();
            }),
        )
        .await
        .expect("cancelled stream must terminate");

        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(seen, vec!["started"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_stream() {
        let stream = spawn_stream(
            shell_command("printf 'first\\n\\377\\n'; seq 1 20000; echo last; exit 0"),
            CancellationToken::new(),
            (),
        )
        .unwrap();

        let mut stdout = Vec::new();
        let end = tokio::time::timeout(
            Duration::from_secs(30),
            stream.forward(|line| {
                if let OutputLine::Stdout(text) = line {
                    stdout.push(text);
                }
            }),
        )
        .await
        .expect("stream must reach the child's exit");

        assert_eq!(end, StreamEnd::Exited(0));
        assert_eq!(stdout.len(), 20003);
        assert_eq!(stdout[0], "first");
        assert_eq!(stdout[1], "\u{FFFD}");
        assert_eq!(stdout[2], "1");
        assert_eq!(stdout.last().map(String::as_str), Some("last"));
    }

    #[tokio::test]
    async fn test_line_reader_keeps_unterminated_tail() {
        let mut reader = LineReader::new(&b"a\r\nb\n\ntail"[..]);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["a", "b", "", "tail"]);
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
