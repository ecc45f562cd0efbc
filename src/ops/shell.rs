use super::process::{self, OutputLine, OutputStream, StreamEnd};
use crate::error::ConnectionError;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Exit status ssh reserves for its own failures (auth, network).
const SSH_ERROR_EXIT: i32 = 255;
/// sshpass: "invalid/incorrect password".
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;
/// Stderr lines kept from a stream for error reporting.
const STDERR_TAIL: usize = 20;

/// How to reach and authenticate to one host. Exactly one credential kind.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionInfo {
    Key {
        host: String,
        port: u16,
        user: String,
        private_key: String,
        sudo_password: Option<String>,
    },
    Password {
        host: String,
        port: u16,
        user: String,
        password: String,
    },
}

impl ConnectionInfo {
    pub fn host(&self) -> &str {
        match self {
            ConnectionInfo::Key { host, .. } | ConnectionInfo::Password { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ConnectionInfo::Key { port, .. } | ConnectionInfo::Password { port, .. } => *port,
        }
    }

    pub fn user(&self) -> &str {
        match self {
            ConnectionInfo::Key { user, .. } | ConnectionInfo::Password { user, .. } => user,
        }
    }

    /// Password used to elevate with sudo, if any.
    pub fn sudo_password(&self) -> Option<&str> {
        match self {
            ConnectionInfo::Key { sudo_password, .. } => sudo_password.as_deref(),
            ConnectionInfo::Password { password, .. } => Some(password),
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user(), self.host())
    }
}

// Never print credentials.
impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionInfo::Key {
                host,
                port,
                user,
                sudo_password,
                ..
            } => f
                .debug_struct("Key")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("private_key", &"<redacted>")
                .field("sudo_password", &sudo_password.as_ref().map(|_| "<redacted>"))
                .finish(),
            ConnectionInfo::Password {
                host, port, user, ..
            } => f
                .debug_struct("Password")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Buffered result of a remote command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `CommandNonZeroExit`.
    pub fn checked(self, host: &str, command: &str) -> Result<Self, ConnectionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ConnectionError::CommandNonZeroExit {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// An ssh (or sshpass) command plus the key file it reads.
struct SshInvocation {
    command: Command,
    key_file: Option<NamedTempFile>,
}

pub struct Shell;

impl Shell {
    /// Run a command and buffer its output. Never hangs past `timeout`.
    pub async fn exec(
        info: &ConnectionInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ConnectionError> {
        Self::run(info, command, None, timeout).await
    }

    /// `exec`, with a non-zero exit reported as an error.
    pub async fn exec_checked(
        info: &ConnectionInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ConnectionError> {
        Self::exec(info, command, timeout)
            .await?
            .checked(info.host(), command)
    }

    /// Run a command through sudo, feeding the sudo password on stdin when known.
    pub async fn exec_privileged(
        info: &ConnectionInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ConnectionError> {
        let quoted = process::shell_quote(command);
        match info.sudo_password() {
            Some(password) => {
                let wrapped = format!("sudo -S -p '' sh -c {}", quoted);
                let input = format!("{}\n", password);
                Self::run(info, &wrapped, Some(input.as_bytes()), timeout).await
            }
            None => {
                let wrapped = format!("sudo -n sh -c {}", quoted);
                Self::run(info, &wrapped, None, timeout).await
            }
        }
    }

    /// Stream a long-running command line by line until it exits.
    pub fn exec_stream(
        info: &ConnectionInfo,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<OutputStream, ConnectionError> {
        let mut invocation = ssh_command(info, None, false)?;
        invocation.command.arg(command);
        let program = program_name(info);
        process::spawn_stream(invocation.command, cancel, invocation.key_file).map_err(|source| {
            ConnectionError::Spawn {
                program: program.to_string(),
                source,
            }
        })
    }

    /// `exec_stream`, forwarding every line and mapping the exit into a result.
    pub async fn stream_checked<F>(
        info: &ConnectionInfo,
        command: &str,
        cancel: CancellationToken,
        mut on_line: F,
    ) -> Result<(), ConnectionError>
    where
        F: FnMut(OutputLine),
    {
        let stream = Self::exec_stream(info, command, cancel)?;
        let mut stderr_tail: Vec<String> = Vec::new();
        let end = stream
            .forward(|line| {
                if let OutputLine::Stderr(text) = &line {
                    if stderr_tail.len() == STDERR_TAIL {
                        stderr_tail.remove(0);
                    }
                    stderr_tail.push(text.clone());
                }
                on_line(line);
            })
            .await;

        match end {
            StreamEnd::Exited(0) => Ok(()),
            StreamEnd::Exited(code) => Err(classify_exit(info, command, code, &stderr_tail.join("\n"))),
            StreamEnd::Cancelled => Err(ConnectionError::Cancelled {
                host: info.host().to_string(),
                command: command.to_string(),
            }),
        }
    }

    /// Stream a local file into a remote command's stdin (`docker load`, `cat > file`).
    pub async fn pipe_file(
        info: &ConnectionInfo,
        local_path: &Path,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ConnectionError> {
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|source| ConnectionError::Io {
                host: info.host().to_string(),
                source,
            })?;
        Self::pipe_reader(info, file, command, cancel).await
    }

    /// Feed `bytes` to a remote command's stdin. Keeps secrets out of argv.
    pub async fn pipe_bytes(
        info: &ConnectionInfo,
        bytes: &[u8],
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ConnectionError> {
        Self::pipe_reader(info, bytes, command, cancel).await
    }

    async fn pipe_reader<R>(
        info: &ConnectionInfo,
        mut source: R,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let host = info.host().to_string();
        let io_err = |source| ConnectionError::Io {
            host: host.clone(),
            source,
        };

        let mut invocation = ssh_command(info, None, false)?;
        invocation
            .command
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = invocation
            .command
            .spawn()
            .map_err(|source| ConnectionError::Spawn {
                program: program_name(info).to_string(),
                source,
            })?;

        let cancelled = || ConnectionError::Cancelled {
            host: host.clone(),
            command: command.to_string(),
        };

        if let Some(mut stdin) = child.stdin.take() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                copied = tokio::io::copy(&mut source, &mut stdin) => {
                    // A broken pipe means the remote side exited early; its status says why.
                    if let Err(e) = copied {
                        tracing::debug!(host = %host, "stdin closed early: {}", e);
                    }
                }
            }
            let _ = stdin.shutdown().await;
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            output = child.wait_with_output() => output.map_err(io_err)?,
        };
        drop(invocation.key_file);
        finish(info, command, output)
    }

    /// Interactive session with inherited stdio. Returns the remote exit code.
    pub async fn shell(info: &ConnectionInfo) -> Result<i32, ConnectionError> {
        let mut invocation = ssh_command(info, None, true)?;
        let status = invocation
            .command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| ConnectionError::Spawn {
                program: program_name(info).to_string(),
                source,
            })?;
        drop(invocation.key_file);
        Ok(status.code().unwrap_or(-1))
    }

    /// Best-effort reachability probe.
    pub async fn test_connection(info: &ConnectionInfo, timeout: Duration) -> bool {
        match Self::exec(info, "true", timeout).await {
            Ok(result) => result.success(),
            Err(e) => {
                tracing::debug!(host = %info.host(), "Connection probe failed: {}", e);
                false
            }
        }
    }

    async fn run(
        info: &ConnectionInfo,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ExecResult, ConnectionError> {
        let mut invocation = ssh_command(info, Some(timeout), false)?;
        invocation.command.arg(command);
        let output = run_with_timeout(
            invocation.command,
            program_name(info),
            info.host(),
            command,
            input,
            timeout,
        )
        .await?;
        drop(invocation.key_file);
        finish(info, command, output)
    }
}

/// Spawn `child_command`, feed it `input`, and collect its output. The child
/// is killed once `timeout` passes.
async fn run_with_timeout(
    mut child_command: Command,
    program: &str,
    host: &str,
    command: &str,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<std::process::Output, ConnectionError> {
    child_command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = child_command
        .spawn()
        .map_err(|source| ConnectionError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let work = async move {
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    // Dropping `work` on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, work).await {
        Ok(output) => output.map_err(|source| ConnectionError::Io {
            host: host.to_string(),
            source,
        }),
        Err(_) => Err(ConnectionError::Timeout {
            host: host.to_string(),
            command: command.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

fn finish(
    info: &ConnectionInfo,
    command: &str,
    output: std::process::Output,
) -> Result<ExecResult, ConnectionError> {
    let result = ExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };
    if is_transport_failure(info, result.exit_code) {
        return Err(classify_exit(info, command, result.exit_code, &result.stderr));
    }
    Ok(result)
}

fn is_transport_failure(info: &ConnectionInfo, exit_code: i32) -> bool {
    exit_code == SSH_ERROR_EXIT
        || (matches!(info, ConnectionInfo::Password { .. })
            && exit_code == SSHPASS_BAD_PASSWORD_EXIT)
}

/// Map a failed exit into the connection error taxonomy.
pub fn classify_exit(
    info: &ConnectionInfo,
    command: &str,
    exit_code: i32,
    stderr: &str,
) -> ConnectionError {
    let detail = stderr.trim().to_string();
    if is_transport_failure(info, exit_code) {
        let lowered = detail.to_lowercase();
        let auth_failed = exit_code == SSHPASS_BAD_PASSWORD_EXIT
            || lowered.contains("permission denied")
            || lowered.contains("authentication failed")
            || lowered.contains("too many authentication failures");
        if auth_failed {
            return ConnectionError::AuthenticationFailed {
                host: info.host().to_string(),
                user: info.user().to_string(),
                detail,
            };
        }
        if lowered.contains("timed out") {
            return ConnectionError::Timeout {
                host: info.host().to_string(),
                command: command.to_string(),
                secs: 0,
            };
        }
        return ConnectionError::HostUnreachable {
            host: info.host().to_string(),
            detail,
        };
    }
    ConnectionError::CommandNonZeroExit {
        host: info.host().to_string(),
        command: command.to_string(),
        exit_code,
        stderr: detail,
    }
}

fn program_name(info: &ConnectionInfo) -> &'static str {
    match info {
        ConnectionInfo::Key { .. } => "ssh",
        ConnectionInfo::Password { .. } => "sshpass",
    }
}

fn ssh_command(
    info: &ConnectionInfo,
    connect_timeout: Option<Duration>,
    tty: bool,
) -> Result<SshInvocation, ConnectionError> {
    let (mut command, key_file) = match info {
        ConnectionInfo::Key { private_key, .. } => {
            let key_file = write_key_file(info.host(), private_key)?;
            let mut command = Command::new("ssh");
            command
                .arg("-i")
                .arg(key_file.path())
                .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
            (command, Some(key_file))
        }
        ConnectionInfo::Password { password, .. } => {
            // sshpass reads SSHPASS so the password never shows up in argv.
            let mut command = Command::new("sshpass");
            command.env("SSHPASS", password).args(["-e", "ssh"]).args([
                "-o",
                "PreferredAuthentications=password,keyboard-interactive",
                "-o",
                "PubkeyAuthentication=no",
            ]);
            (command, None)
        }
    };

    command
        .arg("-p")
        .arg(info.port().to_string())
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]);
    if let Some(timeout) = connect_timeout {
        command
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
    }
    if tty {
        command.arg("-t");
    }
    command.arg(info.target());

    Ok(SshInvocation { command, key_file })
}

// Blocking, but a few hundred bytes into a local temp file; `exec_stream`
// needs it from sync code.
fn write_key_file(host: &str, private_key: &str) -> Result<NamedTempFile, ConnectionError> {
    let io_err = |source| ConnectionError::Io {
        host: host.to_string(),
        source,
    };
    // tempfile creates the file with 0600 permissions.
    let mut file = NamedTempFile::new().map_err(io_err)?;
    file.write_all(normalize_private_key(private_key).as_bytes())
        .map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(file)
}

/// Keys from CI secrets often arrive with literal `\n` or CRLF line endings.
pub fn normalize_private_key(key: &str) -> String {
    let normalized = key.replace("\\n", "\n").replace("\r\n", "\n");
    format!("{}\n", normalized.trim())
}
