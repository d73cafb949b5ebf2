use std::env;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives process output incrementally, for display only.
pub trait OutputSink: Send + Sync {
    fn on_output(&self, stream: OutputStream, text: &str);
}

/// Writes streamed output straight to the terminal.
pub struct TerminalSink;

impl OutputSink for TerminalSink {
    fn on_output(&self, stream: OutputStream, text: &str) {
        use std::io::Write;
        match stream {
            OutputStream::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            OutputStream::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(text.as_bytes());
                let _ = err.flush();
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr first, then stdout, separated by a blank line.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}", self.stderr, self.stdout)
    }
}

/// Spawns `program` with `args`, streams both pipes to `sink` as they arrive,
/// and resolves once the process has exited. A non-zero exit is reported in
/// the result, never as an error.
pub async fn run_process(
    program: &str,
    args: &[String],
    sink: Option<&dyn OutputSink>,
) -> io::Result<ProcessOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let (stdout, stderr) = tokio::join!(
        pump(stdout, OutputStream::Stdout, sink),
        pump(stderr, OutputStream::Stderr, sink)
    );
    let status = child.wait().await?;

    Ok(ProcessOutput {
        stdout: stdout?,
        stderr: stderr?,
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Like [`run_process`] but gives up after `timeout`; used for environment
/// probes that must fail fast.
pub async fn run_process_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> io::Result<ProcessOutput> {
    match tokio::time::timeout(timeout, run_process(program, args, None)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("`{program}` timed out after {}s", timeout.as_secs()),
        )),
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, sink: Option<&dyn OutputSink>) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buffer = [0_u8; 8 * 1024];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        if let Some(sink) = sink {
            sink.on_output(stream, &String::from_utf8_lossy(&buffer[..read]));
        }
        collected.extend_from_slice(&buffer[..read]);
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// Resolves an executable name against `PATH`.
pub fn which(bin: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(bin);
    if candidate.is_absolute() || bin.contains('/') || bin.contains('\\') {
        return candidate.is_file().then_some(candidate);
    }
    let path_env = env::var_os("PATH")?;
    for directory in env::split_paths(&path_env) {
        if cfg!(windows) {
            for ext in ["", ".exe", ".cmd", ".bat"] {
                let candidate = directory.join(format!("{bin}{ext}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        } else {
            let candidate = directory.join(bin);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Splits a shell-like command line into argv, honouring single quotes,
/// double quotes and backslash escapes (outside single quotes).
pub fn split_command_line(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escape_next = false;

    for c in line.chars() {
        if escape_next {
            current.push(c);
            has_token = true;
            escape_next = false;
        } else if c == '\\' && !in_single {
            escape_next = true;
        } else if c == '\'' && !in_double {
            in_single = !in_single;
            has_token = true;
        } else if c == '"' && !in_single {
            in_double = !in_double;
            has_token = true;
        } else if c.is_whitespace() && !in_single && !in_double {
            if has_token {
                args.push(std::mem::take(&mut current));
                has_token = false;
            }
        } else {
            current.push(c);
            has_token = true;
        }
    }

    if escape_next {
        return Err("command line ends with a single backslash".to_owned());
    }
    if in_single || in_double {
        return Err("command line has mismatched quotes".to_owned());
    }
    if has_token {
        args.push(current);
    }
    if args.is_empty() {
        return Err("no command found".to_owned());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<(OutputStream, String)>>,
    }

    impl OutputSink for CollectingSink {
        fn on_output(&self, stream: OutputStream, text: &str) {
            self.chunks
                .lock()
                .expect("sink lock")
                .push((stream, text.to_owned()));
        }
    }

    #[test]
    fn split_command_line_handles_quotes_and_escapes() {
        assert_eq!(
            split_command_line("ls -al 'my dir' \"x y\" a\\ b").expect("split"),
            vec!["ls", "-al", "my dir", "x y", "a b"]
        );
        assert_eq!(
            split_command_line("echo ''").expect("empty arg"),
            vec!["echo", ""]
        );
        assert!(split_command_line("echo 'open").is_err());
        assert!(split_command_line("echo \\").is_err());
        assert!(split_command_line("   ").is_err());
    }

    #[test]
    fn combined_output_puts_stderr_first() {
        let output = ProcessOutput {
            stdout: "out".to_owned(),
            stderr: "err".to_owned(),
            exit_code: 0,
        };
        assert_eq!(output.combined(), "err\n\nout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_process_streams_output_and_reports_exit_code() {
        let sink = CollectingSink::default();
        let args = vec![
            "-c".to_owned(),
            "echo hello; echo oops 1>&2; exit 3".to_owned(),
        ];
        let output = run_process("sh", &args, Some(&sink))
            .await
            .expect("spawn sh");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");

        let chunks = sink.chunks.lock().expect("sink lock");
        assert!(chunks
            .iter()
            .any(|(stream, text)| *stream == OutputStream::Stdout && text.contains("hello")));
        assert!(chunks
            .iter()
            .any(|(stream, text)| *stream == OutputStream::Stderr && text.contains("oops")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_process_with_timeout_fails_fast() {
        let args = vec!["-c".to_owned(), "sleep 5".to_owned()];
        let err = run_process_with_timeout("sh", &args, Duration::from_millis(100))
            .await
            .expect_err("timeout");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn run_process_reports_missing_program_as_error() {
        let result = run_process("/definitely/not/a/real/binary", &[], None).await;
        assert!(result.is_err());
    }
}
