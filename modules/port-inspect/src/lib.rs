//! Runs an external per-port inspection tool (by default `witr --port N`) and
//! captures what it prints. Every failure mode comes back as a failed
//! [`Diagnosis`], never as a panic or a hung request.

use portledger_core::{LedgerError, Protocol};
use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Captured output is cut at this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

const READER_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub output: String,
    #[serde(rename = "error")]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Diagnosis {
    fn failed(output: impl Into<String>) -> Self {
        Diagnosis { output: output.into(), failed: true, exit_code: None }
    }
}

#[derive(Debug, Clone)]
pub struct Inspector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for Inspector {
    fn default() -> Self {
        Inspector {
            program: "witr".to_string(),
            args: vec!["--port".to_string(), "{port}".to_string()],
            timeout: Duration::from_millis(2000),
        }
    }
}

impl Inspector {
    /// `args` may contain `{port}` and `{protocol}` placeholders.
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Inspector { program: program.into(), args, timeout }
    }

    fn render_args(&self, protocol: Protocol, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()).replace("{protocol}", protocol.as_str()))
            .collect()
    }

    /// Runs the tool once for the tuple. Only a missing configuration is an
    /// error; everything else is reported through `Diagnosis::failed`.
    pub async fn inspect(&self, protocol: Protocol, port: u16) -> Result<Diagnosis, LedgerError> {
        if self.program.trim().is_empty() {
            return Err(LedgerError::Diagnosis("no inspection program configured".to_string()));
        }
        let args = self.render_args(protocol, port);
        tracing::debug!(program = %self.program, ?args, "running inspector");

        let mut child = match Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Diagnosis::failed(format!("Error: '{}' command not found on PATH.", self.program)));
            }
            Err(e) => return Ok(Diagnosis::failed(format!("Execution failed: {e}"))),
        };

        // Drained as the tool writes, so a timeout still leaves what it printed.
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child.stdout.take().map(|r| tokio::spawn(drain(r, stdout.clone()))),
            child.stderr.take().map(|r| tokio::spawn(drain(r, stderr.clone()))),
        ];

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return Ok(Diagnosis::failed(format!("Execution failed: {e}"))),
            Err(_) => {
                tracing::warn!(program = %self.program, port, timeout_ms = self.timeout.as_millis() as u64, "inspector timed out");
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "inspector kill failed");
                }
                None
            }
        };

        // A grandchild may still hold the pipes open; stop reading after a short grace.
        for reader in readers.into_iter().flatten() {
            let mut reader = reader;
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        let mut text = combine(&take(&stdout), &take(&stderr));
        let diagnosis = match status {
            Some(status) => Diagnosis { output: String::new(), failed: !status.success(), exit_code: status.code() },
            None => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&format!(
                    "'{}' timed out after {} ms (it may be interactive).",
                    self.program,
                    self.timeout.as_millis()
                ));
                Diagnosis::failed(String::new())
            }
        };
        truncate_utf8(&mut text, MAX_OUTPUT_BYTES);
        Ok(Diagnosis { output: text, ..diagnosis })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    }
}

fn take(sink: &Mutex<Vec<u8>>) -> Vec<u8> {
    sink.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
}

/// stdout first, then stderr when it has anything to say.
fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_ms: u64) -> Inspector {
        Inspector::new("sh", vec!["-c".into(), script.into()], Duration::from_millis(timeout_ms))
    }

    #[test]
    fn placeholders_are_rendered() {
        let i = Inspector::new("tool", vec!["--port".into(), "{port}".into(), "--proto={protocol}".into()], Duration::from_secs(1));
        assert_eq!(i.render_args(Protocol::Udp, 53), vec!["--port", "53", "--proto=udp"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "ééé".to_string();
        truncate_utf8(&mut s, 3);
        assert_eq!(s, "é");
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let d = sh("echo listening; echo warn >&2", 5000).inspect(Protocol::Tcp, 80).await.unwrap();
        assert!(!d.failed);
        assert_eq!(d.exit_code, Some(0));
        assert!(d.output.contains("listening"));
        assert!(d.output.contains("warn"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_closed() {
        let d = sh("echo nope; exit 3", 5000).inspect(Protocol::Tcp, 80).await.unwrap();
        assert!(d.failed);
        assert_eq!(d.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_fails_closed() {
        let d = sh("sleep 5", 100).inspect(Protocol::Tcp, 80).await.unwrap();
        assert!(d.failed);
        assert_eq!(d.exit_code, None);
        assert!(d.output.contains("timed out"));
    }

    #[tokio::test]
    async fn timeout_keeps_what_the_tool_already_printed() {
        let started = std::time::Instant::now();
        let d = sh("echo PORT-OWNER-nginx; echo partial-warning >&2; sleep 5", 300)
            .inspect(Protocol::Tcp, 80)
            .await
            .unwrap();
        assert!(d.failed);
        assert!(d.output.contains("PORT-OWNER-nginx"), "output was {:?}", d.output);
        assert!(d.output.contains("partial-warning"));
        assert!(d.output.contains("timed out after 300 ms"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_program_fails_closed() {
        let i = Inspector::new("definitely-not-a-real-binary-4242", vec![], Duration::from_secs(1));
        let d = i.inspect(Protocol::Tcp, 80).await.unwrap();
        assert!(d.failed);
        assert!(d.output.contains("not found"));
    }

    #[tokio::test]
    async fn empty_program_is_a_configuration_error() {
        let i = Inspector::new("", vec![], Duration::from_secs(1));
        assert!(matches!(i.inspect(Protocol::Tcp, 80).await, Err(LedgerError::Diagnosis(_))));
    }

    #[test]
    fn serializes_with_error_flag() {
        let v = serde_json::to_value(Diagnosis::failed("boom")).unwrap();
        assert_eq!(v["error"], true);
        assert_eq!(v["output"], "boom");
    }
}
