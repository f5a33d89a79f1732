use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

/// Something observed on a child process. `Exited` is always the last event
/// and is only sent once both output streams are drained.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
}

/// How to launch a process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// A java server run from `dir/<jar>` with a fixed heap.
    pub fn java(java_path: &Path, jar: &str, memory_mb: u32, dir: &Path) -> Self {
        Self {
            program: java_path.to_path_buf(),
            args: vec![
                format!("-Xmx{}M", memory_mb),
                format!("-Xms{}M", memory_mb),
                "-jar".to_string(),
                jar.to_string(),
                "nogui".to_string(),
            ],
            working_dir: dir.to_path_buf(),
        }
    }
}

/// Handle to a spawned child. Output and exit arrive on the receiver returned
/// by [`ServerProcess::spawn`]; dropping the handle does not kill the child.
pub struct ServerProcess {
    pid: u32,
    stdin_tx: mpsc::UnboundedSender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ServerProcess {
    pub fn spawn(spec: &LaunchSpec) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>)> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", spec.program))?;

        let pid = child.id().context("Failed to get process ID")?;

        // Set up stdin channel
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let mut stdin = child.stdin.take().context("Failed to get stdin")?;

        tokio::spawn(async move {
            while let Some(command) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(format!("{}\n", command).as_bytes()).await {
                    tracing::error!("Failed to write to process stdin: {}", e);
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, events_tx.clone(), ProcessEvent::Stdout));
        let stderr_task = tokio::spawn(forward_lines(stderr, events_tx.clone(), ProcessEvent::Stderr));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill process {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!("Failed to wait for process {}: {}", pid, e);
                    None
                }
            };
            let _ = events_tx.send(ProcessEvent::Exited(code));
        });

        Ok((
            Self {
                pid,
                stdin_tx,
                kill_tx: Some(kill_tx),
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn send_command(&self, command: impl Into<String>) -> Result<()> {
        self.stdin_tx
            .send(command.into())
            .context("Failed to send command to process")
    }

    /// Asks a Minecraft server to shut down gracefully.
    pub fn stop(&self) -> Result<()> {
        self.send_command("stop")
    }

    /// Forcefully terminates the child. Only the proxy is ever killed this way.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn forward_lines<R>(
    stream: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let reader = BufReader::new(stream);
    let mut lines = LinesStream::new(reader.lines());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if tx.send(wrap(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Stopped reading process output: {}", e);
                break;
            }
        }
    }
}

/// Kills leftover processes from a previous run whose command line contains
/// every fragment of `signature`. Returns how many were killed.
pub fn reap_orphans(signature: &[&str]) -> usize {
    let mut system = System::new_all();
    system.refresh_all();

    let own_pid = std::process::id();
    let mut killed = 0;
    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if !signature.iter().all(|fragment| cmdline.contains(fragment)) {
            continue;
        }
        if process.kill() {
            tracing::info!("Killed orphaned process {} ({})", pid, cmdline);
            killed += 1;
        } else {
            tracing::warn!("Failed to kill orphaned process {}", pid);
        }
    }
    killed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn output_then_exit_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_process, mut rx) =
            ServerProcess::spawn(&sh("echo one; echo two; echo oops >&2; exit 3", dir.path())).unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.last(), Some(&ProcessEvent::Exited(Some(3))));
        let stdout: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stdout(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(events.contains(&ProcessEvent::Stderr("oops".to_string())));
    }

    #[tokio::test]
    async fn stop_command_reaches_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"while read line; do echo "got $line"; [ "$line" = stop ] && exit 0; done"#;
        let (process, mut rx) = ServerProcess::spawn(&sh(script, dir.path())).unwrap();

        process.stop().unwrap();

        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("got stop".to_string())));
        assert_eq!(rx.recv().await, Some(ProcessEvent::Exited(Some(0))));
    }

    #[tokio::test]
    async fn kill_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let (mut process, mut rx) = ServerProcess::spawn(&sh("exec sleep 30", dir.path())).unwrap();

        process.kill();

        match rx.recv().await {
            Some(ProcessEvent::Exited(code)) => assert_ne!(code, Some(0)),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
