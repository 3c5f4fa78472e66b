//! Spawns job programs and feeds their output into the registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::LaunchError;
use crate::process::ProcessHandle;
use crate::registry::Registry;

pub const STDERR_PREFIX: &str = "[stderr] ";
/// How long output may keep arriving after the job itself has exited.
const PIPE_DRAIN_WITHIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Start `spec` for an already-created run. The task resolves once the run is finalized.
pub fn launch(registry: Arc<Registry>, run_id: String, spec: JobSpec) -> JoinHandle<()> {
    tokio::spawn(async move { supervise(registry, run_id, spec).await })
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.program.trim().is_empty() {
            return Err(LaunchError::EmptyProgram);
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        // own group, so a stop reaches grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

async fn supervise(registry: Arc<Registry>, run_id: String, spec: JobSpec) {
    let spawned = spec.validate().and_then(|()| {
        spec.command()
            .spawn()
            .map_err(|source| LaunchError::Spawn { program: spec.program.clone(), source })
    });
    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(run_id = %run_id, program = %spec.program, error = %e, "spawn failed");
            registry.error(&run_id, &e.to_string());
            return;
        }
    };

    if let Some(pid) = child.id() {
        let pgid = cfg!(unix).then_some(pid);
        registry.attach_process(&run_id, ProcessHandle { pid, pgid });
        tracing::info!(run_id = %run_id, pid, program = %spec.program, "job started");
    }

    let stdout = child.stdout.take().map(|s| tokio::spawn(pump(registry.clone(), run_id.clone(), s, "")));
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(pump(registry.clone(), run_id.clone(), s, STDERR_PREFIX)));

    let status = child.wait().await;
    // every line the job wrote comes before its exit, unless a leftover
    // background process keeps the pipes open
    let mut pumps: Vec<JoinHandle<()>> = [stdout, stderr].into_iter().flatten().collect();
    let drained = tokio::time::timeout(PIPE_DRAIN_WITHIN, async {
        for pump in pumps.iter_mut() {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(run_id = %run_id, "output pipes still open after exit, detaching readers");
        for pump in &pumps {
            pump.abort();
        }
    }

    match status {
        Ok(st) => registry.end(&run_id, exit_code(st)),
        Err(e) => {
            registry.error(&run_id, &format!("failed to wait for job: {e}"));
            registry.end(&run_id, 1);
        }
    }
}

async fn pump<R>(registry: Arc<Registry>, run_id: String, src: R, prefix: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(src);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if prefix.is_empty() {
                    registry.append_line(&run_id, line);
                } else {
                    registry.append_line(&run_id, &format!("{prefix}{line}"));
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "output read failed");
                return;
            }
        }
    }
}

/// Exit code, or `128 + signal` when the job was killed.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}
