//! Role-process lifecycle: spawn, feed, capture, reap.
//!
//! Each invocation launches the subject once with the positional contract
//! arguments, in its own process group so a timeout can interrupt the whole
//! tree, not just the leader.

use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::HarnessError;
use crate::ports::Endpoint;
use crate::subject::Subject;

/// Which side of the protocol a spawned process plays.
///
/// Results are attributed by this tag, never by submission or completion
/// order: the two role processes exit in no guaranteed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured outcome of one cleanly exited role process.
#[derive(Debug)]
pub struct ProcessResult {
    pub role: Role,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Grace period between SIGINT to the process group and SIGKILL escalation.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Run the subject once in the given role and wait for it to exit.
///
/// The payload is written to the child's stdin, which is then closed;
/// stdout and stderr are drained in full concurrently with the wait. On
/// timeout the child's entire process group gets SIGINT, then SIGKILL after
/// [`TERM_GRACE`], leaving no live descendants on any path.
pub async fn run(
    subject: &Subject,
    role: Role,
    local: Endpoint,
    payload: Bytes,
    remote: Endpoint,
    iterations: u32,
    timeout: Duration,
) -> Result<ProcessResult, HarnessError> {
    let (program, pre_args) = subject
        .command
        .split_first()
        .ok_or_else(|| HarnessError::ExecutableNotFound("<empty subject command>".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(pre_args)
        .arg(role.as_str())
        .arg(local.addr.to_string())
        .arg(local.port.to_string())
        .arg(payload.len().to_string())
        .arg(remote.addr.to_string())
        .arg(remote.port.to_string())
        .arg(iterations.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(dir) = &subject.workdir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HarnessError::ExecutableNotFound(program.clone())
        } else {
            HarnessError::Io(e)
        }
    })?;
    let pid = child.id().unwrap_or_default();
    tracing::debug!(%role, pid, "spawned role process");

    // Feed the payload and close stdin. Runs concurrently with the wait so a
    // subject that never drains stdin cannot wedge the harness on a full pipe.
    let writer = child.stdin.take().map(|mut stdin| {
        let payload = payload.clone();
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
        })
    });

    let stdout_task = drain(child.stdout.take());
    let stderr_task = drain(child.stderr.take());

    let status = match time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            tracing::warn!(%role, pid, ?timeout, "role process exceeded timeout, interrupting its process group");
            terminate_group(&mut child, pid).await;
            if let Some(w) = writer {
                w.abort();
            }
            return Err(HarnessError::TimedOut { role, timeout });
        }
    };
    if let Some(w) = writer {
        w.abort();
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(HarnessError::ProcessFailure {
            role,
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        });
    }
    tracing::debug!(%role, pid, stdout_len = stdout.len(), "role process exited cleanly");
    Ok(ProcessResult {
        role,
        stdout,
        stderr,
    })
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// SIGINT the whole group, wait out the grace period, then SIGKILL any
/// stragglers and reap the leader. The child was spawned as its own group
/// leader, so the group id equals its pid.
async fn terminate_group(child: &mut Child, pid: u32) {
    signal_group(pid, libc::SIGINT);
    match time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(pid, "process group survived SIGINT, escalating to SIGKILL");
            signal_group(pid, libc::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    if pid == 0 {
        return;
    }
    // SAFETY: the pid is our own child's, spawned as a group leader. Worst
    // case the group is already gone and killpg reports ESRCH.
    let _ = unsafe { libc::killpg(pid as libc::pid_t, signal) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Endpoint;

    fn endpoints() -> (Endpoint, Endpoint) {
        (Endpoint::loopback(25900), Endpoint::loopback(25901))
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let subject = Subject {
            command: vec!["/nonexistent/gauntlet-subject".into()],
            workdir: None,
        };
        let (local, remote) = endpoints();
        let err = run(
            &subject,
            Role::Client,
            local,
            Bytes::from_static(b"x"),
            remote,
            1,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        // The script ignores the appended contract args ($0, $1, ...).
        let subject = Subject {
            command: vec![
                "sh".into(),
                "-c".into(),
                "echo boom >&2; exit 3".into(),
            ],
            workdir: None,
        };
        let (local, remote) = endpoints();
        let err = run(
            &subject,
            Role::Server,
            local,
            Bytes::from_static(b"x"),
            remote,
            1,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            HarnessError::ProcessFailure { role, code, stderr } => {
                assert_eq!(role, Role::Server);
                assert_eq!(code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected ProcessFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_payload_reaches_the_child() {
        let subject = Subject {
            command: vec!["sh".into(), "-c".into(), "cat".into()],
            workdir: None,
        };
        let (local, remote) = endpoints();
        let result = run(
            &subject,
            Role::Client,
            local,
            Bytes::from_static(b"payload-bytes"),
            remote,
            1,
            Duration::from_secs(5),
        )
        .await
        .expect("cat run");
        assert_eq!(result.stdout, b"payload-bytes");
    }

    #[tokio::test]
    async fn timeout_tears_down_the_whole_group() {
        let marker = format!("sleep 601.{}", std::process::id());
        let subject = Subject {
            command: vec!["sh".into(), "-c".into(), format!("exec {marker}")],
            workdir: None,
        };
        let (local, remote) = endpoints();
        let started = std::time::Instant::now();
        let err = run(
            &subject,
            Role::Client,
            local,
            Bytes::from_static(b"x"),
            remote,
            1,
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::TimedOut { role: Role::Client, .. }));
        // SIGINT kills sleep straight away; well under the SIGKILL escalation.
        assert!(started.elapsed() < Duration::from_secs(5));

        let survivors = std::process::Command::new("pgrep")
            .args(["-f", &marker])
            .output()
            .expect("pgrep");
        assert!(
            !survivors.status.success(),
            "descendants survived group teardown: {}",
            String::from_utf8_lossy(&survivors.stdout)
        );
    }
}
