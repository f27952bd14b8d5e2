//! Process-group handling for task children.
//!
//! Every task command runs in its own process group so that cancellation can
//! take down the whole tree the command may have spawned: first SIGTERM to
//! the group, then SIGKILL after a grace period.

use std::io;
use std::time::Duration;

use tokio::process::{Child, Command};

/// Spawn `cmd` as the leader of a new process group.
pub fn group_spawn(cmd: &mut Command) -> io::Result<Child> {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

/// Terminate the process group led by `pid`: SIGTERM, wait up to `grace`,
/// then SIGKILL whatever is left.
pub async fn terminate_group(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid == -1 {
            return;
        }
        unsafe { libc::killpg(pgid, libc::SIGTERM) };

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            // Signal 0 probes for existence without delivering anything.
            if unsafe { libc::killpg(pgid, 0) } != 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        unsafe { libc::killpg(pgid, libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn group_spawn_runs_the_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 7").stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = group_spawn(&mut cmd).expect("spawn");
        let status = child.wait().await.expect("wait");
        assert_eq!(status.code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_group_kills_a_sleeping_child() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30").stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = group_spawn(&mut cmd).expect("spawn");
        let pid = child.id().expect("pid");

        terminate_group(pid, Duration::from_secs(2)).await;
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child did not exit after group termination")
            .expect("wait");
        assert!(!status.success());
    }
}
