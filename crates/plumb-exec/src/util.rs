use std::{io, process::ExitStatus, time::Duration};

use tokio::process::Child;
use tracing::trace;

/// Ask the child to stop, then kill it once `grace` has elapsed.
#[cfg(target_family = "unix")]
pub async fn kill_graceful(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(id) = child.id() else {
        // already reaped
        return child.wait().await;
    };

    trace!(target: "plumb.exec.process", pid = id, "sending SIGTERM");
    // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
    unsafe {
        libc::kill(id as libc::pid_t, libc::SIGTERM);
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    trace!(target: "plumb.exec.process", pid = id, "grace elapsed; killing");
    child.kill().await?;
    child.wait().await
}

#[cfg(target_family = "windows")]
pub async fn kill_graceful(child: &mut Child, _grace: Duration) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}
