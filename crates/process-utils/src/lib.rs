//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Kill a child process and wait for it to be reaped, bounded by `grace`.
///
/// Returns `Ok(None)` if the process did not exit within the grace period;
/// the caller decides whether that is worth escalating.
#[cfg(feature = "tokio")]
pub async fn kill_and_wait(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    match child.start_kill() {
        Ok(()) => {}
        // The child already exited between the caller's decision and the kill.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Some(status?)),
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, feature = "tokio", unix))]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn kill_and_wait_reaps_a_long_running_child() {
        let mut child = tokio_command("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let status = kill_and_wait(&mut child, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn kill_and_wait_tolerates_an_already_exited_child() {
        let mut child = tokio_command("true").spawn().unwrap();
        // Let it exit on its own before killing.
        let _ = child.wait().await.unwrap();
        let result = kill_and_wait(&mut child, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }
}
