//! Engine process control: launch, interrupt, kill.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::engine;

pub trait ProcessController: Send + Sync {
    /// Start `<binary> run -c <config> -D <work_dir>` with stderr piped.
    fn launch(&self, binary: &Path, config: &Path, work_dir: &Path) -> std::io::Result<Child>;

    /// Ask the process to exit cleanly.
    fn graceful_stop(&self, pid: u32) -> anyhow::Result<()>;

    fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

/// Controller for the host operating system.
pub struct SystemController;

impl ProcessController for SystemController {
    fn launch(&self, binary: &Path, config: &Path, work_dir: &Path) -> std::io::Result<Child> {
        let mut cmd = Command::new(binary);
        cmd.args(engine::run_args(config, work_dir))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        debug!(binary = %binary.display(), config = %config.display(), "engine_launch");
        cmd.spawn()
    }

    #[cfg(unix)]
    fn graceful_stop(&self, pid: u32) -> anyhow::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGINT)
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    // No console interrupt for a detached child; fall back to terminate.
    #[cfg(windows)]
    fn graceful_stop(&self, pid: u32) -> anyhow::Result<()> {
        taskkill(pid, false)
    }

    #[cfg(windows)]
    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        taskkill(pid, true)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).context("pid out of range")?;
    debug!(pid = ?pid, signal = ?signal, "engine_signal_send");
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to send {} to {}", signal, pid)),
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> anyhow::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    if force {
        cmd.arg("/F");
    }
    let pid_arg = pid.to_string();
    cmd.args(["/PID", &pid_arg]);
    debug!(pid = ?pid, force = force, "engine_taskkill");
    let status = cmd.status().context("failed to run taskkill")?;
    if !status.success() {
        debug!(pid = ?pid, status = ?status, "engine_taskkill_nonzero");
    }
    Ok(())
}

/// Whether `pid` still names a live process.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}
