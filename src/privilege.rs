//! Grant the engine binary the network privileges a tun interface needs.
//!
//! Linux: file capabilities via `setcap`, elevated with `pkexec` then `sudo`.
//! macOS: setuid root, elevated through an `osascript` admin prompt.
//! Elsewhere nothing is required.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info};

pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(target_os = "linux")]
const CAPABILITIES: &str = "cap_net_admin,cap_net_bind_service=+ep";

pub trait Elevation: Send + Sync {
    /// Succeeds once `binary` can open a tun device. May show an OS prompt.
    fn ensure_privilege(&self, binary: &Path) -> anyhow::Result<()>;
}

pub struct PlatformElevation {
    prompt_timeout: Duration,
}

impl PlatformElevation {
    #[must_use]
    pub fn new(prompt_timeout: Duration) -> Self {
        Self { prompt_timeout }
    }
}

impl Default for PlatformElevation {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_TIMEOUT)
    }
}

impl Elevation for PlatformElevation {
    #[cfg(target_os = "linux")]
    fn ensure_privilege(&self, binary: &Path) -> anyhow::Result<()> {
        if has_net_admin_capability(binary) {
            debug!(binary = %binary.display(), "engine_capabilities_present");
            return Ok(());
        }

        info!(binary = %binary.display(), "Requesting admin rights (pkexec)...");
        let mut pkexec = Command::new("pkexec");
        pkexec.arg("setcap").arg(CAPABILITIES).arg(binary);
        let mut sudo = Command::new("sudo");
        sudo.arg("setcap").arg(CAPABILITIES).arg(binary);

        let granted = run_in_turn(vec![pkexec, sudo], self.prompt_timeout).context("setcap")?;
        if !granted {
            anyhow::bail!("setcap was declined or failed for {}", binary.display());
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn ensure_privilege(&self, binary: &Path) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        // Quarantine flag blocks execution of downloaded binaries; absence is fine.
        let _ = Command::new("xattr")
            .args(["-d", "com.apple.quarantine"])
            .arg(binary)
            .status();

        let mode = std::fs::metadata(binary)
            .with_context(|| format!("stat {}", binary.display()))?
            .permissions()
            .mode();
        if mode & 0o4000 != 0 {
            debug!(binary = %binary.display(), "engine_setuid_present");
            return Ok(());
        }

        info!(binary = %binary.display(), "Requesting admin rights (osascript)...");
        let mut osascript = Command::new("osascript");
        osascript.arg("-e").arg(setuid_script(binary));
        let granted = run_with_timeout(osascript, self.prompt_timeout).context("osascript")?;
        if !granted {
            anyhow::bail!("administrator prompt was declined for {}", binary.display());
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn ensure_privilege(&self, _binary: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn has_net_admin_capability(binary: &Path) -> bool {
    Command::new("getcap")
        .arg(binary)
        .output()
        .map(|out| {
            String::from_utf8_lossy(&out.stdout).contains("cap_net_admin")
                || String::from_utf8_lossy(&out.stderr).contains("cap_net_admin")
        })
        .unwrap_or(false)
}

#[cfg(any(target_os = "macos", test))]
fn setuid_script(binary: &Path) -> String {
    let path = binary.display().to_string().replace('"', "\\\\\\\"");
    format!(
        "do shell script \"chown root:admin \\\"{path}\\\" && chmod +s \\\"{path}\\\"\" with administrator privileges"
    )
}

/// Run `cmd` to completion, killing it once `timeout` elapses.
///
/// Returns whether it exited successfully; a timeout is an `ErrorKind::TimedOut` error.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<bool> {
    debug!(cmd = ?cmd.get_program(), "exec");
    let mut child = cmd.spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.success());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(timed_out(timeout));
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Try each prompt in order until one succeeds, all within one `timeout`.
///
/// A missing program or a failed attempt moves on to the next command. A
/// prompt that runs out the clock ends the sequence, so no later prompt
/// appears after the caller has given up.
pub fn run_in_turn(attempts: Vec<Command>, timeout: Duration) -> std::io::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut last = Ok(false);
    for cmd in attempts {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(timeout));
        }
        match run_with_timeout(cmd, remaining) {
            Ok(true) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(e),
            Ok(false) => last = Ok(false),
            Err(e) => {
                debug!(error = ?e.to_string(), "prompt_unavailable");
                last = Err(e);
            }
        }
    }
    last
}

fn timed_out(timeout: Duration) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("authentication prompt timed out after {}s", timeout.as_secs()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setuid_script_quotes_binary_path() {
        let script = setuid_script(Path::new("/Apps/tun box/sing-box"));
        assert!(script.starts_with("do shell script \"chown root:admin \\\"/Apps/tun box/sing-box\\\""));
        assert!(script.ends_with("with administrator privileges"));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_reports_exit_status() {
        assert!(run_with_timeout(Command::new("true"), Duration::from_secs(5)).expect("true"));
        assert!(!run_with_timeout(Command::new("false"), Duration::from_secs(5)).expect("false"));
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_hung_prompt() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_with_timeout(cmd, Duration::from_millis(200)).unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn prompts_share_one_deadline() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("second-prompt-ran");

        let mut hung = Command::new("sleep");
        hung.arg("30");
        let mut second = Command::new("touch");
        second.arg(&marker);

        let started = Instant::now();
        let err = run_in_turn(vec![hung, second], Duration::from_millis(200)).unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_or_missing_prompt_falls_through() {
        let attempts = vec![Command::new("false"), Command::new("true")];
        assert!(run_in_turn(attempts, Duration::from_secs(5)).expect("fallback"));

        let attempts = vec![
            Command::new("tunbox-no-such-prompt"),
            Command::new("true"),
        ];
        assert!(run_in_turn(attempts, Duration::from_secs(5)).expect("fallback"));

        let attempts = vec![Command::new("true"), Command::new("tunbox-no-such-prompt")];
        assert!(run_in_turn(attempts, Duration::from_secs(5)).expect("first wins"));

        let attempts = vec![Command::new("false")];
        assert!(!run_in_turn(attempts, Duration::from_secs(5)).expect("declined"));
    }
}
