//! Names of running processes, offered as values for process routing rules.

use std::collections::BTreeSet;
use std::process::Command;

use anyhow::Context;
use tracing::debug;

const WINDOWS_SYSTEM: &[&str] = &[
    "system",
    "system idle process",
    "registry",
    "memcompression",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "services.exe",
    "lsass.exe",
    "svchost.exe",
    "fontdrvhost.exe",
    "winlogon.exe",
    "dwm.exe",
    "spoolsv.exe",
    "searchindexer.exe",
    "taskhostw.exe",
    "explorer.exe",
    "runtimebroker.exe",
    "shellexperiencehost.exe",
    "applicationframehost.exe",
    "dllhost.exe",
    "conhost.exe",
    "ctfmon.exe",
    "smartscreen.exe",
    "sihost.exe",
    "werfault.exe",
    "wudfhost.exe",
    "securityhealthservice.exe",
    "sgrmbroker.exe",
];

/// Daemons and kernel threads, matched as prefixes (`kworker/0:1`, `migration/3`).
const UNIX_SYSTEM_PREFIXES: &[&str] = &[
    "launchd",
    "kernel_task",
    "logd",
    "usereventagent",
    "distnoted",
    "cfprefsd",
    "xpcproxy",
    "tccd",
    "com.apple",
    "mds",
    "nsurlsessiond",
    "syslogd",
    "systemstats",
    "configd",
    "powerd",
    "secinitd",
    "trustd",
    "fseventsd",
    "diskarbitrationd",
    "systemd",
    "kthreadd",
    "rcu_",
    "migration",
    "watchdog",
    "ksoftirqd",
    "kworker",
    "dbus-daemon",
    "networkmanager",
    "polkitd",
    "wpa_supplicant",
    "avahi-daemon",
];

/// Shells and login, matched exactly so `ssh` or `bash-language-server` survive.
const UNIX_SYSTEM_EXACT: &[&str] = &["zsh", "bash", "sh", "login", "lsd", "pkd"];

/// Sorted, de-duplicated names of user-facing processes.
pub fn running_processes() -> anyhow::Result<Vec<String>> {
    if cfg!(windows) {
        let mut cmd = Command::new("tasklist");
        cmd.args(["/FO", "CSV", "/NH"]);
        hide_console(&mut cmd);
        Ok(parse_tasklist(&command_stdout(&mut cmd)?))
    } else {
        let mut cmd = Command::new("ps");
        if cfg!(target_os = "macos") {
            cmd.args(["-A", "-o", "comm="]);
        } else {
            cmd.args(["-e", "-o", "comm="]);
        }
        Ok(parse_ps(&command_stdout(&mut cmd)?))
    }
}

fn command_stdout(cmd: &mut Command) -> anyhow::Result<String> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to run {:?}", cmd.get_program()))?;
    if !output.status.success() {
        anyhow::bail!(
            "{:?} exited {}: {}",
            cmd.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!(cmd = ?cmd.get_program(), bytes = output.stdout.len(), "process_list_read");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}

/// `ps -o comm=` output: one name per line. macOS prints full paths, which
/// are cut to the file name; kernel thread names keep their slashes.
fn parse_ps(output: &str) -> Vec<String> {
    let names = output.lines().filter_map(|line| {
        let raw = line.trim();
        if raw.is_empty() {
            return None;
        }
        let name = if raw.starts_with('/') {
            raw.rsplit('/').next().unwrap_or(raw)
        } else {
            raw
        };
        Some(name.to_string())
    });
    collect_user_processes(names, false)
}

/// `tasklist /FO CSV /NH` output: the image name is the first quoted field.
fn parse_tasklist(output: &str) -> Vec<String> {
    let names = output.lines().filter_map(|line| {
        let first = line.split("\",\"").next()?;
        let name = first.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    });
    collect_user_processes(names, true)
}

fn collect_user_processes(names: impl Iterator<Item = String>, windows: bool) -> Vec<String> {
    names
        .filter(|name| !is_system_process(name, windows))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn is_system_process(name: &str, windows: bool) -> bool {
    let lower = name.to_ascii_lowercase();
    if WINDOWS_SYSTEM.contains(&lower.as_str()) {
        return true;
    }
    if windows {
        return false;
    }

    if cfg!(target_os = "macos")
        && ["helper", "renderer", "gpu", "plugin", "xpc", "service"]
            .iter()
            .any(|part| lower.contains(part))
    {
        return true;
    }
    if name.starts_with('[') && name.ends_with(']') {
        return true;
    }
    UNIX_SYSTEM_EXACT.contains(&lower.as_str())
        || UNIX_SYSTEM_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}
