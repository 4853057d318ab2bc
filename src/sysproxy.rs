//! Point the desktop's HTTP proxy setting at the local mixed listener.

#[cfg(any(windows, target_os = "linux", test))]
use std::process::Command;

#[cfg(any(windows, target_os = "linux", test))]
use anyhow::Context;
use tracing::debug;

pub trait SystemProxy: Send + Sync {
    fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()>;
}

/// Leaves the system proxy alone.
pub struct NoopProxy;

impl SystemProxy for NoopProxy {
    fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()> {
        debug!(enable = enable, port = port, "system_proxy_skipped");
        Ok(())
    }
}

/// Windows: per-user Internet Settings registry keys.
/// Linux: GNOME `org.gnome.system.proxy` via gsettings.
pub struct PlatformProxy;

#[cfg(windows)]
const BYPASS_LIST: &str = "<local>;localhost;127.*;10.*;172.16.*;192.168.*";

impl SystemProxy for PlatformProxy {
    #[cfg(windows)]
    fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()> {
        const KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

        if enable {
            reg_add(KEY, "ProxyEnable", "REG_DWORD", "1")?;
            reg_add(KEY, "ProxyServer", "REG_SZ", &format!("127.0.0.1:{}", port))?;
            reg_add(KEY, "ProxyOverride", "REG_SZ", BYPASS_LIST)?;
        } else {
            reg_add(KEY, "ProxyEnable", "REG_DWORD", "0")?;
        }
        debug!(enable = enable, port = port, "system_proxy_set");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()> {
        for args in gsettings_commands(enable, port) {
            run_checked(Command::new("gsettings").args(&args))?;
        }
        debug!(enable = enable, port = port, "system_proxy_set");
        Ok(())
    }

    #[cfg(not(any(windows, target_os = "linux")))]
    fn set_system_proxy(&self, enable: bool, port: u16) -> anyhow::Result<()> {
        NoopProxy.set_system_proxy(enable, port)
    }
}

#[cfg(any(target_os = "linux", test))]
fn gsettings_commands(enable: bool, port: u16) -> Vec<Vec<String>> {
    const SCHEMA: &str = "org.gnome.system.proxy";
    let set = |schema: &str, key: &str, value: &str| {
        vec!["set".to_string(), schema.to_string(), key.to_string(), value.to_string()]
    };

    if !enable {
        return vec![set(SCHEMA, "mode", "none")];
    }

    let port = port.to_string();
    let mut commands = Vec::new();
    for proto in ["http", "https", "socks"] {
        let schema = format!("{}.{}", SCHEMA, proto);
        commands.push(set(&schema, "host", "127.0.0.1"));
        commands.push(set(&schema, "port", &port));
    }
    commands.push(set(
        SCHEMA,
        "ignore-hosts",
        "['localhost', '127.0.0.0/8', '10.0.0.0/8', '172.16.0.0/12', '192.168.0.0/16', '::1']",
    ));
    commands.push(set(SCHEMA, "mode", "manual"));
    commands
}

#[cfg(windows)]
fn reg_add(key: &str, name: &str, kind: &str, data: &str) -> anyhow::Result<()> {
    run_checked(Command::new("reg").args(["add", key, "/v", name, "/t", kind, "/d", data, "/f"]))
}

#[cfg(any(windows, target_os = "linux", test))]
fn run_checked(cmd: &mut Command) -> anyhow::Result<()> {
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
    Ok(())
}
