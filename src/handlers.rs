//! Command handlers behind the `tunbox` binary.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::cli::{ProfileCommand, SettingsCommand, SubCommand};
use crate::config;
use crate::engine::config::synthesize_link;
use crate::events::{ChannelSink, Event, EventSink, TracingSink};
use crate::installer::LocalBinary;
use crate::privilege::PlatformElevation;
use crate::process::SystemController;
use crate::processes;
use crate::settings::{RoutingMode, RuleKind, RuleOutbound, RunMode, Settings, UserRule};
use crate::shared::latency::UNREACHABLE;
use crate::store::{JsonStore, Store};
use crate::supervisor::{Supervisor, SupervisorDeps, SupervisorOptions};
use crate::sysproxy::{NoopProxy, PlatformProxy, SystemProxy};

/// Log lines printed after a lost connection.
const CRASH_TAIL_LINES: usize = 20;

fn build_supervisor(
    app_dir: &Path,
    system_proxy: Arc<dyn SystemProxy>,
    sink: Arc<dyn EventSink>,
) -> Supervisor {
    let opts = SupervisorOptions::new(app_dir);
    let deps = SupervisorDeps {
        store: Arc::new(JsonStore::new(app_dir)),
        installer: Arc::new(LocalBinary::new(app_dir)),
        system_proxy,
        elevation: Arc::new(PlatformElevation::new(opts.elevation_timeout)),
        process: Arc::new(SystemController),
        sink,
    };
    Supervisor::new(deps, opts)
}

/// Connect and block until Ctrl-C or until the engine goes away.
pub async fn cmd_run(key: Option<String>, no_system_proxy: bool) -> anyhow::Result<()> {
    let app_dir = config::app_dir();
    config::ensure_dir(&app_dir)?;

    let system_proxy: Arc<dyn SystemProxy> = if no_system_proxy {
        Arc::new(NoopProxy)
    } else {
        Arc::new(PlatformProxy)
    };
    let (sink, mut events) = ChannelSink::new();
    let supervisor = build_supervisor(&app_dir, system_proxy, Arc::new(sink));
    let printer = TracingSink;

    let started = match key {
        Some(key) => supervisor.start(&key).await.map(Some),
        None => supervisor.auto_connect().await,
    };
    while let Ok(event) = events.try_recv() {
        printer.emit(event);
    }
    match started {
        Ok(Some(_)) => {}
        Ok(None) => bail!("no profile given and auto-connect is off (see `tunbox settings set --auto-connect true`)"),
        Err(e) => return Err(e).context("failed to connect"),
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let lost = loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!(error = ?e.to_string(), "ctrl_c_listen_failed");
                }
                info!("interrupt_received");
                break None;
            }
            event = events.recv() => match event {
                Some(Event::ConnectionLost(reason)) => {
                    printer.emit(Event::ConnectionLost(reason.clone()));
                    break Some(reason);
                }
                Some(event) => printer.emit(event),
                None => break None,
            },
        }
    };

    supervisor.shutdown().await;
    while let Ok(event) = events.try_recv() {
        printer.emit(event);
    }

    if let Some(reason) = lost {
        eprintln!("Last engine output:");
        for line in tail(&supervisor.logs(), CRASH_TAIL_LINES) {
            eprintln!("  {}", line);
        }
        bail!("connection lost: {}", reason);
    }
    Ok(())
}

pub async fn cmd_ping(key: &str) -> anyhow::Result<()> {
    let app_dir = config::app_dir();
    let supervisor = build_supervisor(&app_dir, Arc::new(NoopProxy), Arc::new(TracingSink));
    let millis = supervisor.measure(key).await;
    if millis == UNREACHABLE {
        bail!("server unreachable");
    }
    println!("{} ms", millis);
    Ok(())
}

pub fn cmd_config(key: &str) -> anyhow::Result<()> {
    let store = JsonStore::new(config::app_dir());
    let link = resolve_link(&store, key)?;
    let settings = store.load_settings()?;
    let engine_config = synthesize_link(&link, &settings)?;
    println!("{}", engine_config.to_json_pretty()?);
    Ok(())
}

pub fn cmd_reset_proxy() -> anyhow::Result<()> {
    PlatformProxy.set_system_proxy(false, 0)?;
    println!("System proxy disabled");
    Ok(())
}

/// A saved profile's link, or `key` itself when no profile has that id.
fn resolve_link(store: &dyn Store, key: &str) -> anyhow::Result<String> {
    let profiles = store.load_profiles()?;
    Ok(profiles
        .into_iter()
        .find(|p| p.id == key)
        .map_or_else(|| key.to_string(), |p| p.key))
}

pub fn dispatch_profile(command: ProfileCommand) -> anyhow::Result<()> {
    let store = JsonStore::new(config::app_dir());
    match command {
        ProfileCommand::List => {
            let profiles = store.load_profiles()?;
            if profiles.is_empty() {
                println!("No profiles.");
                return Ok(());
            }
            println!("{:<36}  {:<28} SUBSCRIPTION", "ID", "NAME");
            println!("{}", "-".repeat(80));
            for p in &profiles {
                println!(
                    "{:<36}  {:<28} {}",
                    p.id,
                    p.name,
                    p.subscription_id.as_deref().unwrap_or("-")
                );
            }
        }
        ProfileCommand::Add { link } => {
            let profile = store.add_profile(&link)?;
            println!("Added {} ({})", profile.name, profile.id);
        }
        ProfileCommand::Update { id, name, link } => {
            let current = store
                .load_profiles()?
                .into_iter()
                .find(|p| p.id == id)
                .with_context(|| format!("profile not found: {}", id))?;
            let name = name.unwrap_or(current.name);
            let link = link.unwrap_or(current.key);
            let profile = store.update_profile(&id, &name, &link)?;
            println!("Updated {} ({})", profile.name, profile.id);
        }
        ProfileCommand::Delete { id } => {
            store.delete_profile(&id)?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

pub fn dispatch_sub(command: SubCommand) -> anyhow::Result<()> {
    let store = JsonStore::new(config::app_dir());
    match command {
        SubCommand::List => {
            let subs = store.load_subscriptions()?;
            if subs.is_empty() {
                println!("No subscriptions.");
                return Ok(());
            }
            for s in &subs {
                println!("{}  {}  {}", s.id, s.name, s.url);
            }
        }
        SubCommand::Add { url } => {
            let (sub, fetched) = store.create_subscription(&url)?;
            println!("Created subscription {}", sub.id);
            match fetched {
                Ok(count) => println!("Imported {} profiles", count),
                Err(e) => {
                    warn!(id = %sub.id, error = ?e.to_string(), "subscription_first_fetch_failed");
                    eprintln!("Fetch failed ({}); retry with `tunbox sub update {}`", e, sub.id);
                }
            }
        }
        SubCommand::Update { id } => {
            let count = store.update_subscription(&id)?;
            println!("Imported {} profiles", count);
        }
        SubCommand::Delete { id } => {
            store.delete_subscription(&id)?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

pub fn dispatch_settings(command: SettingsCommand) -> anyhow::Result<()> {
    let store = JsonStore::new(config::app_dir());
    let mut settings = store.load_settings()?;
    match command {
        SettingsCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        SettingsCommand::Processes => {
            for name in processes::running_processes()? {
                println!("{}", name);
            }
            return Ok(());
        }
        SettingsCommand::Set {
            routing,
            run_mode,
            port,
            auto_connect,
            local_domains,
        } => apply_changes(
            &mut settings,
            SettingsChange {
                routing,
                run_mode,
                port,
                auto_connect,
                local_domains,
            },
        )?,
        SettingsCommand::AddRule {
            kind,
            value,
            outbound,
        } => {
            let rule = add_rule(&mut settings, kind, &value, outbound)?;
            println!("Added rule {}", rule.id);
        }
        SettingsCommand::RemoveRule { id } => remove_rule(&mut settings, &id)?,
    }
    store.save_settings(&settings)?;
    Ok(())
}

#[derive(Default)]
struct SettingsChange {
    routing: Option<RoutingMode>,
    run_mode: Option<RunMode>,
    port: Option<u16>,
    auto_connect: Option<bool>,
    local_domains: Option<Vec<String>>,
}

fn apply_changes(settings: &mut Settings, change: SettingsChange) -> anyhow::Result<()> {
    if let Some(routing) = change.routing {
        settings.routing_mode = routing;
    }
    if let Some(run_mode) = change.run_mode {
        settings.run_mode = run_mode;
    }
    if let Some(port) = change.port {
        if port == 0 {
            bail!("port must be between 1 and 65535");
        }
        settings.mixed_port = port;
    }
    if let Some(auto_connect) = change.auto_connect {
        settings.auto_connect = auto_connect;
    }
    if let Some(domains) = change.local_domains {
        let domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            bail!("local domain list cannot be empty");
        }
        settings.local_domains = domains;
    }
    Ok(())
}

fn add_rule(
    settings: &mut Settings,
    kind: RuleKind,
    value: &str,
    outbound: String,
) -> anyhow::Result<UserRule> {
    let value = value.trim();
    if value.is_empty() {
        bail!("rule value cannot be empty");
    }
    let rule = UserRule::new(kind, value, RuleOutbound::from(outbound));
    settings.user_rules.push(rule.clone());
    Ok(rule)
}

fn remove_rule(settings: &mut Settings, id: &str) -> anyhow::Result<()> {
    let before = settings.user_rules.len();
    settings.user_rules.retain(|r| r.id != id);
    if settings.user_rules.len() == before {
        bail!("rule not found: {}", id);
    }
    Ok(())
}

fn tail(lines: &[String], n: usize) -> &[String] {
    &lines[lines.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_link_prefers_saved_profile() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(tmp.path());
        let link = "vless://11111111-2222-3333-4444-555555555555@example.com:443#Home";
        let profile = store.add_profile(link).expect("add profile");

        assert_eq!(resolve_link(&store, &profile.id).expect("resolve"), link);
        assert_eq!(
            resolve_link(&store, "vless://raw@host:1").expect("resolve"),
            "vless://raw@host:1"
        );
    }

    #[test]
    fn settings_change_keeps_untouched_fields() {
        let mut settings = Settings::default();
        apply_changes(
            &mut settings,
            SettingsChange {
                run_mode: Some(RunMode::Proxy),
                local_domains: Some(vec![" .lan ".into(), String::new()]),
                ..SettingsChange::default()
            },
        )
        .expect("apply");

        assert_eq!(settings.run_mode, RunMode::Proxy);
        assert_eq!(settings.routing_mode, RoutingMode::Smart);
        assert_eq!(settings.local_domains, vec![".lan"]);
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut settings = Settings::default();
        let change = SettingsChange {
            port: Some(0),
            ..SettingsChange::default()
        };
        assert!(apply_changes(&mut settings, change).is_err());
    }

    #[test]
    fn rules_append_in_order_and_remove_by_id() {
        let mut settings = Settings::default();
        let first = add_rule(&mut settings, RuleKind::Domain, "example.com", "direct".into())
            .expect("first");
        add_rule(&mut settings, RuleKind::Ip, "10.0.0.0/8", "block".into()).expect("second");

        assert_eq!(settings.user_rules[1].outbound, RuleOutbound::Block);
        remove_rule(&mut settings, &first.id).expect("remove");
        assert_eq!(settings.user_rules.len(), 1);
        assert_eq!(settings.user_rules[0].value, "10.0.0.0/8");
        assert!(remove_rule(&mut settings, &first.id).is_err());
    }

    #[test]
    fn tail_handles_short_buffers() {
        let lines: Vec<String> = (0..3).map(|i| i.to_string()).collect();
        assert_eq!(tail(&lines, 2), &lines[1..]);
        assert_eq!(tail(&lines, 10), &lines[..]);
    }
}
