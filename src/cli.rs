use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::{RoutingMode, RuleKind, RunMode};

#[derive(Parser)]
#[command(
    name = "tunbox",
    about = "VLESS client that drives a sing-box engine",
    version = env!("TUNBOX_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Connect and stay in the foreground until Ctrl-C or the engine dies
    Run {
        /// Profile id or vless:// link. Defaults to the last profile when
        /// auto-connect is enabled.
        key: Option<String>,

        /// Do not touch the desktop proxy setting in proxy mode
        #[arg(long)]
        no_system_proxy: bool,

        /// Write logs to this file instead of the terminal
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print the engine configuration a profile or link would produce
    Config {
        /// Profile id or vless:// link
        key: String,
    },

    /// Measure TCP latency to a profile's server
    Ping {
        /// Profile id or vless:// link
        key: String,
    },

    /// Turn the desktop proxy setting off (after a crash left it on)
    ResetProxy,

    /// Manage saved profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },

    /// Manage subscriptions
    Sub {
        #[command(subcommand)]
        command: SubCommand,
    },

    /// Show or change routing settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommand {
    /// List saved profiles
    List,

    /// Save a vless:// link as a profile
    Add {
        link: String,
    },

    /// Rename a profile or replace its link
    Update {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        link: Option<String>,
    },

    /// Delete a profile
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SubCommand {
    /// List subscriptions
    List,

    /// Add a subscription URL and fetch it
    Add {
        url: String,
    },

    /// Re-fetch a subscription, replacing its profiles
    Update {
        id: String,
    },

    /// Delete a subscription and its profiles
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SettingsCommand {
    /// Print current settings as JSON
    Show,

    /// Change one or more settings
    Set {
        /// smart or global
        #[arg(long)]
        routing: Option<RoutingMode>,

        /// tun or proxy
        #[arg(long)]
        run_mode: Option<RunMode>,

        /// Local mixed (SOCKS5/HTTP) listener port
        #[arg(long)]
        port: Option<u16>,

        /// Reconnect the last profile on `tunbox run` without a key
        #[arg(long)]
        auto_connect: Option<bool>,

        /// Replace the domain suffixes routed directly in smart mode (comma separated)
        #[arg(long, value_delimiter = ',')]
        local_domains: Option<Vec<String>>,
    },

    /// Append a routing rule (evaluated in insertion order)
    AddRule {
        /// domain, ip or process
        #[arg(long = "type")]
        kind: RuleKind,

        /// Domain suffix, CIDR or process name
        #[arg(long)]
        value: String,

        /// Outbound tag (proxy, direct) or "block"
        #[arg(long)]
        outbound: String,
    },

    /// Remove a routing rule by id
    RemoveRule {
        id: String,
    },

    /// List running process names usable as `--type process` rule values
    Processes,
}
