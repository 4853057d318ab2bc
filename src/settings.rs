//! Routing preferences and saved connection profiles.
//!
//! These are plain serde types; reading and writing them is the job of
//! [`crate::store`]. The supervisor only ever works on a snapshot taken when a
//! session starts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MIXED_PORT: u16 = 2080;

/// Domain suffixes resolved and routed directly in smart mode.
pub const DEFAULT_LOCAL_DOMAINS: [&str; 3] = [".ru", ".rf", ".xn--p1ai"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Bypass private and local-region traffic, proxy the rest.
    #[default]
    Smart,
    /// Everything except loop-prevention traffic goes through the proxy.
    Global,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// System-wide virtual interface; needs elevated network privileges.
    #[default]
    Tun,
    /// Only the local mixed listener, optionally set as the system proxy.
    Proxy,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smart => write!(f, "smart"),
            Self::Global => write!(f, "global"),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tun => write!(f, "tun"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smart" => Ok(Self::Smart),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown routing mode {:?} (smart, global)", other)),
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tun" => Ok(Self::Tun),
            "proxy" => Ok(Self::Proxy),
            other => Err(format!("unknown run mode {:?} (tun, proxy)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Matches a domain suffix.
    Domain,
    /// Matches a destination CIDR.
    Ip,
    /// Matches the originating process name.
    Process,
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain),
            "ip" => Ok(Self::Ip),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown rule type {:?} (domain, ip, process)", other)),
        }
    }
}

/// Where a matching rule sends traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleOutbound {
    Block,
    Named(String),
}

impl From<String> for RuleOutbound {
    fn from(value: String) -> Self {
        if value == "block" {
            Self::Block
        } else {
            Self::Named(value)
        }
    }
}

impl From<RuleOutbound> for String {
    fn from(value: RuleOutbound) -> Self {
        match value {
            RuleOutbound::Block => "block".to_string(),
            RuleOutbound::Named(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRule {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub value: String,
    pub outbound: RuleOutbound,
}

impl UserRule {
    #[must_use]
    pub fn new(kind: RuleKind, value: impl Into<String>, outbound: RuleOutbound) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            value: value.into(),
            outbound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub routing_mode: RoutingMode,
    pub run_mode: RunMode,
    pub mixed_port: u16,
    /// Evaluated first-match-wins, emitted in this order.
    pub user_rules: Vec<UserRule>,
    pub local_domains: Vec<String>,
    pub auto_connect: bool,
    pub last_profile_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            routing_mode: RoutingMode::Smart,
            run_mode: RunMode::Tun,
            mixed_port: DEFAULT_MIXED_PORT,
            user_rules: Vec::new(),
            local_domains: DEFAULT_LOCAL_DOMAINS.iter().map(|s| s.to_string()).collect(),
            auto_connect: false,
            last_profile_id: None,
        }
    }
}

impl Settings {
    /// Fill fields a hand-edited or older settings file left zeroed.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.mixed_port == 0 {
            self.mixed_port = DEFAULT_MIXED_PORT;
        }
        if self.local_domains.is_empty() {
            self.local_domains = DEFAULT_LOCAL_DOMAINS.iter().map(|s| s.to_string()).collect();
        }
        if self.last_profile_id.as_deref() == Some("") {
            self.last_profile_id = None;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    /// The `vless://` link this profile connects with.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub updated_at: i64,
}
