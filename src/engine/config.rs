//! sing-box configuration synthesis.
//!
//! Everything here is a pure function of a [`ConnectionDescriptor`] and a
//! [`Settings`] snapshot. The document is rebuilt on every start; nothing is
//! read back from a previous run.
//!
//! Route rules are first-match, so the order produced by [`route_rules`] is
//! part of the contract: bypass and loop-prevention rules must come before the
//! final `proxy` route.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::error::Result;
use crate::link::{ConnectionDescriptor, Security, Transport};
use crate::settings::{RoutingMode, RuleKind, RuleOutbound, RunMode, Settings, UserRule};

/// Loopback address of the engine's clash-compatible control API.
pub const ADMIN_ADDR: &str = "127.0.0.1:9090";

pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const MIXED_INBOUND_TAG: &str = "mixed-in";
pub const TUN_INBOUND_TAG: &str = "tun-in";
pub const ADMIN_INBOUND_TAG: &str = "clash-api";
pub const REMOTE_DNS_TAG: &str = "remote_dns";
pub const LOCAL_DNS_TAG: &str = "local_dns";

pub const LOCAL_REGION_RULE_SET_TAG: &str = "geoip-ru";
pub const LOCAL_REGION_RULE_SET_URL: &str =
    "https://raw.githubusercontent.com/SagerNet/sing-geoip/rule-set/geoip-ru.srs";

const DEFAULT_FINGERPRINT: &str = "chrome";
const TUN_ADDRESS: &str = "172.19.0.1/30";
const TUN_MTU: u32 = 9000;
const REMOTE_DNS_SERVER: &str = "8.8.8.8";
const PUBLIC_RESOLVERS: [&str; 2] = ["8.8.8.8/32", "1.1.1.1/32"];

/// Platform facts that change the document but not its meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthOptions {
    /// `host:port` the engine exposes its control API on.
    pub admin_addr: String,
    /// Linux needs an explicit tun name; other platforms auto-assign.
    pub tun_interface_name: Option<String>,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            admin_addr: ADMIN_ADDR.to_string(),
            tun_interface_name: if cfg!(target_os = "linux") {
                Some("tun0".to_string())
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub log: LogSection,
    pub experimental: Experimental,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
}

impl EngineConfig {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSection {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experimental {
    pub clash_api: ClashApi,
    pub cache_file: CacheFile,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClashApi {
    pub external_controller: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheFile {
    pub enabled: bool,
    pub store_rdrc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsServer {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRule {
    pub domain_suffix: Vec<String>,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Mixed {
        tag: String,
        listen: String,
        listen_port: u16,
        sniff: bool,
    },
    Tun {
        tag: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interface_name: Option<String>,
        address: Vec<String>,
        mtu: u32,
        auto_route: bool,
        strict_route: bool,
        stack: String,
        sniff: bool,
        sniff_override_destination: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Direct { tag: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    pub packet_encoding: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsBlock {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub utls: Utls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utls {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealityBlock {
    pub enabled: bool,
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportBlock {
    Ws {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
    },
    Grpc {
        service_name: String,
    },
    Http {
        host: Vec<String>,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSection {
    pub rule_set: Vec<RuleSet>,
    pub rules: Vec<RouteRule>,
    pub auto_detect_interface: bool,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub default_domain_resolver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub url: String,
    pub download_detour: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    HijackDns,
    Sniff,
    Reject,
    Route,
}

/// One route rule. Exactly one matcher is set per rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RouteRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_cidr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
}

impl RouteRule {
    fn direct(self) -> Self {
        Self {
            action: Some(RuleAction::Route),
            outbound: Some(DIRECT_TAG.to_string()),
            ..self
        }
    }
}

/// Parse `link` and synthesize a document with platform defaults.
pub fn synthesize_link(link: &str, settings: &Settings) -> Result<EngineConfig> {
    let descriptor = ConnectionDescriptor::parse(link)?;
    Ok(synthesize(&descriptor, settings))
}

#[must_use]
pub fn synthesize(descriptor: &ConnectionDescriptor, settings: &Settings) -> EngineConfig {
    synthesize_with(descriptor, settings, &SynthOptions::default())
}

#[must_use]
pub fn synthesize_with(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
    options: &SynthOptions,
) -> EngineConfig {
    let smart = settings.routing_mode == RoutingMode::Smart;

    let rule_set = if smart {
        vec![RuleSet {
            tag: LOCAL_REGION_RULE_SET_TAG.to_string(),
            kind: "remote".to_string(),
            format: "binary".to_string(),
            url: LOCAL_REGION_RULE_SET_URL.to_string(),
            download_detour: PROXY_TAG.to_string(),
        }]
    } else {
        Vec::new()
    };

    EngineConfig {
        log: LogSection {
            level: "info".to_string(),
            timestamp: true,
        },
        experimental: Experimental {
            clash_api: ClashApi {
                external_controller: options.admin_addr.clone(),
            },
            cache_file: CacheFile {
                enabled: true,
                store_rdrc: true,
            },
        },
        dns: dns_section(settings),
        inbounds: inbounds(settings, options),
        outbounds: vec![
            Outbound::Vless(vless_outbound(descriptor)),
            Outbound::Direct {
                tag: DIRECT_TAG.to_string(),
            },
        ],
        route: RouteSection {
            rule_set,
            rules: route_rules(descriptor, settings),
            auto_detect_interface: true,
            final_outbound: PROXY_TAG.to_string(),
            default_domain_resolver: LOCAL_DNS_TAG.to_string(),
        },
    }
}

fn vless_outbound(descriptor: &ConnectionDescriptor) -> VlessOutbound {
    VlessOutbound {
        tag: PROXY_TAG.to_string(),
        server: descriptor.host.clone(),
        server_port: descriptor.port,
        uuid: descriptor.user_id.clone(),
        flow: descriptor.flow.clone(),
        packet_encoding: "xudp".to_string(),
        tls: tls_block(descriptor),
        transport: transport_block(descriptor),
    }
}

fn tls_block(descriptor: &ConnectionDescriptor) -> Option<TlsBlock> {
    let reality = match descriptor.security {
        Security::None => return None,
        Security::Tls => None,
        Security::Reality => Some(RealityBlock {
            enabled: true,
            public_key: descriptor.public_key.clone().unwrap_or_default(),
            short_id: descriptor.short_id.clone().unwrap_or_default(),
        }),
    };

    Some(TlsBlock {
        enabled: true,
        server_name: descriptor.sni.clone(),
        utls: Utls {
            enabled: true,
            fingerprint: descriptor
                .fingerprint
                .clone()
                .unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string()),
        },
        reality,
    })
}

fn transport_block(descriptor: &ConnectionDescriptor) -> Option<TransportBlock> {
    let path = descriptor.path.clone().unwrap_or_default();
    match descriptor.transport {
        Transport::Tcp => None,
        Transport::Ws => Some(TransportBlock::Ws {
            path,
            headers: descriptor
                .host_header
                .as_ref()
                .map(|host| BTreeMap::from([("Host".to_string(), host.clone())])),
        }),
        Transport::Grpc => Some(TransportBlock::Grpc {
            service_name: descriptor.service_name.clone().unwrap_or(path),
        }),
        Transport::Http => Some(TransportBlock::Http {
            host: vec![descriptor.host_header.clone().unwrap_or_default()],
            path,
        }),
    }
}

fn inbounds(settings: &Settings, options: &SynthOptions) -> Vec<Inbound> {
    let mut inbounds = vec![Inbound::Mixed {
        tag: MIXED_INBOUND_TAG.to_string(),
        listen: "127.0.0.1".to_string(),
        listen_port: settings.mixed_port,
        sniff: true,
    }];

    if settings.run_mode == RunMode::Tun {
        inbounds.push(Inbound::Tun {
            tag: TUN_INBOUND_TAG.to_string(),
            interface_name: options.tun_interface_name.clone(),
            address: vec![TUN_ADDRESS.to_string()],
            mtu: TUN_MTU,
            auto_route: true,
            strict_route: true,
            stack: "system".to_string(),
            sniff: true,
            sniff_override_destination: true,
        });
    }

    inbounds
}

/// Route rules in evaluation order.
#[must_use]
pub fn route_rules(descriptor: &ConnectionDescriptor, settings: &Settings) -> Vec<RouteRule> {
    let mut rules = vec![RouteRule {
        protocol: Some("dns".to_string()),
        action: Some(RuleAction::HijackDns),
        ..Default::default()
    }];

    if settings.run_mode == RunMode::Tun {
        rules.push(RouteRule {
            inbound: Some(TUN_INBOUND_TAG.to_string()),
            action: Some(RuleAction::Sniff),
            ..Default::default()
        });
    }

    rules.extend(settings.user_rules.iter().map(user_rule));

    rules.push(
        RouteRule {
            ip_is_private: Some(true),
            ..Default::default()
        }
        .direct(),
    );

    if settings.routing_mode == RoutingMode::Smart {
        if !settings.local_domains.is_empty() {
            rules.push(
                RouteRule {
                    domain_suffix: Some(settings.local_domains.clone()),
                    ..Default::default()
                }
                .direct(),
            );
        }
        rules.push(
            RouteRule {
                rule_set: Some(LOCAL_REGION_RULE_SET_TAG.to_string()),
                ..Default::default()
            }
            .direct(),
        );
    }

    // Traffic to the server itself must never loop back into the tunnel.
    let server_rule = match descriptor.host_ip() {
        Some(IpAddr::V4(ip)) => RouteRule {
            ip_cidr: Some(vec![format!("{}/32", ip)]),
            ..Default::default()
        },
        Some(IpAddr::V6(ip)) => RouteRule {
            ip_cidr: Some(vec![format!("{}/128", ip)]),
            ..Default::default()
        },
        None => RouteRule {
            domain: Some(vec![descriptor.host.clone()]),
            ..Default::default()
        },
    };
    rules.push(server_rule.direct());

    rules.push(
        RouteRule {
            ip_cidr: Some(PUBLIC_RESOLVERS.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
        .direct(),
    );

    rules.push(
        RouteRule {
            inbound: Some(ADMIN_INBOUND_TAG.to_string()),
            ..Default::default()
        }
        .direct(),
    );

    rules
}

fn user_rule(rule: &UserRule) -> RouteRule {
    let value = Some(vec![rule.value.clone()]);
    let mut out = match rule.kind {
        RuleKind::Domain => RouteRule {
            domain_suffix: value,
            ..Default::default()
        },
        RuleKind::Ip => RouteRule {
            ip_cidr: value,
            ..Default::default()
        },
        RuleKind::Process => RouteRule {
            process_name: value,
            ..Default::default()
        },
    };

    match &rule.outbound {
        RuleOutbound::Block => out.action = Some(RuleAction::Reject),
        RuleOutbound::Named(tag) => {
            out.action = Some(RuleAction::Route);
            out.outbound = Some(tag.clone());
        }
    }
    out
}

fn dns_section(settings: &Settings) -> DnsSection {
    let mut rules = Vec::new();
    if settings.routing_mode == RoutingMode::Smart && !settings.local_domains.is_empty() {
        rules.push(DnsRule {
            domain_suffix: settings.local_domains.clone(),
            server: LOCAL_DNS_TAG.to_string(),
        });
    }

    DnsSection {
        servers: vec![
            DnsServer {
                tag: REMOTE_DNS_TAG.to_string(),
                kind: "udp".to_string(),
                server: Some(REMOTE_DNS_SERVER.to_string()),
                detour: Some(PROXY_TAG.to_string()),
            },
            DnsServer {
                tag: LOCAL_DNS_TAG.to_string(),
                kind: "local".to_string(),
                server: None,
                detour: None,
            },
        ],
        rules,
        final_server: REMOTE_DNS_TAG.to_string(),
        strategy: "ipv4_only".to_string(),
    }
}
