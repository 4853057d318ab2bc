//! `vless://` share-link parsing.
//!
//! ```text
//! vless://<uuid>@<host>:<port>?type=ws&security=tls&sni=..&path=..#<name>
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::LinkError;

pub const SCHEME: &str = "vless";
const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain stream, no transport block.
    Tcp,
    Ws,
    Grpc,
    /// HTTP upgrade transport.
    Http,
}

impl Transport {
    fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("ws") => Self::Ws,
            Some("grpc") => Self::Grpc,
            Some("http") => Self::Http,
            _ => Self::Tcp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ws => write!(f, "ws"),
            Self::Grpc => write!(f, "grpc"),
            Self::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    /// TLS camouflage with an embedded key exchange (public key + short id).
    Reality,
}

impl Security {
    fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("tls") => Self::Tls,
            Some("reality") => Self::Reality,
            _ => Self::None,
        }
    }
}

/// Parsed connection parameters. Construct with [`ConnectionDescriptor::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub user_id: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub service_name: Option<String>,
    pub flow: Option<String>,
    pub name: Option<String>,
}

impl ConnectionDescriptor {
    pub fn parse(link: &str) -> Result<Self, LinkError> {
        let url = Url::parse(link.trim()).map_err(|e| LinkError::Malformed(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(LinkError::Scheme(url.scheme().to_string()));
        }

        let user_id = decode_component(url.username());
        if user_id.is_empty() {
            return Err(LinkError::MissingIdentity);
        }

        let host = url
            .host_str()
            .map(|h| h.trim_matches(['[', ']']).to_string())
            .filter(|h| !h.is_empty())
            .ok_or(LinkError::MissingHost)?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let params = query_map(&url);
        let param = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

        let descriptor = Self {
            user_id,
            host,
            port,
            transport: Transport::from_param(params.get("type").map(String::as_str)),
            security: Security::from_param(params.get("security").map(String::as_str)),
            sni: param("sni"),
            fingerprint: param("fp"),
            public_key: param("pbk"),
            short_id: param("sid"),
            path: param("path"),
            host_header: param("host"),
            service_name: param("serviceName"),
            flow: param("flow"),
            name: url
                .fragment()
                .map(decode_component)
                .filter(|n| !n.is_empty()),
        };
        if descriptor.security == Security::Reality && descriptor.public_key.is_none() {
            return Err(LinkError::MissingPublicKey);
        }
        Ok(descriptor)
    }

    /// Profile label: the link fragment, or the host when there is none.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.host)
    }

    #[must_use]
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// First occurrence of each key wins, values already percent-decoded.
fn query_map(url: &Url) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
