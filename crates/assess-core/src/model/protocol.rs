//! Declared and observed protocols

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport layer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Any,
}

impl Transport {
    /// Does an observed transport satisfy this declared one
    pub fn accepts(&self, observed: Transport) -> bool {
        *self == Transport::Any || observed == Transport::Any || *self == observed
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Any => write!(f, "any"),
        }
    }
}

/// TLS (and SSL) protocol versions, ordered oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "SSLv3")]
    Ssl3,
    #[serde(rename = "TLSv1.0")]
    Tls10,
    #[serde(rename = "TLSv1.1")]
    Tls11,
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match norm.trim_start_matches("tlsv").trim_start_matches("tls") {
            "10" | "1" => Ok(TlsVersion::Tls10),
            "11" => Ok(TlsVersion::Tls11),
            "12" => Ok(TlsVersion::Tls12),
            "13" => Ok(TlsVersion::Tls13),
            "sslv3" | "ssl3" => Ok(TlsVersion::Ssl3),
            _ => Err(format!("unknown TLS version '{}'", s)),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Ssl3 => write!(f, "SSLv3"),
            TlsVersion::Tls10 => write!(f, "TLSv1.0"),
            TlsVersion::Tls11 => write!(f, "TLSv1.1"),
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// Application protocol
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AppProtocol {
    Tls,
    Https,
    Http,
    Ssh,
    Dns,
    Mqtt,
    Mqtts,
    Ntp,
    Other(String),
}

impl AppProtocol {
    /// Protocol provides transport encryption by itself
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            AppProtocol::Tls | AppProtocol::Https | AppProtocol::Ssh | AppProtocol::Mqtts
        )
    }

    /// Well-known server port
    pub fn default_port(&self) -> Option<u16> {
        match self {
            AppProtocol::Tls | AppProtocol::Https => Some(443),
            AppProtocol::Http => Some(80),
            AppProtocol::Ssh => Some(22),
            AppProtocol::Dns => Some(53),
            AppProtocol::Mqtt => Some(1883),
            AppProtocol::Mqtts => Some(8883),
            AppProtocol::Ntp => Some(123),
            AppProtocol::Other(_) => None,
        }
    }

    pub fn default_transport(&self) -> Transport {
        match self {
            AppProtocol::Dns | AppProtocol::Ntp => Transport::Udp,
            AppProtocol::Other(_) => Transport::Any,
            _ => Transport::Tcp,
        }
    }
}

impl FromStr for AppProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let proto = match s.trim().to_lowercase().as_str() {
            "" => return Err("empty protocol name".to_string()),
            "tls" => AppProtocol::Tls,
            "https" => AppProtocol::Https,
            "http" => AppProtocol::Http,
            "ssh" => AppProtocol::Ssh,
            "dns" => AppProtocol::Dns,
            "mqtt" => AppProtocol::Mqtt,
            "mqtts" => AppProtocol::Mqtts,
            "ntp" => AppProtocol::Ntp,
            other => AppProtocol::Other(other.to_string()),
        };
        Ok(proto)
    }
}

impl TryFrom<String> for AppProtocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppProtocol> for String {
    fn from(protocol: AppProtocol) -> Self {
        protocol.to_string()
    }
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppProtocol::Tls => write!(f, "tls"),
            AppProtocol::Https => write!(f, "https"),
            AppProtocol::Http => write!(f, "http"),
            AppProtocol::Ssh => write!(f, "ssh"),
            AppProtocol::Dns => write!(f, "dns"),
            AppProtocol::Mqtt => write!(f, "mqtt"),
            AppProtocol::Mqtts => write!(f, "mqtts"),
            AppProtocol::Ntp => write!(f, "ntp"),
            AppProtocol::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Declared protocol of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub application: AppProtocol,
    pub transport: Transport,
    /// Server port, when declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Minimum acceptable TLS version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tls: Option<TlsVersion>,
    /// Required cipher properties (e.g. "forward-secrecy")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_requirements: Vec<String>,
}

impl Protocol {
    pub fn new(application: AppProtocol) -> Self {
        let transport = application.default_transport();
        Self {
            application,
            transport,
            port: None,
            min_tls: None,
            cipher_requirements: Vec::new(),
        }
    }

    pub fn tls(port: u16) -> Self {
        Self::new(AppProtocol::Tls).with_port(port)
    }

    pub fn http(port: u16) -> Self {
        Self::new(AppProtocol::Http).with_port(port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_min_tls(mut self, version: TlsVersion) -> Self {
        self.min_tls = Some(version);
        self
    }

    pub fn with_cipher_requirement(mut self, requirement: &str) -> Self {
        self.cipher_requirements.push(requirement.to_string());
        self
    }

    /// Declared port, or the application protocol's well-known port
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.application.default_port())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.transport)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parse_and_order() {
        assert_eq!("TLS1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("TLSv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("tls10".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert_eq!("SSLv3".parse::<TlsVersion>().unwrap(), TlsVersion::Ssl3);
        assert!("TLS2.0".parse::<TlsVersion>().is_err());
        assert!(TlsVersion::Tls13 > TlsVersion::Tls12);
        assert!(TlsVersion::Ssl3 < TlsVersion::Tls10);
    }

    #[test]
    fn test_transport_accepts() {
        assert!(Transport::Tcp.accepts(Transport::Tcp));
        assert!(!Transport::Tcp.accepts(Transport::Udp));
        assert!(Transport::Any.accepts(Transport::Udp));
    }

    #[test]
    fn test_effective_port() {
        assert_eq!(Protocol::new(AppProtocol::Https).effective_port(), Some(443));
        assert_eq!(Protocol::tls(8443).effective_port(), Some(8443));
        assert_eq!(Protocol::new(AppProtocol::Other("coap".into())).effective_port(), None);
        assert_eq!(Protocol::new(AppProtocol::Dns).transport, Transport::Udp);
    }

    #[test]
    fn test_protocol_json() {
        let proto: Protocol =
            serde_json::from_str(r#"{"application":"coap","transport":"udp","port":5683}"#)
                .unwrap();
        assert_eq!(proto.application, AppProtocol::Other("coap".to_string()));
        assert_eq!(proto.to_string(), "coap/udp:5683");
    }
}
