//! Network addresses and endpoints

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address of a modeled or observed host
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    Ip(IpAddr),
    /// Hardware (MAC) address, lowercase, colon separated
    Hw(String),
    /// DNS name, lowercase
    Name(String),
}

impl Address {
    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Ip(_))
    }

    fn parse_hw(s: &str) -> Option<String> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return None;
        }
        if parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
        {
            Some(parts.join(":").to_lowercase())
        } else {
            None
        }
    }

    fn valid_name(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= 253
            && s
                .split('.')
                .all(|label| {
                    !label.is_empty()
                        && label.len() <= 63
                        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                })
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Address::Ip(ip));
        }
        if let Some(hw) = Self::parse_hw(s) {
            return Ok(Address::Hw(hw));
        }
        let name = s.trim_end_matches('.').to_lowercase();
        if Self::valid_name(&name) {
            return Ok(Address::Name(name));
        }
        Err(format!("invalid address '{}'", s))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Hw(hw) => write!(f, "{}", hw),
            Address::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Address with an optional port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(address: Address, port: Option<u16>) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.address, self.port) {
            (Address::Ip(IpAddr::V6(ip)), Some(port)) => write!(f, "[{}]:{}", ip, port),
            (address, Some(port)) => write!(f, "{}:{}", address, port),
            (address, None) => write!(f, "{}", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert!(matches!("192.168.0.10".parse::<Address>(), Ok(Address::Ip(_))));
        assert!(matches!("fe80::1".parse::<Address>(), Ok(Address::Ip(_))));
        assert_eq!(
            "AA-BB-CC-00-11-22".parse::<Address>().unwrap(),
            Address::Hw("aa:bb:cc:00:11:22".to_string())
        );
        assert_eq!(
            "API.Example.com.".parse::<Address>().unwrap(),
            Address::Name("api.example.com".to_string())
        );
        assert!("not an address".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let address: Address = serde_json::from_str("\"10.0.0.1\"").unwrap();
        assert_eq!(serde_json::to_string(&address).unwrap(), "\"10.0.0.1\"");
        assert!(serde_json::from_str::<Address>("\"???\"").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let ep = Endpoint::new("10.0.0.1".parse().unwrap(), Some(443));
        assert_eq!(ep.to_string(), "10.0.0.1:443");
        let ep6 = Endpoint::new("::1".parse().unwrap(), Some(22));
        assert_eq!(ep6.to_string(), "[::1]:22");
    }
}
