//! Network reachability: inspection, reconfiguration and the boot watchdog.

pub mod applier;
pub mod inspector;
pub mod watchdog;

pub use applier::{NetworkApplier, NetworkSettings};
pub use inspector::NetworkInspector;
pub use watchdog::{NetworkWatchdog, WatchdogConfig, WatchdogOutcome};

use anyhow::{Context, Result, anyhow, ensure};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr, str::FromStr};

pub const DEFAULT_FALLBACK_ADDRESS: Ipv4Cidr = Ipv4Cidr {
    addr: Ipv4Addr::new(192, 168, 1, 233),
    prefix: 24,
};
pub const DEFAULT_FALLBACK_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const DEFAULT_FALLBACK_DNS: Ipv4Addr = Ipv4Addr::new(114, 114, 114, 114);

/// Connection name reported when the network manager knows no usable connection
pub const UNKNOWN_CONNECTION: &str = "Unknown";

/// IPv4 address with prefix length, e.g. `192.168.1.233/24`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        ensure!(prefix <= 32, "invalid prefix length: {prefix}");
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| anyhow!("missing prefix length in {s:?}"))?;

        let addr = addr
            .parse::<Ipv4Addr>()
            .context(format!("invalid IPv4 address in {s:?}"))?;
        let prefix = prefix
            .parse::<u8>()
            .context(format!("invalid prefix length in {s:?}"))?;

        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ipv4Method {
    #[default]
    Auto,
    Manual,
}

impl Ipv4Method {
    /// Map an nmcli `ipv4.method` value; only an explicit `manual` pins the address
    pub fn from_nmcli(value: &str) -> Self {
        if value.trim() == "manual" {
            Self::Manual
        } else {
            Self::Auto
        }
    }

    pub fn as_nmcli(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Read-only snapshot of the connection currently driving the host's network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveNetworkState {
    /// `None` if no connection could be identified
    pub connection_name: Option<String>,
    pub method: Ipv4Method,
    pub address: Option<Ipv4Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

impl ActiveNetworkState {
    /// Connection name for display and for commands, `Unknown` if none was identified
    pub fn connection_name_or_unknown(&self) -> &str {
        self.connection_name.as_deref().unwrap_or(UNKNOWN_CONNECTION)
    }
}

/// Static configuration applied when DHCP does not complete during boot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackNetworkConfig {
    pub address: Ipv4Cidr,
    pub gateway: Ipv4Addr,
}

impl Default for FallbackNetworkConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_FALLBACK_ADDRESS,
            gateway: DEFAULT_FALLBACK_GATEWAY,
        }
    }
}

impl FallbackNetworkConfig {
    pub fn parse(address: &str, gateway: &str) -> Result<Self> {
        let address = address.parse().context("invalid fallback address")?;
        let gateway = gateway
            .trim()
            .parse()
            .context(format!("invalid fallback gateway: {gateway:?}"))?;

        Ok(Self { address, gateway })
    }

    /// Build from persisted fields, falling back to the built-in defaults per field
    pub fn from_persisted(address: Option<&str>, gateway: Option<&str>) -> Self {
        let defaults = Self::default();

        let address = address
            .map(|s| {
                s.parse().unwrap_or_else(|e| {
                    warn!("ignoring persisted fallback address {s:?}: {e:#}");
                    defaults.address
                })
            })
            .unwrap_or(defaults.address);

        let gateway = gateway
            .map(|s| {
                s.trim().parse().unwrap_or_else(|e| {
                    warn!("ignoring persisted fallback gateway {s:?}: {e}");
                    defaults.gateway
                })
            })
            .unwrap_or(defaults.gateway);

        Self { address, gateway }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod ipv4_cidr {
        use super::*;

        #[test]
        fn parses_and_displays() {
            let cidr: Ipv4Cidr = "192.168.0.200/24".parse().unwrap();
            assert_eq!(cidr.addr(), Ipv4Addr::new(192, 168, 0, 200));
            assert_eq!(cidr.prefix(), 24);
            assert_eq!(cidr.to_string(), "192.168.0.200/24");
        }

        #[test]
        fn rejects_missing_prefix() {
            assert!("192.168.0.200".parse::<Ipv4Cidr>().is_err());
        }

        #[test]
        fn rejects_prefix_above_32() {
            assert!("10.0.0.1/33".parse::<Ipv4Cidr>().is_err());
        }

        #[test]
        fn rejects_garbage_address() {
            assert!("10.0.0/8".parse::<Ipv4Cidr>().is_err());
            assert!("fe80::1/64".parse::<Ipv4Cidr>().is_err());
        }

        #[test]
        fn serializes_as_string() {
            let json = serde_json::to_string(&DEFAULT_FALLBACK_ADDRESS).unwrap();
            assert_eq!(json, "\"192.168.1.233/24\"");

            let back: Ipv4Cidr = serde_json::from_str(&json).unwrap();
            assert_eq!(back, DEFAULT_FALLBACK_ADDRESS);
        }
    }

    mod method {
        use super::*;

        #[test]
        fn only_manual_is_manual() {
            assert_eq!(Ipv4Method::from_nmcli("manual"), Ipv4Method::Manual);
            assert_eq!(Ipv4Method::from_nmcli(" manual "), Ipv4Method::Manual);
            assert_eq!(Ipv4Method::from_nmcli("auto"), Ipv4Method::Auto);
            assert_eq!(Ipv4Method::from_nmcli("link-local"), Ipv4Method::Auto);
            assert_eq!(Ipv4Method::from_nmcli("disabled"), Ipv4Method::Auto);
        }
    }

    mod fallback {
        use super::*;

        #[test]
        fn defaults_when_unset() {
            let fallback = FallbackNetworkConfig::from_persisted(None, None);
            assert_eq!(fallback, FallbackNetworkConfig::default());
            assert_eq!(fallback.address.to_string(), "192.168.1.233/24");
            assert_eq!(fallback.gateway.to_string(), "192.168.1.1");
        }

        #[test]
        fn uses_persisted_values() {
            let fallback =
                FallbackNetworkConfig::from_persisted(Some("10.0.0.5/16"), Some("10.0.0.1"));
            assert_eq!(fallback.address.to_string(), "10.0.0.5/16");
            assert_eq!(fallback.gateway, Ipv4Addr::new(10, 0, 0, 1));
        }

        #[test]
        fn invalid_persisted_field_falls_back_individually() {
            let fallback = FallbackNetworkConfig::from_persisted(Some("garbage"), Some("10.0.0.1"));
            assert_eq!(fallback.address, DEFAULT_FALLBACK_ADDRESS);
            assert_eq!(fallback.gateway, Ipv4Addr::new(10, 0, 0, 1));
        }

        #[test]
        fn parse_requires_both_fields_valid() {
            assert!(FallbackNetworkConfig::parse("10.0.0.5/16", "10.0.0.1").is_ok());
            assert!(FallbackNetworkConfig::parse("10.0.0.5", "10.0.0.1").is_err());
            assert!(FallbackNetworkConfig::parse("10.0.0.5/16", "").is_err());
        }
    }
}
