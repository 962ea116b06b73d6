use super::Ipv4Cidr;
use crate::command::{CommandRunner, args};
use anyhow::{Result, ensure};
use log::info;
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, sync::Arc};

/// Target IPv4 configuration of a connection
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum NetworkSettings {
    /// DHCP; clears any configured address, gateway and DNS
    Auto,
    Manual {
        address: Ipv4Cidr,
        gateway: Option<Ipv4Addr>,
        dns: Option<Ipv4Addr>,
    },
}

/// Issues reconfiguration commands to NetworkManager
///
/// The connection is brought up with `--wait 0`, so `apply` returns once the
/// network manager accepted the request, without waiting for the link to converge.
pub struct NetworkApplier<R> {
    runner: Arc<R>,
}

impl<R> Clone for NetworkApplier<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
        }
    }
}

impl<R> NetworkApplier<R>
where
    R: CommandRunner + Send + Sync,
{
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    /// Reconfigure `connection_name` and bring it up
    ///
    /// # Arguments
    /// * `connection_name` - NetworkManager connection to modify
    /// * `settings` - Automatic or manual IPv4 settings
    ///
    /// # Returns
    /// Error with exit status and stderr of the first failing nmcli call
    pub async fn apply(&self, connection_name: &str, settings: &NetworkSettings) -> Result<()> {
        ensure!(!connection_name.is_empty(), "connection name is missing");
        info!("apply network settings to {connection_name:?}: {settings:?}");

        self.runner
            .run("nmcli", &modify_args(connection_name, settings))
            .await?
            .ensure_success(&format!("modify connection {connection_name:?}"))?;

        self.runner
            .run(
                "nmcli",
                &args(["--wait", "0", "connection", "up", connection_name]),
            )
            .await?
            .ensure_success(&format!("bring up connection {connection_name:?}"))?;

        Ok(())
    }
}

fn modify_args(connection_name: &str, settings: &NetworkSettings) -> Vec<String> {
    let (method, address, gateway, dns) = match settings {
        NetworkSettings::Auto => ("auto", String::new(), String::new(), String::new()),
        NetworkSettings::Manual {
            address,
            gateway,
            dns,
        } => (
            "manual",
            address.to_string(),
            gateway.map(|gw| gw.to_string()).unwrap_or_default(),
            dns.map(|dns| dns.to_string()).unwrap_or_default(),
        ),
    };

    args([
        "connection".to_string(),
        "modify".to_string(),
        connection_name.to_string(),
        "ipv4.method".to_string(),
        method.to_string(),
        "ipv4.addresses".to_string(),
        address,
        "ipv4.gateway".to_string(),
        gateway,
        "ipv4.dns".to_string(),
        dns,
    ])
}
