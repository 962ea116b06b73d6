use super::{ActiveNetworkState, Ipv4Cidr, Ipv4Method};
use crate::command::{CommandRunner, args};
use anyhow::Result;
use log::{debug, warn};
use std::{net::Ipv4Addr, sync::Arc};

/// Prefix reported for a live address when the connection has none configured
const LIVE_ADDRESS_PREFIX: u8 = 24;

/// Read-only view of the host's network configuration through nmcli
pub struct NetworkInspector<R> {
    runner: Arc<R>,
}

impl<R> Clone for NetworkInspector<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ConnectionDetails {
    method: Ipv4Method,
    address: Option<Ipv4Cidr>,
    gateway: Option<Ipv4Addr>,
    dns: Option<Ipv4Addr>,
}

impl<R> NetworkInspector<R>
where
    R: CommandRunner + Send + Sync,
{
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    /// Snapshot of the active connection
    ///
    /// Prefers a connection the network manager reports active, falls back to
    /// the first configured ethernet connection. Without either, the snapshot
    /// has no connection name, method `auto` and empty fields.
    pub async fn current(&self) -> ActiveNetworkState {
        let Some(connection_name) = self.connection_name().await else {
            warn!("no network connection found");
            return ActiveNetworkState::default();
        };

        let details = match self.connection_details(&connection_name).await {
            Ok(details) => details,
            Err(e) => {
                warn!("failed to read details of {connection_name:?}: {e:#}");
                ConnectionDetails::default()
            }
        };

        let address = match details.address {
            Some(address) => Some(address),
            None => self
                .current_address()
                .await
                .and_then(|addr| Ipv4Cidr::new(addr, LIVE_ADDRESS_PREFIX).ok()),
        };

        ActiveNetworkState {
            connection_name: Some(connection_name),
            method: details.method,
            address,
            gateway: details.gateway,
            dns: details.dns,
        }
    }

    /// The host's primary IPv4 address, `None` while none is assigned
    pub async fn current_address(&self) -> Option<Ipv4Addr> {
        match self.stdout("hostname", args(["-I"])).await {
            Ok(stdout) => stdout
                .split_whitespace()
                .find_map(|token| token.parse::<Ipv4Addr>().ok()),
            Err(e) => {
                warn!("failed to query current address: {e:#}");
                None
            }
        }
    }

    async fn connection_name(&self) -> Option<String> {
        match self
            .stdout(
                "nmcli",
                args(["-t", "-f", "NAME,TYPE", "connection", "show", "--active"]),
            )
            .await
        {
            Ok(stdout) => {
                if let Some(name) = first_connection(&stdout, |kind| kind != "loopback") {
                    debug!("active connection: {name}");
                    return Some(name);
                }
            }
            Err(e) => warn!("failed to list active connections: {e:#}"),
        }

        match self
            .stdout("nmcli", args(["-t", "-f", "NAME,TYPE", "connection", "show"]))
            .await
        {
            Ok(stdout) => {
                let name = first_connection(&stdout, |kind| kind.contains("ethernet"));
                debug!("configured ethernet connection: {name:?}");
                name
            }
            Err(e) => {
                warn!("failed to list connections: {e:#}");
                None
            }
        }
    }

    async fn connection_details(&self, connection_name: &str) -> Result<ConnectionDetails> {
        let stdout = self
            .stdout(
                "nmcli",
                args([
                    "-t",
                    "-f",
                    "ipv4.method,ipv4.addresses,ipv4.gateway,ipv4.dns",
                    "connection",
                    "show",
                    connection_name,
                ]),
            )
            .await?;

        Ok(parse_connection_details(&stdout))
    }

    async fn stdout(&self, program: &str, args: Vec<String>) -> Result<String> {
        self.runner
            .run(program, &args)
            .await?
            .ensure_success(&format!("run {program} {}", args.join(" ")))
    }
}

/// First connection name in terse `NAME:TYPE` output whose type passes `accept`
fn first_connection(output: &str, accept: impl Fn(&str) -> bool) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = split_terse(line).into_iter();
        let name = fields.next().filter(|name| !name.is_empty())?;
        let kind = fields.next().unwrap_or_default();
        accept(&kind).then_some(name)
    })
}

/// Split a terse nmcli line on unescaped colons
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => field.extend(chars.next()),
            ':' => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    fields.push(field);
    fields
}

/// Extract the IPv4 settings from `key: value` lines, terse or tabular.
/// Empty values and nmcli's `--` placeholder count as absent; for multi-valued
/// fields the first entry is used.
fn parse_connection_details(text: &str) -> ConnectionDetails {
    let mut details = ConnectionDetails::default();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let value = value.trim();
        let first = value
            .split([',', ' '])
            .map(str::trim)
            .find(|v| !v.is_empty() && *v != "--");

        match key.trim() {
            "ipv4.method" => details.method = Ipv4Method::from_nmcli(value),
            "ipv4.addresses" => details.address = first.and_then(|v| v.parse().ok()),
            "ipv4.gateway" => details.gateway = first.and_then(|v| v.parse().ok()),
            "ipv4.dns" => details.dns = first.and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    details
}
