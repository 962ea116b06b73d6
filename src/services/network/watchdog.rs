//! Boot-time network watchdog
//!
//! Runs once before anything else is exposed. A manually configured address is
//! never touched and a DHCP lease that arrives within the timeout wins; only when
//! DHCP is configured but does not complete is the fallback address applied.

use super::{
    DEFAULT_FALLBACK_DNS, FallbackNetworkConfig, Ipv4Method, NetworkApplier, NetworkInspector,
    NetworkSettings,
};
use crate::{command::CommandRunner, services::config_store::ConfigStore};
use log::{debug, error, info, warn};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub dhcp_timeout: Duration,
    pub poll_interval: Duration,
    pub fallback_dns: Ipv4Addr,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            dhcp_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            fallback_dns: DEFAULT_FALLBACK_DNS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The operator pinned a static address
    ManualConfigured,
    /// DHCP delivered a usable address
    DhcpBound(Ipv4Addr),
    /// DHCP timed out (or no connection was found) and the fallback was requested
    FallbackApplied {
        connection_name: String,
        fallback: FallbackNetworkConfig,
        /// Whether the network manager accepted the request
        accepted: bool,
    },
}

pub struct NetworkWatchdog<R> {
    inspector: NetworkInspector<R>,
    applier: NetworkApplier<R>,
    store: Arc<ConfigStore>,
    config: WatchdogConfig,
}

impl<R> NetworkWatchdog<R>
where
    R: CommandRunner + Send + Sync,
{
    pub fn new(
        inspector: NetworkInspector<R>,
        applier: NetworkApplier<R>,
        store: Arc<ConfigStore>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            inspector,
            applier,
            store,
            config,
        }
    }

    pub async fn run_once(&self) -> WatchdogOutcome {
        info!(
            "network watchdog: checking connection (timeout {}s)",
            self.config.dhcp_timeout.as_secs()
        );

        let network = self.inspector.current().await;

        if network.method == Ipv4Method::Manual {
            info!("static address configured, skipping fallback");
            return WatchdogOutcome::ManualConfigured;
        }

        if network.connection_name.is_some() {
            match timeout(self.config.dhcp_timeout, self.wait_for_dhcp()).await {
                Ok(addr) => {
                    info!("DHCP succeeded: {addr}");
                    return WatchdogOutcome::DhcpBound(addr);
                }
                Err(_) => warn!(
                    "DHCP did not complete within {}s",
                    self.config.dhcp_timeout.as_secs()
                ),
            }
        } else {
            warn!("no network connection identified, applying fallback immediately");
        }

        let fallback = self.store.load().fallback();
        let connection_name = network.connection_name_or_unknown().to_string();

        warn!(
            "applying fallback address {} via {} to {connection_name:?}",
            fallback.address, fallback.gateway
        );

        let settings = NetworkSettings::Manual {
            address: fallback.address,
            gateway: Some(fallback.gateway),
            dns: Some(self.config.fallback_dns),
        };

        let accepted = match self.applier.apply(&connection_name, &settings).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to apply fallback address: {e:#}");
                false
            }
        };

        WatchdogOutcome::FallbackApplied {
            connection_name,
            fallback,
            accepted,
        }
    }

    /// Poll until a non link-local address is assigned
    async fn wait_for_dhcp(&self) -> Ipv4Addr {
        loop {
            match self.inspector.current_address().await {
                Some(addr) if !addr.is_link_local() => return addr,
                Some(addr) => debug!("link-local address {addr}, DHCP still pending"),
                None => debug!("no address yet"),
            }

            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{
            CommandOutput, MockCommandRunner,
            test_support::{failed, ok, scripted},
        },
        services::{config_store::PersistedState, network::DEFAULT_FALLBACK_ADDRESS},
    };
    use anyhow::Result;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;

    const ACTIVE: &str = "Wired connection 1:802-3-ethernet\n";

    struct Harness {
        _dir: TempDir,
        store: Arc<ConfigStore>,
        applied: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("should create temp dir");
            let store = Arc::new(ConfigStore::new(dir.path().join("serial_config.json")));
            Self {
                _dir: dir,
                store,
                applied: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Runner answering nmcli queries with `active`/`method` and `hostname -I`
        /// with the successive entries of `addresses` (the last one repeats)
        fn watchdog(
            &self,
            active: &'static str,
            method: &'static str,
            addresses: Vec<&'static str>,
        ) -> NetworkWatchdog<MockCommandRunner> {
            let applied = self.applied.clone();
            let polls = AtomicUsize::new(0);

            let runner = Arc::new(scripted(move |program, args| -> Result<CommandOutput> {
                match program {
                    "hostname" => {
                        let n = polls.fetch_add(1, Ordering::SeqCst);
                        let addr = addresses.get(n).or(addresses.last()).copied().unwrap_or("");
                        ok(addr)
                    }
                    "nmcli" if args.iter().any(|a| a == "modify" || a == "up") => {
                        applied.lock().unwrap().push(args.to_vec());
                        ok("")
                    }
                    "nmcli" if args.iter().any(|a| a == "--active") => ok(active),
                    "nmcli" if args.last().is_some_and(|a| a == "show") => ok(""),
                    "nmcli" => ok(method),
                    _ => failed(127, "unexpected command"),
                }
            }));

            NetworkWatchdog::new(
                NetworkInspector::new(runner.clone()),
                NetworkApplier::new(runner),
                self.store.clone(),
                WatchdogConfig {
                    dhcp_timeout: Duration::from_millis(100),
                    poll_interval: Duration::from_millis(10),
                    fallback_dns: DEFAULT_FALLBACK_DNS,
                },
            )
        }

        fn modify_calls(&self) -> Vec<Vec<String>> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .filter(|args| args.get(1).is_some_and(|a| a == "modify"))
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn manual_method_is_never_overridden() {
        let harness = Harness::new();
        let watchdog = harness.watchdog(ACTIVE, "ipv4.method:manual\n", vec![""]);

        assert_eq!(watchdog.run_once().await, WatchdogOutcome::ManualConfigured);
        assert!(harness.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dhcp_address_within_timeout_wins() {
        let harness = Harness::new();
        let watchdog = harness.watchdog(
            ACTIVE,
            "ipv4.method:auto\n",
            vec!["", "169.254.10.2", "", "192.168.1.77"],
        );

        assert_eq!(
            watchdog.run_once().await,
            WatchdogOutcome::DhcpBound(Ipv4Addr::new(192, 168, 1, 77))
        );
        assert!(harness.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_local_until_timeout_applies_defaults_once() {
        let harness = Harness::new();
        let watchdog = harness.watchdog(ACTIVE, "ipv4.method:auto\n", vec!["169.254.3.4"]);

        let outcome = watchdog.run_once().await;

        assert_eq!(
            outcome,
            WatchdogOutcome::FallbackApplied {
                connection_name: "Wired connection 1".to_string(),
                fallback: FallbackNetworkConfig::default(),
                accepted: true,
            }
        );

        let modify = harness.modify_calls();
        assert_eq!(modify.len(), 1);
        assert_eq!(
            modify[0],
            vec![
                "connection",
                "modify",
                "Wired connection 1",
                "ipv4.method",
                "manual",
                "ipv4.addresses",
                "192.168.1.233/24",
                "ipv4.gateway",
                "192.168.1.1",
                "ipv4.dns",
                "114.114.114.114",
            ]
        );
    }

    #[tokio::test]
    async fn timeout_uses_persisted_fallback() {
        let harness = Harness::new();
        harness
            .store
            .save(&PersistedState {
                fallback_ip: Some("10.20.0.9/16".to_string()),
                fallback_gw: Some("10.20.0.1".to_string()),
                ..Default::default()
            })
            .unwrap();
        let watchdog = harness.watchdog(ACTIVE, "ipv4.method:auto\n", vec![""]);

        let WatchdogOutcome::FallbackApplied { fallback, .. } = watchdog.run_once().await else {
            panic!("fallback should have been applied");
        };

        assert_eq!(fallback.address.to_string(), "10.20.0.9/16");
        let modify = harness.modify_calls();
        assert_eq!(modify.len(), 1);
        assert_eq!(modify[0][6], "10.20.0.9/16");
        assert_eq!(modify[0][8], "10.20.0.1");
    }

    #[tokio::test]
    async fn unknown_connection_applies_fallback_without_waiting() {
        let harness = Harness::new();
        let watchdog = harness.watchdog("", "", vec!["192.168.1.5"]);

        let WatchdogOutcome::FallbackApplied {
            connection_name,
            fallback,
            ..
        } = watchdog.run_once().await
        else {
            panic!("fallback should have been applied");
        };

        assert_eq!(connection_name, "Unknown");
        assert_eq!(fallback.address, DEFAULT_FALLBACK_ADDRESS);
        assert_eq!(harness.modify_calls().len(), 1);
    }

    #[tokio::test]
    async fn rejected_fallback_is_reported_not_raised() {
        let harness = Harness::new();
        let runner = Arc::new(scripted(|program, args| match program {
            "nmcli" if args.iter().any(|a| a == "--active") => ok(ACTIVE),
            "nmcli" if args.iter().any(|a| a == "modify") => failed(10, "Error: failed"),
            "nmcli" => ok("ipv4.method:auto\n"),
            _ => ok(""),
        }));
        let watchdog = NetworkWatchdog::new(
            NetworkInspector::new(runner.clone()),
            NetworkApplier::new(runner),
            harness.store.clone(),
            WatchdogConfig {
                dhcp_timeout: Duration::from_millis(30),
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let WatchdogOutcome::FallbackApplied { accepted, .. } = watchdog.run_once().await else {
            panic!("fallback should have been attempted");
        };
        assert!(!accepted);
    }
}
