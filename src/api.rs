use crate::{
    command::CommandRunner,
    services::{
        bridge::{BridgeConfig, BridgeStatus, BridgeSupervisor, ParityMode, ProcessControl},
        config_store::ConfigStore,
        device::list_serial_devices,
        network::{
            ActiveNetworkState, FallbackNetworkConfig, NetworkApplier, NetworkInspector,
            NetworkSettings,
        },
    },
};
use actix_web::{HttpResponse, Responder, web};
use anyhow::{Context, Result};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;

// ============================================================================
// Payloads
// ============================================================================

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StartBridgePayload {
    #[validate(min_length = 1)]
    pub device: String,
    #[validate(minimum = 1)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub parity: ParityMode,
    #[validate(minimum = 1)]
    pub port: u16,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SetNetworkPayload {
    /// Connection to modify; the currently active one if omitted
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(flatten)]
    pub settings: NetworkSettings,
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FallbackPayload {
    #[validate(min_length = 1)]
    pub fallback_ip: String,
    #[validate(min_length = 1)]
    pub fallback_gw: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub bridge: BridgeStatus,
    pub network: ActiveNetworkState,
    pub current_address: Option<Ipv4Addr>,
    pub fallback: FallbackNetworkConfig,
    pub devices: Vec<PathBuf>,
}

// ============================================================================
// Handlers
// ============================================================================

pub struct Api<Runner, Process>
where
    Runner: CommandRunner + Send + Sync + 'static,
    Process: ProcessControl + Send + 'static,
{
    pub supervisor: Arc<Mutex<BridgeSupervisor<Process>>>,
    pub inspector: NetworkInspector<Runner>,
    pub applier: NetworkApplier<Runner>,
    pub store: Arc<ConfigStore>,
    pub device_dir: PathBuf,
}

impl<Runner, Process> Clone for Api<Runner, Process>
where
    Runner: CommandRunner + Send + Sync + 'static,
    Process: ProcessControl + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            inspector: self.inspector.clone(),
            applier: self.applier.clone(),
            store: self.store.clone(),
            device_dir: self.device_dir.clone(),
        }
    }
}

impl<Runner, Process> Api<Runner, Process>
where
    Runner: CommandRunner + Send + Sync + 'static,
    Process: ProcessControl + Send + 'static,
{
    pub fn new(
        supervisor: Arc<Mutex<BridgeSupervisor<Process>>>,
        runner: Arc<Runner>,
        store: Arc<ConfigStore>,
        device_dir: impl AsRef<Path>,
    ) -> Self {
        Api {
            supervisor,
            inspector: NetworkInspector::new(runner.clone()),
            applier: NetworkApplier::new(runner),
            store,
            device_dir: device_dir.as_ref().to_path_buf(),
        }
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        debug!("status() called");

        let bridge = api.supervisor.lock().await.status();

        HttpResponse::Ok().json(Overview {
            bridge,
            network: api.inspector.current().await,
            current_address: api.inspector.current_address().await,
            fallback: api.store.load().fallback(),
            devices: list_serial_devices(&api.device_dir),
        })
    }

    pub async fn start_bridge(
        body: web::Json<StartBridgePayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("start_bridge() called: {body:?}");

        let config = match Self::bridge_config(body.into_inner()) {
            Ok(config) => config,
            Err(e) => return bad_request("start_bridge", e),
        };

        let status = api.supervisor.lock().await.start(config).await;

        if status.running {
            HttpResponse::Ok().json(status)
        } else {
            HttpResponse::InternalServerError().json(status)
        }
    }

    pub async fn stop_bridge(api: web::Data<Self>) -> impl Responder {
        debug!("stop_bridge() called");
        HttpResponse::Ok().json(api.supervisor.lock().await.stop().await)
    }

    pub async fn devices(api: web::Data<Self>) -> impl Responder {
        debug!("devices() called");
        HttpResponse::Ok().json(list_serial_devices(&api.device_dir))
    }

    pub async fn network(api: web::Data<Self>) -> impl Responder {
        debug!("network() called");
        HttpResponse::Ok().json(api.inspector.current().await)
    }

    /// Hands the request to the network manager in the background; the address
    /// may change under the caller, so the answer does not wait for the outcome.
    pub async fn set_network(
        body: web::Json<SetNetworkPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("set_network() called: {body:?}");

        let SetNetworkPayload {
            connection_name,
            settings,
        } = body.into_inner();
        let api = api.into_inner();

        tokio::spawn(async move {
            let connection_name = match connection_name.filter(|name| !name.is_empty()) {
                Some(name) => name,
                None => api
                    .inspector
                    .current()
                    .await
                    .connection_name_or_unknown()
                    .to_string(),
            };

            if let Err(e) = api.applier.apply(&connection_name, &settings).await {
                error!("set_network failed: {e:#}");
            }
        });

        HttpResponse::Accepted().finish()
    }

    pub async fn set_fallback(
        body: web::Json<FallbackPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("set_fallback() called: {body:?}");

        let fallback = match Self::fallback_config(body.into_inner()) {
            Ok(fallback) => fallback,
            Err(e) => return bad_request("set_fallback", e),
        };

        match api.store.save_fallback(&fallback) {
            Ok(()) => HttpResponse::Ok().json(fallback),
            Err(e) => {
                error!("set_fallback failed: {e:#}");
                HttpResponse::InternalServerError().body(e.to_string())
            }
        }
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    fn bridge_config(payload: StartBridgePayload) -> Result<BridgeConfig> {
        payload.validate().context("bridge validation failed")?;
        BridgeConfig::new(payload.device, payload.baud, payload.parity, payload.port)
    }

    fn fallback_config(payload: FallbackPayload) -> Result<FallbackNetworkConfig> {
        payload.validate().context("fallback validation failed")?;
        FallbackNetworkConfig::parse(&payload.fallback_ip, &payload.fallback_gw)
    }
}

fn bad_request(operation: &str, e: anyhow::Error) -> HttpResponse {
    warn!("{operation} rejected: {e:#}");
    HttpResponse::BadRequest().body(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payload_defaults_parity_and_baud() {
        let payload: StartBridgePayload =
            serde_json::from_str(r#"{"device": "/dev/ttyUSB0", "port": 5000}"#).unwrap();

        assert_eq!(payload.parity, ParityMode::None8N1);
        assert!(payload.baud.is_none());
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn start_payload_rejects_zero_port() {
        let payload: StartBridgePayload =
            serde_json::from_str(r#"{"device": "/dev/ttyUSB0", "port": 0, "baud": 9600}"#)
                .unwrap();

        assert!(payload.validate().is_err());
    }

    #[test]
    fn start_payload_rejects_empty_device() {
        let payload: StartBridgePayload =
            serde_json::from_str(r#"{"device": "", "port": 5000, "parity": "8E1"}"#).unwrap();

        assert!(payload.validate().is_err());
    }

    #[test]
    fn network_payload_flattens_settings() {
        let payload: SetNetworkPayload = serde_json::from_str(
            r#"{"connectionName": "eth0", "method": "manual", "address": "10.0.0.5/24"}"#,
        )
        .unwrap();

        assert_eq!(payload.connection_name.as_deref(), Some("eth0"));
        assert!(matches!(payload.settings, NetworkSettings::Manual { .. }));

        let payload: SetNetworkPayload = serde_json::from_str(r#"{"method": "auto"}"#).unwrap();
        assert!(payload.connection_name.is_none());
        assert_eq!(payload.settings, NetworkSettings::Auto);
    }
}
