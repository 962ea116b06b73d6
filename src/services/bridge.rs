//! Serial-to-TCP bridge supervision
//!
//! Exactly one bridge process (socat by default) relays bytes between a serial
//! device and any number of TCP clients. The supervisor starts, replaces and
//! stops it, and notices a crashed bridge the next time somebody asks for the
//! status. There is no background monitor.

use crate::{
    command::{CommandRunner, args},
    services::config_store::{ConfigStore, PersistedState},
};
use anyhow::{Context, Result, ensure};
use log::{debug, error, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::process::{Child, Command};
use trait_variant::make;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Pause after signalling old instances so the listen port is released
const TERMINATION_GRACE: Duration = Duration::from_millis(200);

// ============================================================================
// Bridge parameters
// ============================================================================

/// Serial framing. Data bits are always 8 and there is always one stop bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ParityMode {
    #[default]
    #[serde(rename = "8N1")]
    None8N1,
    #[serde(rename = "8E1")]
    Even8E1,
    #[serde(rename = "8O1")]
    Odd8O1,
}

impl ParityMode {
    /// Framing flags in the bridge executable's address grammar
    pub fn framing(&self) -> &'static str {
        match self {
            Self::None8N1 => "cs8,parenb=0,cstopb=0",
            Self::Even8E1 => "cs8,parenb=1,parodd=0,cstopb=0",
            Self::Odd8O1 => "cs8,parenb=1,parodd=1,cstopb=0",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub device: PathBuf,
    pub baud_rate: u32,
    pub parity: ParityMode,
    pub listen_port: u16,
}

impl BridgeConfig {
    /// Validate bridge parameters; a missing baud rate defaults to 9600
    pub fn new(
        device: impl Into<PathBuf>,
        baud_rate: Option<u32>,
        parity: ParityMode,
        listen_port: u16,
    ) -> Result<Self> {
        let device = device.into();
        let baud_rate = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

        ensure!(!device.as_os_str().is_empty(), "device is missing");
        ensure!(
            !device.to_string_lossy().contains(','),
            "invalid device path: {device:?}"
        );
        ensure!(baud_rate > 0, "invalid baud rate: {baud_rate}");
        ensure!(listen_port > 0, "invalid listen port: {listen_port}");

        Ok(Self {
            device,
            baud_rate,
            parity,
            listen_port,
        })
    }

    /// Arguments for the bridge executable: TCP listener first, serial device second
    pub fn bridge_args(&self) -> Vec<String> {
        args([
            format!("TCP-LISTEN:{},fork,reuseaddr,nodelay", self.listen_port),
            format!(
                "FILE:{},b{},{},raw,echo=0",
                self.device.display(),
                self.baud_rate,
                self.parity.framing()
            ),
        ])
    }

    fn persisted(&self, running: bool) -> PersistedState {
        PersistedState {
            running: Some(running),
            device: Some(self.device.clone()),
            baud: Some(self.baud_rate),
            parity: Some(self.parity),
            port: Some(self.listen_port),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    #[default]
    Stopped,
    Starting,
    Running,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub running: bool,
    /// Parameters of the running bridge, or of the last one started
    pub config: Option<BridgeConfig>,
}

/// Result of the boot-time recovery attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Persisted state does not ask for a running bridge
    NotRequested,
    /// Persisted state lacks device or port
    Incomplete,
    /// The recorded device is not present; recovery is not retried
    DeviceMissing(PathBuf),
    Started(BridgeStatus),
}

// ============================================================================
// Process access
// ============================================================================

/// Handle to a spawned bridge process
pub trait ChildProcess: Send {
    /// `None` once the process has been reaped
    fn pid(&self) -> Option<u32>;
    fn has_exited(&mut self) -> bool;
}

impl ChildProcess for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                info!("bridge process exited: {status}");
                true
            }
            Err(e) => {
                error!("failed to query bridge process: {e}");
                true
            }
        }
    }
}

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ProcessControl {
    fn spawn(&self, program: &Path, args: &[String]) -> Result<Box<dyn ChildProcess>>;
    /// Send a termination signal to a single process
    async fn terminate(&self, pid: u32) -> Result<()>;
    /// Terminate every running instance of `program`; `true` if any was found
    async fn terminate_all(&self, program: &Path) -> Result<bool>;
}

/// Process control on the host: `tokio::process` for spawning, `kill`/`pkill` for signals
pub struct SystemProcessControl<R> {
    runner: Arc<R>,
}

impl<R> SystemProcessControl<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }
}

impl<R> ProcessControl for SystemProcessControl<R>
where
    R: CommandRunner + Send + Sync,
{
    fn spawn(&self, program: &Path, args: &[String]) -> Result<Box<dyn ChildProcess>> {
        debug!("spawn {program:?} {}", args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .context(format!("failed to spawn {program:?}"))?;

        Ok(Box::new(child))
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        self.runner
            .run("kill", &args(["-TERM".to_string(), pid.to_string()]))
            .await?
            .ensure_success(&format!("signal process {pid}"))?;

        Ok(())
    }

    async fn terminate_all(&self, program: &Path) -> Result<bool> {
        let name = program
            .file_name()
            .context(format!("invalid executable path: {program:?}"))?
            .to_string_lossy()
            .into_owned();

        let output = self.runner.run("pkill", &args(["-TERM", "-x", &name])).await?;

        // pkill: 0 = processes signalled, 1 = nothing matched
        match output.status {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => output
                .ensure_success(&format!("terminate {name} instances"))
                .map(|_| false),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct TrackedBridge {
    process: Box<dyn ChildProcess>,
    config: BridgeConfig,
}

/// Owner of the single bridge process and its persisted desired state
pub struct BridgeSupervisor<P> {
    process_control: P,
    store: Arc<ConfigStore>,
    executable: PathBuf,
    state: BridgeState,
    tracked: Option<TrackedBridge>,
    last_config: Option<BridgeConfig>,
}

impl<P> BridgeSupervisor<P>
where
    P: ProcessControl,
{
    pub fn new(process_control: P, store: Arc<ConfigStore>, executable: impl Into<PathBuf>) -> Self {
        Self {
            process_control,
            store,
            executable: executable.into(),
            state: BridgeState::Stopped,
            tracked: None,
            last_config: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Replace any bridge instance by a new one running `config`
    ///
    /// Spawn failures are logged and leave the supervisor stopped without touching
    /// the persisted state, so a failed boot restore is tried again on the next
    /// boot. The returned status tells the caller whether the bridge is running.
    pub async fn start(&mut self, config: BridgeConfig) -> BridgeStatus {
        info!("start bridge: {config:?}");
        self.state = BridgeState::Starting;

        let mut terminated = self.terminate_tracked().await;

        match self.process_control.terminate_all(&self.executable).await {
            Ok(found) => {
                if found {
                    info!("terminated stray {:?} instances", self.executable);
                }
                terminated |= found;
            }
            Err(e) => warn!("failed to terminate stray bridge instances: {e:#}"),
        }

        if terminated {
            tokio::time::sleep(TERMINATION_GRACE).await;
        }

        match self
            .process_control
            .spawn(&self.executable, &config.bridge_args())
        {
            Ok(process) => {
                info!(
                    "bridge running (pid {:?}): {} <-> tcp port {}",
                    process.pid(),
                    config.device.display(),
                    config.listen_port
                );

                self.persist(&config.persisted(true));
                self.last_config = Some(config.clone());
                self.tracked = Some(TrackedBridge { process, config });
                self.state = BridgeState::Running;
            }
            Err(e) => {
                error!("failed to start bridge: {e:#}");
                self.last_config = Some(config);
                self.state = BridgeState::Stopped;
            }
        }

        self.snapshot()
    }

    /// Stop the bridge and record that it should stay stopped
    pub async fn stop(&mut self) -> BridgeStatus {
        info!("stop bridge");

        self.terminate_tracked().await;
        self.state = BridgeState::Stopped;
        self.persist(&PersistedState::running(false));

        self.snapshot()
    }

    /// Current status; a bridge that exited on its own is noticed here
    pub fn status(&mut self) -> BridgeStatus {
        let exited = self
            .tracked
            .as_mut()
            .is_some_and(|tracked| tracked.process.has_exited());

        if exited {
            warn!("bridge process is gone, marking stopped");
            self.tracked = None;
            self.state = BridgeState::Stopped;
            self.persist(&PersistedState::running(false));
        }

        self.snapshot()
    }

    /// Restart the bridge recorded as running before the last shutdown
    ///
    /// Recovery is skipped if the recorded device is absent; it is not retried
    /// when the device appears later.
    pub async fn restore_on_boot(&mut self) -> RestoreOutcome {
        let persisted = self.store.load();

        if persisted.running != Some(true) {
            info!("bridge restore not requested");
            return RestoreOutcome::NotRequested;
        }

        let (Some(device), Some(port)) = (persisted.device, persisted.port) else {
            warn!("bridge restore skipped: persisted state lacks device or port");
            return RestoreOutcome::Incomplete;
        };

        if !device.exists() {
            info!("bridge restore skipped: {} not present", device.display());
            return RestoreOutcome::DeviceMissing(device);
        }

        let config = match BridgeConfig::new(
            device,
            persisted.baud,
            persisted.parity.unwrap_or_default(),
            port,
        ) {
            Ok(config) => config,
            Err(e) => {
                warn!("bridge restore skipped: {e:#}");
                return RestoreOutcome::Incomplete;
            }
        };

        info!("restoring bridge");
        RestoreOutcome::Started(self.start(config).await)
    }

    /// Terminate the bridge on service shutdown without touching the persisted
    /// state, so the bridge comes back on the next boot
    pub async fn shutdown(&mut self) {
        if self.terminate_tracked().await {
            info!("bridge terminated for shutdown");
        }
        self.state = BridgeState::Stopped;
    }

    /// Signal the tracked process, if any. Returns whether a signal was sent.
    async fn terminate_tracked(&mut self) -> bool {
        let Some(tracked) = self.tracked.take() else {
            return false;
        };

        let Some(pid) = tracked.process.pid() else {
            debug!("tracked bridge already reaped");
            return false;
        };

        match self.process_control.terminate(pid).await {
            Ok(()) => debug!("sent termination signal to bridge {pid}"),
            Err(e) => warn!("failed to terminate bridge {pid}: {e:#}"),
        }

        true
    }

    fn persist(&self, state: &PersistedState) {
        if let Err(e) = self.store.save(state) {
            error!("failed to persist bridge state: {e:#}");
        }
    }

    fn snapshot(&self) -> BridgeStatus {
        let config = self
            .tracked
            .as_ref()
            .map(|tracked| tracked.config.clone())
            .or_else(|| self.last_config.clone());

        BridgeStatus {
            running: self.state == BridgeState::Running,
            config,
        }
    }
}
