//! Pairing flow for a device that offers its own access point.
//!
//! The device cannot acknowledge anything it receives, so the session pushes
//! credentials and the backend token blindly, then polls until the device (or
//! the backend on its behalf) reports that it joined the target network. A
//! poll window that runs out still ends in `Success`, marked unconfirmed.

use crate::{
    backend_client::{BackendApi, DeviceConnectionStatus},
    device_client::{ConnectionReport, DeviceTransport},
    services::delivery::Deliverer,
    session::AuthTokenSource,
    storage::SavedNetworks,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_valid::Validate;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval, timeout},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Device address while it broadcasts its own access point
    pub device_address: String,
    pub device_id: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl ProvisioningConfig {
    pub const DEFAULT_DEVICE_ADDRESS: &str = "192.168.4.1";
    pub const DEFAULT_DEVICE_ID: &str = "plant-sensor-001";
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            device_address: Self::DEFAULT_DEVICE_ADDRESS.to_string(),
            device_id: Self::DEFAULT_DEVICE_ID.to_string(),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Configuring,
    Verifying,
    SendingToken,
    Success,
    Error,
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningStatus::Idle => "idle",
            ProvisioningStatus::Scanning => "scanning",
            ProvisioningStatus::Connecting => "connecting",
            ProvisioningStatus::Configuring => "configuring",
            ProvisioningStatus::Verifying => "verifying",
            ProvisioningStatus::SendingToken => "sending_token",
            ProvisioningStatus::Success => "success",
            ProvisioningStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the UI layer sees of a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: ProvisioningStatus,
    pub ssid: Option<String>,
    /// Last user-facing failure, cleared when a new step starts
    pub error: Option<String>,
    /// Address the device reported after joining the target network
    pub device_ip: Option<String>,
    /// `Success` was backed by a positive connection report
    pub confirmed: bool,
    pub closed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// The device reported an address on the target network
    Confirmed { ip: String, token_delivered: bool },
    /// Polling ran out without a report. Wrong credentials look the same as a
    /// device that is still joining.
    Unconfirmed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("invalid Wi-Fi credentials: {0}")]
    Validation(String),

    #[error("no authentication token available, please log in again")]
    AuthTokenUnavailable,

    #[error("failed to send Wi-Fi credentials to the device: {0}")]
    DeliveryFailed(String),

    #[error("provisioning cannot start while the session is {0}")]
    Busy(ProvisioningStatus),

    #[error("provisioning session was closed")]
    Cancelled,
}

#[derive(Debug, Validate)]
struct WifiCredentials {
    #[validate(min_length = 1)]
    ssid: String,
    #[validate(min_length = 1)]
    password: String,
}

pub struct ProvisioningSession<T, B, A> {
    config: ProvisioningConfig,
    transport: T,
    backend: B,
    tokens: A,
    saved_networks: Arc<SavedNetworks>,
    state: watch::Sender<SessionSnapshot>,
    closed: watch::Sender<bool>,
}

impl<T, B, A> ProvisioningSession<T, B, A>
where
    T: DeviceTransport,
    B: BackendApi,
    A: AuthTokenSource,
{
    pub fn new(
        config: ProvisioningConfig,
        transport: T,
        backend: B,
        tokens: A,
        saved_networks: Arc<SavedNetworks>,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        let (closed, _) = watch::channel(false);

        Self {
            config,
            transport,
            backend,
            tokens,
            saved_networks,
            state,
            closed,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ProvisioningStatus {
        self.state.borrow().status
    }

    /// Observe every status change of this session
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Check whether the device access point answers.
    ///
    /// Only a hint for the UI: an unreachable device returns the session to
    /// `Idle` and credentials may still be submitted.
    pub async fn begin(&self) -> bool {
        let started = self.state.send_if_modified(|s| {
            if s.closed || s.status != ProvisioningStatus::Idle {
                return false;
            }
            s.status = ProvisioningStatus::Scanning;
            s.error = None;
            true
        });

        if !started {
            debug!("begin ignored in state {}", self.status());
            return false;
        }

        let address = &self.config.device_address;
        let probe = timeout(self.config.request_timeout, self.transport.probe(address));
        let Ok(reachable) = self.until_closed(probe).await.map(|r| r.unwrap_or(false)) else {
            return false;
        };

        if reachable {
            info!("device answered at {address}");
            self.enter(ProvisioningStatus::Connecting);
        } else {
            info!("device did not answer at {address}");
            self.enter(ProvisioningStatus::Idle);
        }

        reachable
    }

    /// Deliver credentials and token, then wait for the device to join `ssid`
    pub async fn submit_credentials(
        &self,
        ssid: &str,
        password: &str,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        WifiCredentials {
            ssid: ssid.to_string(),
            password: password.to_string(),
        }
        .validate()
        .map_err(|e| ProvisioningError::Validation(e.to_string()))?;

        let token = self.claim(ssid)?;
        let address = self.config.device_address.as_str();
        let deliverer = Deliverer::new(&self.transport, self.config.request_timeout);

        info!("sending credentials for {ssid} to {address}");
        let report = self
            .until_closed(deliverer.credentials(address, ssid, password))
            .await?;

        if report.all_invalid() {
            return Err(self.fail(ProvisioningError::DeliveryFailed(report.summary())));
        }
        if !report.attempted {
            warn!("no credential encoding reached the device, continuing");
        }

        match self.saved_networks.add(ssid) {
            Ok(true) => debug!("saved network {ssid}"),
            Ok(false) => {}
            Err(e) => warn!("failed to save network {ssid}: {e:#}"),
        }

        // only reachable while the device still runs its access point
        let report = self.until_closed(deliverer.token(address, &token)).await?;
        if !report.attempted {
            warn!("token did not reach the device over its access point");
        }

        self.enter(ProvisioningStatus::Verifying);

        let Some(ip) = self.poll_connection().await? else {
            warn!(
                "device did not report joining {ssid} within {} polls, assuming success",
                self.config.poll_attempts
            );
            self.finish(None, None);
            return Ok(ProvisioningOutcome::Unconfirmed);
        };

        self.update(|s| {
            s.status = ProvisioningStatus::SendingToken;
            s.device_ip = Some(ip.clone());
            s.error = None;
        });

        let report = self.until_closed(deliverer.token(&ip, &token)).await?;
        let error = (!report.attempted).then(|| {
            format!(
                "device joined the network but the token could not be delivered: {}",
                report.summary()
            )
        });

        self.finish(Some(ip.clone()), error);

        Ok(ProvisioningOutcome::Confirmed {
            ip,
            token_delivered: report.attempted,
        })
    }

    /// Leave `Error` for `Idle`. Returns false in any other state.
    pub fn retry(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.closed || s.status != ProvisioningStatus::Error {
                return false;
            }
            s.status = ProvisioningStatus::Idle;
            s.error = None;
            true
        })
    }

    /// Discard the session. Stops polling at once; late results are dropped.
    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
        self.closed.send_replace(true);
        info!("provisioning session closed");
    }

    /// Move from `Idle`/`Connecting` to `Configuring` with the current token
    fn claim(&self, ssid: &str) -> Result<String, ProvisioningError> {
        // token sources may do I/O, keep it outside the state lock
        let token = self.tokens.auth_token();
        let mut claimed = Err(ProvisioningError::Cancelled);

        self.state.send_if_modified(|s| {
            if s.closed {
                return false;
            }
            if !matches!(
                s.status,
                ProvisioningStatus::Idle | ProvisioningStatus::Connecting
            ) {
                claimed = Err(ProvisioningError::Busy(s.status));
                return false;
            }

            match token {
                Some(token) => {
                    s.status = ProvisioningStatus::Configuring;
                    s.ssid = Some(ssid.to_string());
                    s.error = None;
                    s.device_ip = None;
                    s.confirmed = false;
                    claimed = Ok(token);
                }
                None => {
                    s.status = ProvisioningStatus::Error;
                    s.error = Some(ProvisioningError::AuthTokenUnavailable.to_string());
                    claimed = Err(ProvisioningError::AuthTokenUnavailable);
                }
            }
            true
        });

        if let Err(e) = &claimed {
            error!("provisioning not started: {e}");
        }
        claimed
    }

    /// Poll once per interval, at most `poll_attempts` times.
    ///
    /// Every poll is cut off at the next tick, so a source that hangs cannot
    /// slow the cadence and the window ends `poll_interval * poll_attempts`
    /// after it started.
    async fn poll_connection(&self) -> Result<Option<String>, ProvisioningError> {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let limit = self.config.request_timeout.min(period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let polling = async {
            for attempt in 1..=self.config.poll_attempts {
                ticker.tick().await;
                if let Some(ip) = self.poll_once(attempt, limit).await {
                    return Some(ip);
                }
            }
            None
        };

        self.until_closed(polling).await
    }

    /// Ask the device and the backend at the same time. The first positive
    /// report wins; the backend is taken when both are ready.
    async fn poll_once(&self, attempt: u32, limit: Duration) -> Option<String> {
        let backend = self.backend_report(attempt, limit);
        let device = self.device_report(attempt, limit);
        tokio::pin!(backend, device);

        let (mut backend_done, mut device_done) = (false, false);

        while !(backend_done && device_done) {
            tokio::select! {
                biased;
                ip = &mut backend, if !backend_done => {
                    backend_done = true;
                    if ip.is_some() {
                        return ip;
                    }
                }
                ip = &mut device, if !device_done => {
                    device_done = true;
                    if ip.is_some() {
                        return ip;
                    }
                }
            }
        }

        None
    }

    async fn device_report(&self, attempt: u32, limit: Duration) -> Option<String> {
        match timeout(
            limit,
            self.transport.connection_status(&self.config.device_address),
        )
        .await
        {
            Ok(Ok(Some(ConnectionReport {
                connected: true,
                ip: Some(ip),
            }))) if !ip.is_empty() => {
                info!("device reports joining at {ip} (poll {attempt})");
                Some(ip)
            }
            Ok(Ok(_)) => {
                debug!("poll {attempt}: device gave no positive report");
                None
            }
            Ok(Err(e)) => {
                debug!("poll {attempt}: device status failed: {e:#}");
                None
            }
            Err(_) => {
                debug!("poll {attempt}: device status timed out");
                None
            }
        }
    }

    async fn backend_report(&self, attempt: u32, limit: Duration) -> Option<String> {
        match timeout(limit, self.backend.device_status(&self.config.device_id)).await {
            Ok(Ok(DeviceConnectionStatus {
                connected: true,
                ip_address: Some(ip),
                ..
            })) if !ip.is_empty() => {
                info!("backend reports device online at {ip} (poll {attempt})");
                Some(ip)
            }
            Ok(Ok(_)) => {
                debug!("poll {attempt}: backend has no address for the device yet");
                None
            }
            Ok(Err(e)) => {
                debug!("poll {attempt}: backend status failed: {e}");
                None
            }
            Err(_) => {
                debug!("poll {attempt}: backend status timed out");
                None
            }
        }
    }

    /// Run `fut` unless the session gets closed first
    async fn until_closed<F>(&self, fut: F) -> Result<F::Output, ProvisioningError>
    where
        F: Future,
    {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            output = fut => {
                if *self.closed.borrow() {
                    return Err(ProvisioningError::Cancelled);
                }
                Ok(output)
            }
            _ = closed.wait_for(|closed| *closed) => Err(ProvisioningError::Cancelled),
        }
    }

    /// Apply `modify` unless the session was closed
    fn update(&self, modify: impl FnOnce(&mut SessionSnapshot)) -> bool {
        self.state.send_if_modified(|s| {
            if s.closed {
                return false;
            }
            modify(s);
            true
        })
    }

    fn enter(&self, status: ProvisioningStatus) {
        self.update(|s| {
            debug!("provisioning {} -> {status}", s.status);
            s.status = status;
            s.error = None;
        });
    }

    fn fail(&self, e: ProvisioningError) -> ProvisioningError {
        error!("provisioning failed: {e}");
        let message = e.to_string();
        self.update(|s| {
            s.status = ProvisioningStatus::Error;
            s.error = Some(message);
        });
        e
    }

    fn finish(&self, device_ip: Option<String>, error: Option<String>) {
        let confirmed = device_ip.is_some();
        info!(
            "provisioning finished ({})",
            if confirmed { "confirmed" } else { "unconfirmed" }
        );

        self.update(|s| {
            s.status = ProvisioningStatus::Success;
            s.confirmed = confirmed;
            s.device_ip = device_ip;
            s.error = error;
        });
    }
}
