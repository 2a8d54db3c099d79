//! Best-effort pushes of Wi-Fi credentials and the backend token to a device.
//!
//! The device never returns a readable acknowledgement, so a delivery is only
//! ever reported as *attempted*: at least one encoding left and returned
//! without a transport error before the per-request timeout.

use crate::device_client::{DeviceEndpoint, DeviceRequest, DeviceTransport, Encoding, SendError};
use futures_util::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request could not be issued at all
    Invalid,
    Transport,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub encoding: Encoding,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// At least one encoding went out without a transport error
    pub attempted: bool,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// No encoding could even be issued, e.g. because the address is malformed
    pub fn all_invalid(&self) -> bool {
        !self.attempted
            && !self.failures.is_empty()
            && self.failures.iter().all(|f| f.kind == FailureKind::Invalid)
    }

    /// One line describing every failed encoding
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.encoding, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Sends payloads to a device in every known encoding concurrently
pub struct Deliverer<'a, T> {
    transport: &'a T,
    timeout: Duration,
}

impl<'a, T> Deliverer<'a, T>
where
    T: DeviceTransport,
{
    pub fn new(transport: &'a T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Push Wi-Fi credentials to `POST /set_wifi`
    pub async fn credentials(&self, address: &str, ssid: &str, password: &str) -> DeliveryReport {
        debug!("delivering credentials for {ssid} to {address}");

        self.fan_out(
            address,
            DeviceEndpoint::SetWifi,
            vec![("ssid", ssid.to_string()), ("password", password.to_string())],
        )
        .await
    }

    /// Push the backend token to `POST /set_token`. Safe to repeat.
    pub async fn token(&self, address: &str, token: &str) -> DeliveryReport {
        debug!("delivering token to {address}");

        self.fan_out(
            address,
            DeviceEndpoint::SetToken,
            vec![("token", token.to_string())],
        )
        .await
    }

    async fn fan_out(
        &self,
        address: &str,
        endpoint: DeviceEndpoint,
        fields: Vec<(&'static str, String)>,
    ) -> DeliveryReport {
        let attempts = Encoding::ALL.into_iter().map(|encoding| {
            let request = DeviceRequest {
                address: address.to_string(),
                endpoint,
                encoding,
                fields: fields.clone(),
            };

            async move {
                let result = match timeout(self.timeout, self.transport.send(&request)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(SendError::Invalid(e))) => Err((FailureKind::Invalid, e)),
                    Ok(Err(SendError::Transport(e))) => Err((FailureKind::Transport, e)),
                    Err(_) => Err((
                        FailureKind::Timeout,
                        format!("timed out after {}s", self.timeout.as_secs_f32()),
                    )),
                };
                (encoding, result)
            }
        });

        let mut report = DeliveryReport::default();

        for (encoding, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.attempted = true,
                Err((kind, error)) => {
                    warn!("{} delivery to {address} via {encoding} failed: {error}", endpoint.path());
                    report.failures.push(DeliveryFailure {
                        encoding,
                        kind,
                        error,
                    });
                }
            }
        }

        report
    }
}
