use crate::http_client::{build_url, timeout_client};
use anyhow::{Context, Result};
use log::debug;
use reqwest::{Client, multipart::Form};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;
use trait_variant::make;

/// Ways the same payload is put on the wire.
///
/// The device firmware does not document which content type it parses, so
/// every delivery is sent once per encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Json,
    Multipart,
    UrlEncoded,
    Query,
}

impl Encoding {
    pub const ALL: [Encoding; 4] = [
        Encoding::Json,
        Encoding::Multipart,
        Encoding::UrlEncoded,
        Encoding::Query,
    ];
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => write!(f, "json"),
            Encoding::Multipart => write!(f, "multipart"),
            Encoding::UrlEncoded => write!(f, "url-encoded"),
            Encoding::Query => write!(f, "query"),
        }
    }
}

/// Endpoints implemented by the device firmware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEndpoint {
    SetWifi,
    SetToken,
    ConnectionStatus,
}

impl DeviceEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            DeviceEndpoint::SetWifi => "/set_wifi",
            DeviceEndpoint::SetToken => "/set_token",
            DeviceEndpoint::ConnectionStatus => "/connection_status",
        }
    }
}

/// One encoded push of form fields to a device endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRequest {
    pub address: String,
    pub endpoint: DeviceEndpoint,
    pub encoding: Encoding,
    pub fields: Vec<(&'static str, String)>,
}

/// Why a single encoded request did not go through
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The request could not even be issued (bad address, unencodable fields)
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The request was issued but the transport failed (refused, reset, timed out)
    #[error("{0}")]
    Transport(String),
}

impl SendError {
    fn from_reqwest(e: reqwest::Error, context: &str) -> Self {
        if e.is_builder() {
            SendError::Invalid(format!("{context}: {e}"))
        } else {
            SendError::Transport(format!("{context}: {e}"))
        }
    }
}

/// Readable answer of `GET /connection_status`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ConnectionReport {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Local HTTP transport to a device.
///
/// None of these calls can observe whether the device acted on a request:
/// `send` only reports whether the request went out and came back without a
/// transport error.
#[make(Send)]
pub trait DeviceTransport: Sync {
    /// True if anything answered at `address` in time
    async fn probe(&self, address: &str) -> bool;

    /// Send one encoded request. The response is not inspected.
    async fn send(&self, request: &DeviceRequest) -> Result<(), SendError>;

    /// Ask the device whether it joined the target network.
    ///
    /// `Ok(None)` means the device answered but the answer could not be read.
    async fn connection_status(&self, address: &str) -> Result<Option<ConnectionReport>>;
}

#[derive(Clone)]
pub struct HttpDeviceTransport {
    client: Client,
}

impl HttpDeviceTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: timeout_client(timeout)?,
        })
    }

    fn build_url(address: &str, endpoint: DeviceEndpoint) -> String {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        build_url(&base, endpoint.path())
    }
}

impl DeviceTransport for HttpDeviceTransport {
    async fn probe(&self, address: &str) -> bool {
        let url = Self::build_url(address, DeviceEndpoint::ConnectionStatus);

        match self.client.get(&url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("probe of {url} failed: {e}");
                false
            }
        }
    }

    async fn send(&self, request: &DeviceRequest) -> Result<(), SendError> {
        let url = Self::build_url(&request.address, request.endpoint);
        debug!("{} {url}", request.encoding);

        let builder = match request.encoding {
            Encoding::Json => {
                let body: serde_json::Map<String, serde_json::Value> = request
                    .fields
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.clone().into()))
                    .collect();
                self.client.post(&url).json(&body)
            }
            Encoding::Multipart => {
                let form = request
                    .fields
                    .iter()
                    .fold(Form::new(), |form, (name, value)| {
                        form.text(*name, value.clone())
                    });
                self.client.post(&url).multipart(form)
            }
            Encoding::UrlEncoded => self.client.post(&url).form(&request.fields),
            Encoding::Query => self.client.get(&url).query(&request.fields),
        };

        builder.send().await.map_err(|e| {
            SendError::from_reqwest(e, &format!("failed to send {} request to {url}", request.encoding))
        })?;

        Ok(())
    }

    async fn connection_status(&self, address: &str) -> Result<Option<ConnectionReport>> {
        let url = Self::build_url(address, DeviceEndpoint::ConnectionStatus);

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?;

        if !res.status().is_success() {
            debug!("{url} answered with status {}", res.status());
            return Ok(None);
        }

        let Ok(body) = res.text().await else {
            return Ok(None);
        };

        Ok(serde_json::from_str(&body).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod build_url {
        use super::*;

        #[test]
        fn bare_address_gets_http_scheme() {
            assert_eq!(
                HttpDeviceTransport::build_url("192.168.4.1", DeviceEndpoint::SetWifi),
                "http://192.168.4.1/set_wifi"
            );
        }

        #[test]
        fn explicit_scheme_is_kept() {
            assert_eq!(
                HttpDeviceTransport::build_url("http://10.0.0.7:8080/", DeviceEndpoint::SetToken),
                "http://10.0.0.7:8080/set_token"
            );
        }
    }

    mod connection_report {
        use super::*;

        #[test]
        fn parses_connected_with_ip() {
            let report: ConnectionReport =
                serde_json::from_str(r#"{"connected":true,"ip":"10.0.0.7"}"#).unwrap();
            assert!(report.connected);
            assert_eq!(report.ip.as_deref(), Some("10.0.0.7"));
        }

        #[test]
        fn missing_fields_default_to_disconnected() {
            let report: ConnectionReport = serde_json::from_str("{}").unwrap();
            assert_eq!(report, ConnectionReport::default());
        }
    }

    #[test]
    fn every_encoding_is_listed_once() {
        let encodings: std::collections::HashSet<_> = Encoding::ALL.into_iter().collect();
        assert_eq!(encodings.len(), Encoding::ALL.len());
        assert_eq!(encodings.len(), 4);
    }

    #[test]
    fn endpoints_match_firmware_paths() {
        assert_eq!(DeviceEndpoint::SetWifi.path(), "/set_wifi");
        assert_eq!(DeviceEndpoint::SetToken.path(), "/set_token");
        assert_eq!(DeviceEndpoint::ConnectionStatus.path(), "/connection_status");
    }
}
