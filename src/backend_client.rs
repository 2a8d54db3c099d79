use crate::{
    http_client::{build_url, timeout_client},
    session::AuthTokenSource,
};
use anyhow::Context;
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, time::Duration};
use thiserror::Error;
use trait_variant::make;

/// Mutating HTTP methods that may be queued while offline
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_method(self) -> Method {
        match self {
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    /// DELETE requests never carry a body
    pub fn carries_body(self) -> bool {
        !matches!(self, HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    /// The backend could not be reached at all (connect failure or timeout)
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("{context} failed with status {status} and body: {body}")]
    Status {
        context: String,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RequestError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RequestError::Unreachable(_))
    }

    fn from_transport(e: reqwest::Error, context: &str) -> Self {
        if e.is_connect() || e.is_timeout() {
            RequestError::Unreachable(format!("{context}: {e}"))
        } else {
            RequestError::Other(anyhow::Error::new(e).context(format!("failed to send {context}")))
        }
    }
}

/// Device state as the backend last saw it
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceConnectionStatus {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub connected: bool,
    /// dBm
    #[serde(default)]
    pub signal_strength: Option<i32>,
    #[serde(default)]
    pub last_connected: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub device_name: String,
}

#[make(Send)]
pub trait BackendApi: Sync {
    /// Issue a mutating request and return the decoded response body, if any
    async fn send(
        &self,
        method: HttpMethod,
        endpoint: &str,
        data: Option<&Value>,
    ) -> Result<Option<Value>, RequestError>;

    async fn register_device(&self, registration: &DeviceRegistration)
    -> Result<(), RequestError>;

    async fn device_status(&self, device_id: &str) -> Result<DeviceConnectionStatus, RequestError>;

    /// True if the backend answered at all
    async fn is_reachable(&self) -> bool;
}

/// Authenticated client for the plant backend
#[derive(Clone)]
pub struct HttpBackendClient<A> {
    client: Client,
    base_url: String,
    tokens: A,
}

impl<A> HttpBackendClient<A>
where
    A: AuthTokenSource,
{
    const REGISTER_DEVICE_ENDPOINT: &str = "/api/devices/register";
    const DEVICE_STATUS_ENDPOINT: &str = "/api/plants/device";

    pub fn new(base_url: &str, timeout: Duration, tokens: A) -> anyhow::Result<Self> {
        Ok(Self {
            client: timeout_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let builder = self.client.request(method, build_url(&self.base_url, endpoint));
        match self.tokens.auth_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, context: &str) -> Result<String, RequestError> {
        let res = builder
            .send()
            .await
            .map_err(|e| RequestError::from_transport(e, context))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .context(format!("failed to read response body of {context}"))?;

        if !status.is_success() {
            return Err(RequestError::Status {
                context: context.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

impl<A> BackendApi for HttpBackendClient<A>
where
    A: AuthTokenSource,
{
    async fn send(
        &self,
        method: HttpMethod,
        endpoint: &str,
        data: Option<&Value>,
    ) -> Result<Option<Value>, RequestError> {
        let context = format!("{method} {endpoint}");
        info!("{context}");

        let mut builder = self.request(method.as_method(), endpoint);
        if let Some(data) = data.filter(|_| method.carries_body()) {
            builder = builder.json(data);
        }

        let body = self.execute(builder, &context).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(
            serde_json::from_str(&body).unwrap_or(Value::String(body)),
        ))
    }

    async fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<(), RequestError> {
        info!("registering device {}", registration.device_id);

        let builder = self
            .request(Method::POST, Self::REGISTER_DEVICE_ENDPOINT)
            .json(registration);
        self.execute(builder, "device registration").await?;
        Ok(())
    }

    async fn device_status(&self, device_id: &str) -> Result<DeviceConnectionStatus, RequestError> {
        let endpoint = format!("{}/{device_id}", Self::DEVICE_STATUS_ENDPOINT);
        let body = self
            .execute(self.request(Method::GET, &endpoint), "device status request")
            .await?;

        serde_json::from_str(&body)
            .context("failed to parse device status")
            .map_err(RequestError::from)
    }

    async fn is_reachable(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("backend not reachable: {e}");
                false
            }
        }
    }
}
