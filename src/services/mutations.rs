use crate::{
    backend_client::{BackendApi, HttpMethod, RequestError},
    services::offline_queue::OfflineQueue,
};
use anyhow::Context;
use log::warn;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum MutationOutcome {
    /// The backend answered, with the decoded response body if there was one
    Applied(Option<Value>),
    /// The backend was unreachable; the mutation waits in the queue under this id
    Queued(String),
}

/// Backend mutations that fall back to the offline queue
pub struct OfflineClient<B> {
    backend: B,
    queue: Arc<OfflineQueue>,
}

impl<B> OfflineClient<B>
where
    B: BackendApi,
{
    pub fn new(backend: B, queue: Arc<OfflineQueue>) -> Self {
        Self { backend, queue }
    }

    pub async fn mutate(
        &self,
        method: HttpMethod,
        endpoint: &str,
        data: Option<Value>,
    ) -> Result<MutationOutcome, RequestError> {
        match self.backend.send(method, endpoint, data.as_ref()).await {
            Ok(body) => Ok(MutationOutcome::Applied(body)),
            Err(RequestError::Unreachable(e)) => {
                warn!("{method} {endpoint} deferred, backend unreachable: {e}");
                let id = self
                    .queue
                    .enqueue(endpoint, method, data)
                    .context("failed to queue offline mutation")?;
                Ok(MutationOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }
}
