use crate::backend_client::BackendApi;
use log::{debug, info};
use serde::Serialize;
use std::{fmt, time::Duration};
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityConfig {
    pub interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    #[default]
    Offline,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Offline => write!(f, "offline"),
        }
    }
}

/// Periodically checks whether the backend answers
pub struct ConnectivityMonitor<B> {
    backend: B,
    config: ConnectivityConfig,
    state: watch::Sender<Connectivity>,
}

impl<B> ConnectivityMonitor<B>
where
    B: BackendApi,
{
    /// Starts out `Offline` until the first check succeeds
    pub fn new(backend: B, config: ConnectivityConfig) -> Self {
        let (state, _) = watch::channel(Connectivity::default());
        Self {
            backend,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Check once and publish the result if it changed
    pub async fn check(&self) -> Connectivity {
        let current = if self.backend.is_reachable().await {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };

        self.state.send_if_modified(|state| {
            if *state == current {
                return false;
            }
            info!("backend is now {current}");
            *state = current;
            true
        });

        current
    }

    /// Check every interval until all receivers are dropped
    pub async fn run(self) {
        let mut ticker = interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                _ = self.state.closed() => break,
            }
        }

        debug!("no connectivity subscribers left, stopping monitor");
    }
}
