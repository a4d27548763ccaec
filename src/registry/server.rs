//! Registry Server
//!
//! Standalone registry process: answers framed registry requests and sweeps
//! stale members on a fixed interval.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};

use super::protocol::{RegistryRequest, RegistryResponse, Stamped};
use super::RegistryService;
use crate::network::NetworkServer;
use crate::error::Result;

/// Membership registry bound to a TCP address
pub struct RegistryServer {
    service: Arc<Mutex<RegistryService>>,
    sweep_interval: Duration,
    network: NetworkServer,
}

impl RegistryServer {
    /// Bind the registry listener
    pub async fn bind(bind_address: &str, liveness_window: Duration, sweep_interval: Duration) -> Result<Self> {
        let network = NetworkServer::bind(bind_address).await?;

        Ok(Self {
            service: Arc::new(Mutex::new(RegistryService::new(liveness_window))),
            sweep_interval,
            network,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.network.local_addr()
    }

    /// Shared handle to the registry state
    pub fn service(&self) -> Arc<Mutex<RegistryService>> {
        self.service.clone()
    }

    /// Serve requests until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<()> {
        let sweeper = {
            let service = self.service.clone();
            let period = self.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let expired = service
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .sweep(Instant::now());
                    if !expired.is_empty() {
                        tracing::debug!("Sweep expired {} member(s)", expired.len());
                    }
                }
            })
        };

        let service = self.service.clone();
        let handler = Arc::new(move |request: Stamped<RegistryRequest>| -> Stamped<RegistryResponse> {
            service
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handle(request, Instant::now())
        });

        tracing::info!("Membership registry serving on {}", self.local_addr());
        let result = self.network.serve_requests(handler).await;
        sweeper.abort();
        result
    }

    /// Stop the registry
    pub fn stop(&self) {
        self.network.stop();
    }
}
