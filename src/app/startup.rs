use super::{ComponentState, VirtualCamera};
use crate::error::Result;
use std::net::SocketAddr;
use tracing::{error, info, warn};

impl VirtualCamera {
    /// Start streaming, the ONVIF listener and discovery, in that order
    pub async fn start(&self) -> Result<SocketAddr> {
        info!("Starting virtual camera '{}'", self.identity.name());

        self.initialize_component_states().await;

        self.set_component_state("streaming", ComponentState::Starting)
            .await;
        if let Err(e) = self.streams.start().await {
            error!("Failed to start stream orchestrator: {}", e);
            self.set_component_state("streaming", ComponentState::Failed)
                .await;
            return Err(e);
        }
        self.set_component_state("streaming", ComponentState::Running)
            .await;

        self.set_component_state("onvif", ComponentState::Starting).await;
        let addr = match self.server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to start ONVIF server: {}", e);
                self.set_component_state("onvif", ComponentState::Failed).await;
                return Err(e);
            }
        };
        self.set_component_state("onvif", ComponentState::Running).await;

        if let Some(discovery) = &self.discovery {
            self.set_component_state("discovery", ComponentState::Starting)
                .await;
            match discovery.start().await {
                Ok(()) => {
                    self.set_component_state("discovery", ComponentState::Running)
                        .await
                }
                Err(e) => {
                    // The camera stays reachable by address
                    warn!("WS-Discovery unavailable: {}", e);
                    self.set_component_state("discovery", ComponentState::Failed)
                        .await;
                }
            }
        }

        info!("Virtual camera started, ONVIF listening on {}", addr);
        Ok(addr)
    }

    async fn initialize_component_states(&self) {
        self.set_component_state("streaming", ComponentState::Stopped)
            .await;
        self.set_component_state("onvif", ComponentState::Stopped).await;
        if self.discovery.is_some() {
            self.set_component_state("discovery", ComponentState::Stopped)
                .await;
        }
    }
}
