use super::{ComponentState, VirtualCamera};
use crate::error::{Result, VcamError};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

impl VirtualCamera {
    /// Stop every component within the configured bound
    pub async fn shutdown(&self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        // Frame sources watch this token
        self.cancellation_token.cancel();

        let mut exit_code = 0;

        // Reverse of startup order; Bye goes out first
        for component in ["discovery", "streaming", "onvif"] {
            if let Err(e) = self.stop_component(component).await {
                error!("Error stopping {}: {}", component, e);
                exit_code = 1;
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Stop a specific component
    async fn stop_component(&self, component: &str) -> Result<()> {
        let state = self.get_component_state(component).await;
        if !matches!(
            state,
            Some(ComponentState::Running) | Some(ComponentState::Starting)
        ) {
            return Ok(());
        }

        info!("Stopping component: {}", component);
        self.set_component_state(component, ComponentState::Stopping)
            .await;

        let limit = self.component_timeout();
        let result = match component {
            "discovery" => match &self.discovery {
                Some(discovery) => bounded(component, limit, discovery.stop()).await,
                None => Ok(()),
            },
            "streaming" => bounded(component, limit, self.streams.stop()).await,
            "onvif" => self.server.stop(limit).await,
            _ => Err(VcamError::system(format!("Unknown component: {}", component))),
        };

        match &result {
            Ok(()) => {
                self.set_component_state(component, ComponentState::Stopped)
                    .await;
                info!("Component '{}' stopped", component);
            }
            Err(_) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
            }
        }
        result
    }

    fn component_timeout(&self) -> Duration {
        Duration::from_millis(self.config.pipeline.shutdown_timeout_ms.max(1))
    }
}

/// Await `future`, giving up after `limit`
async fn bounded<F>(component: &str, limit: Duration, future: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(VcamError::ShutdownTimeout {
            component: component.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
