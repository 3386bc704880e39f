use super::{ShutdownReason, VirtualCamera};
use crate::error::{Result, VcamError};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

impl VirtualCamera {
    /// Run until a signal or `request_shutdown`, then shut down
    pub async fn run(self: &Arc<Self>) -> Result<i32> {
        info!("Virtual camera is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .lock()
            .take()
            .ok_or_else(|| VcamError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers();

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| VcamError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;
        let exit_code = match shutdown_reason {
            ShutdownReason::Error(_) => exit_code.max(1),
            _ => exit_code,
        };

        info!("Virtual camera shutdown complete");
        Ok(exit_code)
    }

    /// Set up signal handlers for graceful shutdown
    fn setup_signal_handlers(self: &Arc<Self>) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let camera = Arc::clone(self);
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {}", e);
                            return;
                        }
                    };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    camera.request_shutdown(ShutdownReason::Signal("SIGTERM".to_string()));
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let camera = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                camera.request_shutdown(ShutdownReason::Signal("SIGINT".to_string()));
            }
        });
    }
}
