//! Scriptable backend used by orchestrator and application tests

use super::backend::{Backend, BackendContext, BackendKind, BackendProvider, Capability};
use super::profile::StreamProfile;
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct FakeControl {
    pub unavailable: AtomicBool,
    pub fail_start: AtomicBool,
    /// Reject profiles of this width
    pub reject_width: AtomicU32,
    pub start_delay_ms: AtomicU64,
    /// Leave frames in the queue instead of consuming them
    pub stall: AtomicBool,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub consumed: AtomicU64,
    pub last_ctx: Mutex<Option<BackendContext>>,
    pub last_profile: Mutex<Option<StreamProfile>>,
}

impl FakeControl {
    /// Report a runtime failure through the most recent attempt's context
    pub fn trigger_failure(&self, reason: &str) {
        if let Some(ctx) = self.last_ctx.lock().as_ref() {
            ctx.fail(reason);
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeProvider {
    kind: BackendKind,
    priority: u8,
    pub control: Arc<FakeControl>,
}

impl FakeProvider {
    pub fn new(kind: BackendKind, priority: u8) -> Self {
        Self {
            kind,
            priority,
            control: Arc::new(FakeControl::default()),
        }
    }

    pub fn shared(kind: BackendKind, priority: u8) -> (Arc<Self>, Arc<FakeControl>) {
        let provider = Self::new(kind, priority);
        let control = Arc::clone(&provider.control);
        (Arc::new(provider), control)
    }
}

#[async_trait]
impl BackendProvider for FakeProvider {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    async fn probe(&self) -> Capability {
        if self.control.unavailable.load(Ordering::SeqCst) {
            Capability::Unavailable("disabled in test".to_string())
        } else {
            Capability::Available
        }
    }

    async fn start(&self, profile: &StreamProfile, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        self.control.starts.fetch_add(1, Ordering::SeqCst);
        *self.control.last_profile.lock() = Some(profile.clone());

        let delay = self.control.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let rejected = self.control.reject_width.load(Ordering::SeqCst);
        if self.control.fail_start.load(Ordering::SeqCst) || (rejected != 0 && rejected == profile.width) {
            return Err(BackendError::Unavailable {
                backend: self.kind.to_string(),
                reason: "start refused".to_string(),
            }
            .into());
        }

        *self.control.last_ctx.lock() = Some(ctx.clone());

        let control = Arc::clone(&self.control);
        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(async move {
            if control.stall.load(Ordering::SeqCst) {
                ctx.cancel.cancelled().await;
                return;
            }
            while let Some(_frame) = ctx.next_frame().await {
                control.consumed.fetch_add(1, Ordering::SeqCst);
                ctx.delivered();
            }
        });

        Ok(Box::new(FakeBackend {
            kind: self.kind,
            uri: format!("fake://{}/{}", self.kind, profile.token),
            control: Arc::clone(&self.control),
            cancel,
            worker: Some(worker),
        }))
    }
}

struct FakeBackend {
    kind: BackendKind,
    uri: String,
    control: Arc<FakeControl>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    async fn stop(&mut self, _timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.control.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
