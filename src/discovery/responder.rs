use super::cache::ProbeMatchCache;
use super::messages::{self, AppSequence, EndpointInfo};
use super::socket::{self, WS_DISCOVERY_PORT};
use crate::config::DiscoveryConfig;
use crate::error::{Result, VcamError};
use crate::identity::CameraIdentity;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const MAX_DATAGRAM: usize = 65_535;
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

fn new_message_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

/// Decides whether and how to answer a single datagram. Holds no sockets so
/// it can be driven directly.
pub struct ProbeHandler {
    identity: Arc<CameraIdentity>,
    xaddrs: Vec<String>,
    cache: Mutex<ProbeMatchCache>,
}

impl ProbeHandler {
    pub fn new(identity: Arc<CameraIdentity>, xaddrs: Vec<String>, dedup_ttl: Duration) -> Self {
        Self {
            identity,
            xaddrs,
            cache: Mutex::new(ProbeMatchCache::new(dedup_ttl)),
        }
    }

    /// Current advertisement; scopes and metadata version follow renames
    pub fn endpoint(&self) -> EndpointInfo {
        EndpointInfo {
            address: self.identity.uuid.clone(),
            scopes: self.identity.scopes(),
            xaddrs: self.xaddrs.clone(),
            metadata_version: self.identity.metadata_version(),
        }
    }

    /// ProbeMatch body for a matching, not-yet-answered Probe
    pub fn handle_datagram(&self, data: &[u8], now: Instant) -> Option<String> {
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                debug!("Dropping non-UTF-8 discovery datagram: {}", e);
                return None;
            }
        };

        let probe = match messages::parse_probe(text) {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                trace!("Ignoring non-Probe discovery message");
                return None;
            }
            Err(e) => {
                debug!("Dropping malformed discovery datagram: {}", e);
                return None;
            }
        };

        if !probe.wants_device_types() {
            debug!("Probe for other device types: {:?}", probe.types);
            return None;
        }

        let endpoint = self.endpoint();
        if !probe.wants_scopes(&endpoint.scopes) {
            debug!("Probe scopes {:?} not matched", probe.scopes);
            return None;
        }

        if let Some(id) = &probe.message_id {
            if !self.cache.lock().check_and_insert(id, now) {
                debug!("Duplicate Probe {} suppressed", id);
                return None;
            }
        }

        let relates_to = probe.message_id.unwrap_or_else(new_message_id);
        Some(messages::probe_match(&new_message_id(), &relates_to, &endpoint))
    }
}

/// Multicast listener answering Probes and announcing Hello/Bye
pub struct DiscoveryResponder {
    handler: Arc<ProbeHandler>,
    config: DiscoveryConfig,
    port: u16,
    instance_id: u64,
    message_number: AtomicU64,
    cancel: CancellationToken,
    sockets: Mutex<Vec<(Arc<UdpSocket>, SocketAddr)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryResponder {
    pub fn new(handler: Arc<ProbeHandler>, config: DiscoveryConfig) -> Self {
        Self::with_port(handler, config, WS_DISCOVERY_PORT)
    }

    pub fn with_port(handler: Arc<ProbeHandler>, config: DiscoveryConfig, port: u16) -> Self {
        let instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            handler,
            config,
            port,
            instance_id,
            message_number: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            sockets: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn handler(&self) -> &Arc<ProbeHandler> {
        &self.handler
    }

    fn next_sequence(&self) -> AppSequence {
        AppSequence {
            instance_id: self.instance_id,
            message_number: self.message_number.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Bind, join the multicast group(s), send Hello and start answering
    pub async fn start(&self) -> Result<()> {
        let interface = if self.config.interface.trim().is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.config.interface.trim().parse().map_err(|_| {
                VcamError::component(
                    "discovery",
                    format!("invalid interface address '{}'", self.config.interface),
                )
            })?
        };

        let v4 = socket::bind_multicast_v4(self.port, interface).map_err(|e| {
            VcamError::component("discovery", format!("cannot bind UDP {}: {}", self.port, e))
        })?;
        self.spawn_listener(Arc::new(v4), socket::multicast_v4_target(self.port));

        if self.config.ipv6 {
            match socket::bind_multicast_v6(self.port, 0) {
                Ok(v6) => self.spawn_listener(Arc::new(v6), socket::multicast_v6_target(self.port)),
                Err(e) => warn!("IPv6 discovery unavailable: {}", e),
            }
        }

        self.announce_hello().await;
        info!(
            "WS-Discovery listening on port {} as {}",
            self.port,
            self.handler.identity.uuid
        );
        Ok(())
    }

    fn spawn_listener(&self, socket: Arc<UdpSocket>, group: SocketAddr) {
        self.sockets.lock().push((Arc::clone(&socket), group));
        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();
        self.tasks
            .lock()
            .push(tokio::spawn(listen(socket, handler, cancel)));
    }

    /// Multicast a Hello; also used after the advertised metadata changes
    pub async fn announce_hello(&self) {
        let endpoint = self.handler.endpoint();
        let message = messages::hello(&new_message_id(), self.next_sequence(), &endpoint);
        self.multicast(&message, "Hello").await;
    }

    async fn multicast(&self, message: &str, label: &str) {
        let targets: Vec<_> = self.sockets.lock().clone();
        for (socket, group) in targets {
            match socket.send_to(message.as_bytes(), group).await {
                Ok(_) => debug!("Sent {} to {}", label, group),
                Err(e) => warn!("Failed to send {} to {}: {}", label, group, e),
            }
        }
    }

    /// Send Bye and stop the listeners
    pub async fn stop(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let endpoint = self.handler.endpoint();
        let message = messages::bye(&new_message_id(), self.next_sequence(), &endpoint);
        self.multicast(&message, "Bye").await;

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.sockets.lock().clear();
        info!("WS-Discovery stopped");
        Ok(())
    }
}

async fn listen(socket: Arc<UdpSocket>, handler: Arc<ProbeHandler>, cancel: CancellationToken) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((len, peer)) => {
                let Some(reply) = handler.handle_datagram(&buffer[..len], Instant::now()) else {
                    continue;
                };
                match socket.send_to(reply.as_bytes(), peer).await {
                    Ok(_) => debug!("Sent ProbeMatch to {}", peer),
                    Err(e) => warn!("Failed to send ProbeMatch to {}: {}", peer, e),
                }
            }
            Err(e) => {
                warn!("Discovery receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Discovery listener exiting");
}
