use crate::config::DiscoveryConfig;
use crate::error::AppError;
use crate::protocol::message::{Message, MessageBody, NodeInfo};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const DATAGRAM_BUFFER: usize = 64 * 1024;
const WAIT_POLL: Duration = Duration::from_millis(100);

/// An editor instance seen on the multicast group.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub node_id: String,
    pub display_name: String,
    pub last_seen: Instant,
    pub address: SocketAddr,
    pub info: NodeInfo,
}

impl Endpoint {
    fn display_name_for(node_id: &str, info: &NodeInfo) -> String {
        match (info.project_name.is_empty(), info.machine.is_empty()) {
            (false, false) => format!("{} ({}@{})", info.project_name, info.user, info.machine),
            (false, true) => info.project_name.clone(),
            _ => node_id.to_string(),
        }
    }
}

/// Known endpoints keyed by node id. Entries older than `node_timeout` are never returned.
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: HashMap<String, Endpoint>,
    node_timeout: Duration,
}

impl EndpointRegistry {
    pub fn new(node_timeout: Duration) -> Self {
        Self { endpoints: HashMap::new(), node_timeout }
    }

    /// Inserts or refreshes an endpoint. Returns true when the node was not known before.
    pub fn upsert(&mut self, node_id: &str, info: NodeInfo, source: SocketAddr, now: Instant) -> bool {
        let address = info.command_address.unwrap_or(source);
        let display_name = Endpoint::display_name_for(node_id, &info);
        let previous = self.endpoints.insert(
            node_id.to_string(),
            Endpoint {
                node_id: node_id.to_string(),
                display_name,
                last_seen: now,
                address,
                info,
            },
        );
        previous.is_none()
    }

    pub fn remove(&mut self, node_id: &str) -> Option<Endpoint> {
        self.endpoints.remove(node_id)
    }

    /// Prunes stale entries, then returns the rest most-recently-seen first.
    pub fn snapshot(&mut self, now: Instant) -> Vec<Endpoint> {
        let timeout = self.node_timeout;
        self.endpoints.retain(|node_id, endpoint| {
            let fresh = now.saturating_duration_since(endpoint.last_seen) <= timeout;
            if !fresh {
                debug!(node_id = %node_id, "Dropping stale endpoint");
            }
            fresh
        });
        let mut endpoints: Vec<Endpoint> = self.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.node_id.cmp(&b.node_id)));
        endpoints
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DatagramOutcome {
    NewEndpoint(String),
    Refreshed(String),
    Ignored,
}

/// Applies one received datagram to the registry.
pub fn handle_datagram(
    registry: &mut EndpointRegistry,
    local_node_id: &str,
    bytes: &[u8],
    source: SocketAddr,
    now: Instant,
) -> DatagramOutcome {
    let message = match Message::from_slice(bytes) {
        Ok(message) if message.is_compatible() => message,
        Ok(_) => return DatagramOutcome::Ignored,
        Err(e) => {
            debug!(%source, error = %e, "Ignoring undecodable datagram");
            return DatagramOutcome::Ignored;
        }
    };
    if message.source == local_node_id || !message.is_addressed_to(local_node_id) {
        return DatagramOutcome::Ignored;
    }
    match message.body {
        MessageBody::Pong(info) => {
            if registry.upsert(&message.source, info, source, now) {
                DatagramOutcome::NewEndpoint(message.source)
            } else {
                DatagramOutcome::Refreshed(message.source)
            }
        }
        MessageBody::CloseConnection { .. } => {
            registry.remove(&message.source);
            DatagramOutcome::Ignored
        }
        _ => DatagramOutcome::Ignored,
    }
}

pub(crate) fn open_multicast_socket(config: &DiscoveryConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // The editor binds the same port on the same host.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    // Linux only delivers group traffic to wildcard-bound sockets; the interface is chosen by the join.
    let bind_ip = if cfg!(windows) { config.bind_address } else { Ipv4Addr::UNSPECIFIED };
    socket.bind(&SocketAddr::from((bind_ip, config.multicast_port)).into())?;
    socket.join_multicast_v4(&config.multicast_group, &config.bind_address)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    if !config.bind_address.is_unspecified() {
        socket.set_multicast_if_v4(&config.bind_address)?;
    }
    UdpSocket::from_std(socket.into())
}

/// Running discovery: a beacon loop plus the registry it feeds.
#[derive(Debug)]
pub struct Discovery {
    node_id: String,
    config: DiscoveryConfig,
    registry: Arc<StdMutex<EndpointRegistry>>,
    socket: Option<Arc<UdpSocket>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Discovery {
    /// Starts pinging the group. A socket that cannot join is logged and yields no endpoints.
    #[instrument(skip(config), fields(group = %config.multicast_group, port = config.multicast_port))]
    pub async fn start(config: DiscoveryConfig, node_id: String) -> Self {
        let registry = Arc::new(StdMutex::new(EndpointRegistry::new(config.node_timeout)));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let socket = match open_multicast_socket(&config) {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                warn!(
                    error = %e,
                    bind_address = %config.bind_address,
                    "Could not join discovery multicast group; no editors will be found"
                );
                None
            }
        };

        let task = socket.as_ref().map(|socket| {
            let group = SocketAddrV4::new(config.multicast_group, config.multicast_port);
            tokio::spawn(beacon_loop(
                socket.clone(),
                registry.clone(),
                node_id.clone(),
                SocketAddr::V4(group),
                config.ping_interval,
                shutdown_rx,
            ))
        });

        info!(node_id = %node_id, joined = socket.is_some(), "Discovery started");
        Self { node_id, config, registry, socket, shutdown, task }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        let mut registry = self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.snapshot(Instant::now())
    }

    /// Waits up to the configured discovery timeout for any endpoint to appear.
    pub async fn wait_for_endpoint(&self) -> Result<Endpoint, AppError> {
        let started = Instant::now();
        loop {
            if let Some(endpoint) = self.list_endpoints().into_iter().next() {
                info!(node_id = %endpoint.node_id, name = %endpoint.display_name, "Editor found");
                return Ok(endpoint);
            }
            let waited = started.elapsed();
            if waited >= self.config.discovery_timeout {
                return Err(AppError::DiscoveryTimeout { waited_ms: waited.as_millis() as u64 });
            }
            tokio::time::sleep(WAIT_POLL.min(self.config.discovery_timeout - waited)).await;
        }
    }

    /// Sends a message to one node over the multicast group.
    pub async fn send_to(&self, dest: &str, body: MessageBody) -> Result<(), AppError> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            AppError::ConnectionFailed("discovery socket is not joined to the multicast group".to_string())
        })?;
        let message = Message::new(self.node_id.clone(), Some(dest.to_string()), body);
        let group = SocketAddr::from((self.config.multicast_group, self.config.multicast_port));
        socket
            .send_to(&message.to_bytes()?, group)
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Failed to send to {}: {}", dest, e)))?;
        Ok(())
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Discovery task ended abnormally");
            }
        }
        debug!(node_id = %self.node_id, "Discovery stopped");
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<StdMutex<EndpointRegistry>>,
    node_id: String,
    group: SocketAddr,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let ping = match Message::new(node_id.clone(), None, MessageBody::Ping).to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to encode ping");
            return;
        }
    };
    let mut ticker = tokio::time::interval(ping_interval);
    let mut buf = vec![0u8; DATAGRAM_BUFFER];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&ping, group).await {
                    debug!(error = %e, "Ping send failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => {
                    let outcome = {
                        let mut guard = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        handle_datagram(&mut guard, &node_id, &buf[..len], source, Instant::now())
                    };
                    if let DatagramOutcome::NewEndpoint(remote) = outcome {
                        info!(remote_node = %remote, %source, "Discovered editor");
                    }
                }
                Err(e) => debug!(error = %e, "Datagram receive failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
