//! UDP route service: server info queries and route management.
//!
//! Datagram layout:
//!
//! ```text
//! cookie u32 | invoke_id u32 | service u32 | sender AmsAddr (8) | tag_count u32
//! tag_count x (tag_id u16 | length u16 | data)
//! ```
//!
//! Datagrams whose cookie differs are dropped without an answer.

use crate::codec::ByteReader;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::{AmsAddr, NetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Magic cookie opening every datagram.
pub const COOKIE: u32 = 0x7114_6603;
/// Bit set in the service id of replies.
pub const RESPONSE_FLAG: u32 = 0x8000_0000;
/// AMS port of the system service that answers route requests.
pub const PORT_SYSTEM_SERVICE: u16 = 10000;
/// Fixed part of a datagram up to the tag count.
pub const HEADER_SIZE: usize = 24;

/// Tag ids.
pub mod tag {
    /// Result code of a request (`u32`).
    pub const STATUS: u16 = 1;
    /// Password; accepted and ignored.
    pub const PASSWORD: u16 = 2;
    /// Runtime version (major, minor, build u16).
    pub const VERSION: u16 = 3;
    /// Host name, null-terminated.
    pub const COMPUTER_NAME: u16 = 5;
    /// NetId of the route (6 bytes).
    pub const NET_ID: u16 = 7;
    /// Route name, null-terminated.
    pub const ROUTE_NAME: u16 = 12;
    /// Host address of the route, null-terminated.
    pub const HOST: u16 = 14;
}

/// Route services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RouteService {
    /// Query name and version.
    ServerInfo = 1,
    /// Add a static route.
    AddRoute = 6,
    /// Remove a static route.
    DeleteRoute = 7,
}

impl RouteService {
    /// Parse a service id, ignoring the response bit.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value & !RESPONSE_FLAG {
            1 => Some(Self::ServerInfo),
            6 => Some(Self::AddRoute),
            7 => Some(Self::DeleteRoute),
            _ => None,
        }
    }
}

/// One tag of a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag id.
    pub id: u16,
    /// Raw tag data.
    pub data: Vec<u8>,
}

impl Tag {
    /// Null-terminated text tag.
    #[must_use]
    pub fn text(id: u16, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self { id, data }
    }

    /// Text content up to the first null.
    #[must_use]
    pub fn as_text(&self) -> String {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

/// A route service datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePacket {
    /// Correlation id echoed by the responder.
    pub invoke_id: u32,
    /// Raw service id, including the response bit.
    pub service: u32,
    /// Endpoint of the sender.
    pub sender: AmsAddr,
    /// Tags in order.
    pub tags: Vec<Tag>,
}

impl RoutePacket {
    /// Request datagram.
    #[must_use]
    pub fn request(invoke_id: u32, service: RouteService, sender: AmsAddr, tags: Vec<Tag>) -> Self {
        Self {
            invoke_id,
            service: service as u32,
            sender,
            tags,
        }
    }

    /// Returns true if this is a reply.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.service & RESPONSE_FLAG != 0
    }

    /// Typed service.
    #[must_use]
    pub fn service(&self) -> Option<RouteService> {
        RouteService::from_u32(self.service)
    }

    /// First tag with `id`.
    #[must_use]
    pub fn tag(&self, id: u16) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == id)
    }

    /// Result carried in the status tag; success when absent.
    #[must_use]
    pub fn status(&self) -> AdsErrorCode {
        self.tag(tag::STATUS)
            .and_then(|t| t.data.get(..4))
            .and_then(|b| b.try_into().ok())
            .map_or(AdsErrorCode::NoError, |b| {
                AdsErrorCode::from_u32(u32::from_le_bytes(b))
            })
    }

    /// Serialize to a datagram.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 64);
        out.extend_from_slice(&COOKIE.to_le_bytes());
        out.extend_from_slice(&self.invoke_id.to_le_bytes());
        out.extend_from_slice(&self.service.to_le_bytes());
        out.extend_from_slice(&self.sender.to_bytes());
        out.extend_from_slice(&(self.tags.len() as u32).to_le_bytes());
        for tag in &self.tags {
            out.extend_from_slice(&tag.id.to_le_bytes());
            out.extend_from_slice(&(tag.data.len() as u16).to_le_bytes());
            out.extend_from_slice(&tag.data);
        }
        out
    }

    /// Parse a datagram; a wrong cookie is a framing error.
    pub fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        let cookie = r.u32()?;
        if cookie != COOKIE {
            return Err(AdsError::Framing(format!("bad route cookie {cookie:#010x}")));
        }
        let invoke_id = r.u32()?;
        let service = r.u32()?;
        let sender = AmsAddr::from_bytes(r.bytes(AmsAddr::SIZE)?)?;
        let count = r.u32()?;
        let tags = (0..count)
            .map(|_| {
                let id = r.u16()?;
                let len = usize::from(r.u16()?);
                Ok(Tag {
                    id,
                    data: r.bytes(len)?.to_vec(),
                })
            })
            .collect::<AdsResult<Vec<_>>>()?;
        Ok(Self {
            invoke_id,
            service,
            sender,
            tags,
        })
    }
}

/// A static route known to the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Route name.
    pub name: String,
    /// NetId reachable over the route.
    pub net_id: NetId,
    /// Host address of the route.
    pub host: String,
}

/// Answer to a server info query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Endpoint that answered.
    pub addr: AmsAddr,
    /// Announced host name.
    pub name: String,
    /// Runtime version (major, minor, build).
    pub version: (u8, u8, u16),
}

/// Answers route service datagrams and keeps the route table.
#[derive(Debug, Clone)]
pub struct RouteResponder {
    net_id: NetId,
    name: String,
    version: (u8, u8, u16),
    routes: Arc<Mutex<BTreeMap<String, RouteEntry>>>,
}

impl RouteResponder {
    /// Create a responder for `net_id` announcing `name`.
    #[must_use]
    pub fn new(net_id: NetId, name: &str) -> Self {
        Self {
            net_id,
            name: name.to_string(),
            version: crate::dispatch::VERSION,
            routes: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<String, RouteEntry>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Known routes in name order.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.table().values().cloned().collect()
    }

    /// Answer one request; replies are ignored.
    #[must_use]
    pub fn handle(&self, request: &RoutePacket, peer: SocketAddr) -> Option<RoutePacket> {
        if request.is_response() {
            return None;
        }
        let tags = match request.service() {
            Some(RouteService::ServerInfo) => {
                let (major, minor, build) = self.version;
                let mut version = vec![major, minor];
                version.extend_from_slice(&build.to_le_bytes());
                vec![
                    Tag::text(tag::COMPUTER_NAME, &self.name),
                    Tag {
                        id: tag::VERSION,
                        data: version,
                    },
                ]
            }
            Some(RouteService::AddRoute) => vec![status(self.add_route(request, peer))],
            Some(RouteService::DeleteRoute) => vec![status(self.delete_route(request))],
            None => {
                debug!(service = request.service, %peer, "Unknown route service");
                vec![status(Err(AdsError::Protocol(
                    AdsErrorCode::ServiceNotSupported,
                )))]
            }
        };
        Some(RoutePacket {
            invoke_id: request.invoke_id,
            service: request.service | RESPONSE_FLAG,
            sender: AmsAddr::new(self.net_id, PORT_SYSTEM_SERVICE),
            tags,
        })
    }

    fn add_route(&self, request: &RoutePacket, peer: SocketAddr) -> AdsResult<()> {
        let name = request
            .tag(tag::ROUTE_NAME)
            .map(Tag::as_text)
            .filter(|n| !n.is_empty())
            .ok_or(AdsError::Protocol(AdsErrorCode::InvalidParameter))?;
        let net_id = match request.tag(tag::NET_ID) {
            Some(t) => NetId::from_bytes(&t.data)?,
            None => request.sender.net_id,
        };
        let host = request
            .tag(tag::HOST)
            .map(Tag::as_text)
            .unwrap_or_else(|| peer.ip().to_string());
        info!(%name, %net_id, %host, "Route added");
        self.table().insert(name.clone(), RouteEntry { name, net_id, host });
        Ok(())
    }

    fn delete_route(&self, request: &RoutePacket) -> AdsResult<()> {
        let name = request
            .tag(tag::ROUTE_NAME)
            .map(Tag::as_text)
            .ok_or(AdsError::Protocol(AdsErrorCode::InvalidParameter))?;
        self.table()
            .remove(&name)
            .map(|_| info!(%name, "Route deleted"))
            .ok_or(AdsError::Protocol(AdsErrorCode::NotFound))
    }

    /// Bind `addr` and answer datagrams until shut down.
    pub async fn spawn(self, addr: &str) -> AdsResult<RunningResponder> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| AdsError::Transport(format!("bind {addr} failed: {e}")))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "Route service listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let responder = self.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "Route socket receive failed");
                                continue;
                            }
                        };
                        let request = match RoutePacket::decode(&buf[..len]) {
                            Ok(p) => p,
                            Err(e) => {
                                trace!(%peer, error = %e, "Dropping datagram");
                                continue;
                            }
                        };
                        if let Some(reply) = responder.handle(&request, peer) {
                            if let Err(e) = socket.send_to(&reply.encode(), peer).await {
                                debug!(%peer, error = %e, "Route reply not sent");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(RunningResponder {
            local_addr,
            responder: self,
            shutdown: shutdown_tx,
            task,
        })
    }
}

fn status(result: AdsResult<()>) -> Tag {
    let code = match result {
        Ok(()) => AdsErrorCode::NoError,
        Err(e) => e.error_code(),
    };
    Tag {
        id: tag::STATUS,
        data: code.as_u32().to_le_bytes().to_vec(),
    }
}

/// Handle to a bound responder.
#[derive(Debug)]
pub struct RunningResponder {
    local_addr: SocketAddr,
    responder: RouteResponder,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningResponder {
    /// Address actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Known routes.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.responder.routes()
    }

    /// Stop answering.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

static NEXT_INVOKE_ID: AtomicU32 = AtomicU32::new(1);

/// Send one request and wait for the matching reply.
async fn exchange(
    target: SocketAddr,
    service: RouteService,
    sender: AmsAddr,
    tags: Vec<Tag>,
    timeout: Duration,
) -> AdsResult<RoutePacket> {
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    let invoke_id = NEXT_INVOKE_ID.fetch_add(1, Ordering::Relaxed);
    let request = RoutePacket::request(invoke_id, service, sender, tags);
    socket.send_to(&request.encode(), target).await?;

    let mut buf = vec![0u8; 2048];
    let wait = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            match RoutePacket::decode(&buf[..len]) {
                Ok(reply)
                    if reply.is_response()
                        && reply.invoke_id == invoke_id
                        && reply.service() == Some(service) =>
                {
                    return Ok::<_, AdsError>(reply);
                }
                Ok(_) => trace!(%from, "Ignoring unrelated route reply"),
                Err(e) => trace!(%from, error = %e, "Dropping datagram"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| AdsError::Timeout(format!("{service:?} to {target} after {timeout:?}")))?
}

/// Ask `target` for its name, NetId and version.
pub async fn query_server_info(
    target: SocketAddr,
    sender: AmsAddr,
    timeout: Duration,
) -> AdsResult<ServerInfo> {
    let reply = exchange(target, RouteService::ServerInfo, sender, Vec::new(), timeout).await?;
    let version = reply
        .tag(tag::VERSION)
        .filter(|t| t.data.len() >= 4)
        .map_or((0, 0, 0), |t| {
            (t.data[0], t.data[1], u16::from_le_bytes([t.data[2], t.data[3]]))
        });
    Ok(ServerInfo {
        addr: reply.sender,
        name: reply.tag(tag::COMPUTER_NAME).map(Tag::as_text).unwrap_or_default(),
        version,
    })
}

/// Register `route` at `target`.
pub async fn add_route(
    target: SocketAddr,
    sender: AmsAddr,
    route: &RouteEntry,
    timeout: Duration,
) -> AdsResult<()> {
    let tags = vec![
        Tag::text(tag::ROUTE_NAME, &route.name),
        Tag {
            id: tag::NET_ID,
            data: route.net_id.octets().to_vec(),
        },
        Tag::text(tag::HOST, &route.host),
    ];
    let reply = exchange(target, RouteService::AddRoute, sender, tags, timeout).await?;
    crate::command::check_result(reply.status())
}

/// Remove the route called `name` at `target`.
pub async fn delete_route(
    target: SocketAddr,
    sender: AmsAddr,
    name: &str,
    timeout: Duration,
) -> AdsResult<()> {
    let tags = vec![Tag::text(tag::ROUTE_NAME, name)];
    let reply = exchange(target, RouteService::DeleteRoute, sender, tags, timeout).await?;
    crate::command::check_result(reply.status())
}
