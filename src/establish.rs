use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use rand::seq::SliceRandom;
use socks5::{Endpoint, ReplyStatus};
use tokio::net::{TcpSocket, TcpStream};

use crate::balancer::{Balancer, BalancerError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("no addresses found for {0}")]
    NoRoute(String),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error("bind {local}: {source}")]
    Bind { local: IpAddr, source: io::Error },
    #[error("connect {remote}: {source}")]
    Connect { remote: SocketAddr, source: io::Error },
    #[error("connect {remote}: timed out after {timeout:?}")]
    Timeout { remote: SocketAddr, timeout: Duration },
}

impl ConnectError {
    pub fn reply_status(&self) -> ReplyStatus {
        match self {
            ConnectError::Timeout { .. } => ReplyStatus::TtlExpired,
            ConnectError::Connect { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                ReplyStatus::TtlExpired
            }
            _ => ReplyStatus::GeneralFailure,
        }
    }
}

#[async_trait]
pub trait Resolver: Sync + Send {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver on tokio's blocking pool, so a slow
/// lookup never stalls a runtime worker.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// The local and remote address chosen for one outbound connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Route {
    pub local: IpAddr,
    pub remote: SocketAddr,
}

/// Opens outbound connections from balanced local addresses.
///
/// Cheap to clone; clones share the balancer and resolver.
#[derive(Clone)]
pub struct Establisher {
    balancer: Arc<dyn Balancer>,
    resolver: Arc<dyn Resolver>,
    timeout: Duration,
}

impl Establisher {
    pub fn new(balancer: Arc<dyn Balancer>, resolver: Arc<dyn Resolver>, timeout: Duration) -> Self {
        Self {
            balancer,
            resolver,
            timeout,
        }
    }

    /// Resolves `endpoint` and picks the local address first, then a remote
    /// candidate of the same family.
    pub async fn route(&self, endpoint: &Endpoint) -> Result<Route, ConnectError> {
        let (v4, v6) = self.candidates(endpoint).await?;

        let local = self.balancer.next(!v4.is_empty(), !v6.is_empty())?;

        let family = if local.is_ipv4() { &v4 } else { &v6 };
        let remote = family
            .choose(&mut rand::thread_rng())
            .ok_or(BalancerError::Exhausted {
                v4: !v4.is_empty(),
                v6: !v6.is_empty(),
            })?;

        Ok(Route {
            local,
            remote: SocketAddr::new(*remote, endpoint.port()),
        })
    }

    pub async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, ConnectError> {
        let route = self.route(endpoint).await?;
        info!("Connecting to {} from {}", route.remote, route.local);
        self.connect_route(route).await
    }

    async fn connect_route(&self, route: Route) -> Result<TcpStream, ConnectError> {
        let Route { local, remote } = route;
        let bind_err = |source: io::Error| ConnectError::Bind { local, source };

        let socket = match local {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(bind_err)?;
        socket.set_keepalive(true).map_err(bind_err)?;
        socket.bind(SocketAddr::new(local, 0)).map_err(bind_err)?;

        match tokio::time::timeout(self.timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Connect { remote, source }),
            Err(_) => Err(ConnectError::Timeout {
                remote,
                timeout: self.timeout,
            }),
        }
    }

    /// Candidate remote addresses, split by family.
    async fn candidates(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Vec<IpAddr>, Vec<IpAddr>), ConnectError> {
        let addrs = match endpoint {
            Endpoint::Ip(addr) => vec![addr.ip()],
            Endpoint::Host(host, _) => match host.parse::<IpAddr>() {
                Ok(ip) => vec![ip],
                Err(_) => {
                    let addrs = self.resolver.resolve(host).await.map_err(|source| {
                        ConnectError::Resolve {
                            host: host.clone(),
                            source,
                        }
                    })?;
                    info!("Resolved {}: {:?}", host, addrs);
                    addrs
                }
            },
        };

        let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = addrs.into_iter().partition(IpAddr::is_ipv4);
        if v4.is_empty() && v6.is_empty() {
            return Err(ConnectError::NoRoute(endpoint.to_string()));
        }

        Ok((v4, v6))
    }
}
