//! Endpoint discovery.
//!
//! The connection actor only consumes the result contract: a [`Task`] that
//! yields the [`NodeEndPoints`] to connect to. Cluster gossip lives elsewhere.

use crate::error::ClientError;
use crate::task::Task;
use evstore_protocol::messages::MasterInfo;
use std::net::{IpAddr, SocketAddr};

/// TCP endpoints of one server node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndPoints {
    pub tcp: SocketAddr,
    pub secure_tcp: Option<SocketAddr>,
}

impl NodeEndPoints {
    pub fn new(tcp: SocketAddr, secure_tcp: Option<SocketAddr>) -> Self {
        Self { tcp, secure_tcp }
    }

    /// Endpoints of the master advertised in a `NotHandled(NotMaster)` response.
    pub fn from_master_info(info: &MasterInfo) -> Result<Self, ClientError> {
        let tcp = socket_addr(&info.external_tcp_address, info.external_tcp_port)?;
        let secure_tcp = match (&info.external_secure_tcp_address, info.external_secure_tcp_port) {
            (Some(address), Some(port)) => Some(socket_addr(address, port)?),
            _ => None,
        };
        Ok(Self { tcp, secure_tcp })
    }

    /// The endpoint to dial for the given transport.
    pub fn select(&self, use_tls: bool) -> Option<SocketAddr> {
        if use_tls {
            self.secure_tcp
        } else {
            Some(self.tcp)
        }
    }
}

fn socket_addr(address: &str, port: i32) -> Result<SocketAddr, ClientError> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| ClientError::ServerError(format!("invalid master address '{}'", address)))?;
    let port = u16::try_from(port)
        .map_err(|_| ClientError::ServerError(format!("invalid master port {}", port)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Resolves the node to connect to.
pub trait EndPointDiscoverer: Send + Sync {
    /// Starts discovery; `failed_endpoint` is the TCP endpoint that just failed, if any.
    fn discover(&self, failed_endpoint: Option<SocketAddr>) -> Task<NodeEndPoints>;
}

/// Always answers with one fixed node.
#[derive(Debug, Clone)]
pub struct StaticEndPointDiscoverer {
    endpoints: NodeEndPoints,
}

impl StaticEndPointDiscoverer {
    pub fn new(endpoints: NodeEndPoints) -> Self {
        Self { endpoints }
    }
}

impl EndPointDiscoverer for StaticEndPointDiscoverer {
    fn discover(&self, _failed_endpoint: Option<SocketAddr>) -> Task<NodeEndPoints> {
        Task::from_result(Ok(self.endpoints))
    }
}
