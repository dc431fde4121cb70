//! Connection files.
//!
//! The kernel reads its ports and signing key from a JSON connection file passed on its command line.

use std::io;
use std::net::TcpListener;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const TRANSPORT_TCP: &str = "tcp";
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub key: String,
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

impl ConnectionInfo {
    /// Pick five free TCP ports on `ip` and a fresh signing key.
    ///
    /// All listeners are held until every port is chosen so the five ports are distinct. The kernel binds them
    /// after the listeners are dropped.
    pub fn allocate(ip: &str, kernel_name: &str) -> io::Result<Self> {
        let listeners = (0..5)
            .map(|_| TcpListener::bind((ip, 0)))
            .collect::<io::Result<Vec<_>>>()?;
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|addr| addr.port()))
            .collect::<io::Result<Vec<_>>>()?;
        drop(listeners);

        Ok(Self {
            ip: ip.to_string(),
            transport: TRANSPORT_TCP.to_string(),
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            key: uuid::Uuid::new_v4().to_string(),
            signature_scheme: SIGNATURE_SCHEME.to_string(),
            kernel_name: kernel_name.to_string(),
        })
    }

    /// ZeroMQ endpoint for one of this connection's ports.
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)
    }
}
