//! Byte transport under the device link.
//!
//! The board sits behind a serial device server, so production traffic is a
//! plain TCP stream of newline-framed lines. Tests substitute an in-process
//! transport backed by a board model.

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::error::LinkError;

/// One established connection. Lines are sent and received without their
/// trailing newline.
pub trait Transport: Send {
    fn send_line(&mut self, line: &str) -> impl Future<Output = Result<(), LinkError>> + Send;
    fn recv_line(&mut self) -> impl Future<Output = Result<String, LinkError>> + Send;
}

/// Connection factory owned by the link task. `forget_endpoint` drops any
/// cached endpoint identity so the next connect re-discovers the board.
pub trait Connector: Send + 'static {
    type Conn: Transport + 'static;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Conn, LinkError>> + Send;
    fn forget_endpoint(&mut self);
}

pub struct TcpTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Transport for TcpTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|_| LinkError::Disconnected)?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|_| LinkError::Disconnected)?;
        self.writer
            .flush()
            .await
            .map_err(|_| LinkError::Disconnected)
    }

    async fn recv_line(&mut self) -> Result<String, LinkError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|_| LinkError::Disconnected)?;
        if n == 0 {
            return Err(LinkError::Disconnected);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

pub struct TcpConnector {
    configured: String,
    resolved: Option<SocketAddr>,
}

impl TcpConnector {
    pub fn new(address: &str) -> Self {
        Self {
            configured: address.to_string(),
            resolved: None,
        }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpTransport;

    async fn connect(&mut self) -> Result<TcpTransport, LinkError> {
        let addr = match self.resolved {
            Some(addr) => addr,
            None => {
                let addr = lookup_host(&self.configured)
                    .await
                    .map_err(|_| LinkError::Disconnected)?
                    .next()
                    .ok_or(LinkError::Disconnected)?;
                debug!(%addr, "resolved board endpoint");
                self.resolved = Some(addr);
                addr
            }
        };
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| LinkError::Disconnected)?;
        stream.set_nodelay(true).map_err(|_| LinkError::Disconnected)?;
        let (read, write) = stream.into_split();
        Ok(TcpTransport {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    fn forget_endpoint(&mut self) {
        self.resolved = None;
    }
}
