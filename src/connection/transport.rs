//! Transport boundary
//!
//! The engine consumes a byte-stream duplex connection; dialing is behind
//! the [`Connector`] trait so tests can plug in in-memory duplex pipes and
//! applications can supply TLS-wrapped streams. TLS negotiation itself is
//! an external collaborator: [`TcpConnector`] handles plain `mqtt://`
//! endpoints only.

use crate::config::BrokerEndpoint;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any byte-stream duplex usable as an MQTT transport
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type ByteStream = Box<dyn StreamIo>;

/// Dials a fresh transport connection. Called once per connect or
/// reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::io::Result<ByteStream>;
}

/// Plain TCP connector for `mqtt://` broker URLs
pub struct TcpConnector {
    endpoint: BrokerEndpoint,
}

impl TcpConnector {
    pub fn new(endpoint: BrokerEndpoint) -> std::io::Result<Self> {
        if endpoint.tls {
            // TLS handshakes live outside the engine; callers bring their
            // own connector for mqtts:// endpoints.
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "mqtts:// requires a custom Connector providing the TLS stream",
            ));
        }
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<ByteStream> {
        let stream =
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn test_tcp_connector_rejects_tls_endpoints() {
        let endpoint = ClientConfig::new("mqtts://broker.example.com")
            .broker_endpoint()
            .unwrap();
        let result = TcpConnector::new(endpoint);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connector_surfaces_dial_errors() {
        // Port 1 on localhost is almost certainly closed.
        let endpoint = ClientConfig::new("mqtt://127.0.0.1:1")
            .broker_endpoint()
            .unwrap();
        let connector = TcpConnector::new(endpoint).unwrap();
        assert!(connector.connect().await.is_err());
    }
}
