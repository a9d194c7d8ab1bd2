// TLS 传输：tokio-rustls 握手

use super::{HandshakeRole, Handshaked, Handshaker, Transport, TransportType};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::pin::Pin;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS 握手策略
///
/// 服务端持有 acceptor，客户端持有 connector 与 SNI 名称
#[derive(Clone)]
pub struct TlsHandshaker {
    kind: TransportType,
    acceptor: Option<TlsAcceptor>,
    connector: Option<(TlsConnector, ServerName<'static>)>,
}

impl TlsHandshaker {
    pub fn server(kind: TransportType, acceptor: TlsAcceptor) -> Self {
        Self {
            kind,
            acceptor: Some(acceptor),
            connector: None,
        }
    }

    pub fn client(kind: TransportType, connector: TlsConnector, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            TunnelError::config_error(format!("Invalid TLS server name '{}': {}", server_name, e))
        })?;
        Ok(Self {
            kind,
            acceptor: None,
            connector: Some((connector, server_name)),
        })
    }

    /// 在字节流外层包裹 TLS
    pub(crate) async fn wrap(
        &self,
        stream: Pin<Box<dyn Transport>>,
        role: HandshakeRole,
    ) -> Result<Pin<Box<dyn Transport>>> {
        match role {
            HandshakeRole::Server => {
                let acceptor = self
                    .acceptor
                    .as_ref()
                    .ok_or_else(|| TunnelError::handshake("TLS acceptor not configured"))?;
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TunnelError::handshake(format!("TLS accept failed: {}", e)))?;
                Ok(Box::pin(tls_stream))
            }
            HandshakeRole::Client => {
                let (connector, server_name) = self
                    .connector
                    .as_ref()
                    .ok_or_else(|| TunnelError::handshake("TLS connector not configured"))?;
                let tls_stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| TunnelError::handshake(format!("TLS connect failed: {}", e)))?;
                Ok(Box::pin(tls_stream))
            }
        }
    }
}

#[async_trait]
impl Handshaker for TlsHandshaker {
    async fn handshake(
        &self,
        stream: Pin<Box<dyn Transport>>,
        role: HandshakeRole,
    ) -> Result<Handshaked> {
        let stream = self.wrap(stream, role).await?;
        Ok(Handshaked::new(stream))
    }

    fn transport_type(&self) -> TransportType {
        self.kind
    }
}
