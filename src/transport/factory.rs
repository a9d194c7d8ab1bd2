// 传输层工厂 - 根据配置创建握手策略与加密器

use crate::config::{AppConfig, EndpointConfig, Mode};
use crate::tls;
use crate::transport::{
    Encryptor, Handshaker, PlainHandshaker, TlsHandshaker, TransportType, WebSocketHandshaker,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// 创建 TLS 握手策略
///
/// 服务端加载证书；客户端以 `tls.host` 或对端地址作为 SNI
fn create_tls_handshaker(
    config: &AppConfig,
    peer: Option<&EndpointConfig>,
) -> Result<TlsHandshaker> {
    match config.mode {
        Mode::Server => {
            let (cert_path, key_path) = match (&config.tls.cert_path, &config.tls.key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => anyhow::bail!("Server TLS requires tls.cert_path and tls.key_path"),
            };
            let server_config = tls::load_server_config(&config.tls, cert_path, key_path)?;
            Ok(TlsHandshaker::server(
                config.protocol,
                TlsAcceptor::from(server_config),
            ))
        }
        Mode::Client => {
            let client_config = tls::load_client_config(&config.tls)?;
            let server_name = config
                .tls
                .host
                .clone()
                .filter(|h| !h.trim().is_empty())
                .or_else(|| peer.map(|p| p.addr.clone()))
                .context("TLS client requires tls.host or a peer address")?;
            let handshaker = TlsHandshaker::client(
                config.protocol,
                TlsConnector::from(client_config),
                &server_name,
            )?;
            Ok(handshaker)
        }
    }
}

/// 创建握手策略
///
/// `peer` 为客户端拨号的目标端点，用于确定 TLS SNI；服务端传 None
pub fn create_handshaker(
    config: &AppConfig,
    peer: Option<&EndpointConfig>,
) -> Result<Arc<dyn Handshaker>> {
    let handshaker: Arc<dyn Handshaker> = match config.protocol {
        TransportType::Tcp | TransportType::Encryptor => {
            Arc::new(PlainHandshaker::new(config.protocol))
        }
        TransportType::Ssl | TransportType::Tls => Arc::new(
            create_tls_handshaker(config, peer).context("Failed to create TLS transport")?,
        ),
        TransportType::WebSocket => Arc::new(WebSocketHandshaker::new(
            config.protocol,
            &config.websocket.host,
            &config.websocket.path,
            None,
        )),
        TransportType::WebSocketSsl | TransportType::WebSocketTls => {
            let tls = create_tls_handshaker(config, peer)
                .context("Failed to create WebSocket TLS transport")?;
            Arc::new(WebSocketHandshaker::new(
                config.protocol,
                &config.websocket.host,
                &config.websocket.path,
                Some(tls),
            ))
        }
    };

    Ok(handshaker)
}

/// 创建流加密器（仅 encryptor 协议）
pub fn create_encryptor(config: &AppConfig) -> Result<Option<Arc<Encryptor>>> {
    if config.protocol != TransportType::Encryptor {
        return Ok(None);
    }

    let settings = config
        .encryptor
        .as_ref()
        .context("protocol 'encryptor' requires an [encryptor] section")?;
    let encryptor = Encryptor::new(&settings.method, &settings.password)
        .context("Failed to initialize encryptor")?;
    Ok(Some(Arc::new(encryptor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptorConfig;

    fn config(mode: Mode, protocol: TransportType) -> AppConfig {
        let mut config = AppConfig::new(
            mode,
            EndpointConfig::new("127.0.0.1", 7000),
            EndpointConfig::new("127.0.0.1", 7001),
        );
        config.protocol = protocol;
        config.websocket.host = "localhost".to_string();
        config
    }

    #[test]
    fn test_plain_handshaker() {
        let handshaker = create_handshaker(&config(Mode::Client, TransportType::Tcp), None).unwrap();
        assert_eq!(handshaker.transport_type(), TransportType::Tcp);
    }

    #[test]
    fn test_server_tls_requires_certs() {
        let result = create_handshaker(&config(Mode::Server, TransportType::Tls), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_tls_uses_peer_address() {
        let config = config(Mode::Client, TransportType::WebSocketTls);
        let peer = config.inbound.clone();
        let handshaker = create_handshaker(&config, Some(&peer)).unwrap();
        assert_eq!(handshaker.transport_type(), TransportType::WebSocketTls);
    }

    #[test]
    fn test_create_encryptor() {
        let mut config = config(Mode::Client, TransportType::Tcp);
        assert!(create_encryptor(&config).unwrap().is_none());

        config.protocol = TransportType::Encryptor;
        assert!(create_encryptor(&config).is_err());

        config.encryptor = Some(EncryptorConfig {
            method: "aes-128-ctr".to_string(),
            password: "pw".to_string(),
        });
        let encryptor = create_encryptor(&config).unwrap().unwrap();
        assert_eq!(encryptor.method(), "aes-128-ctr");
    }
}
