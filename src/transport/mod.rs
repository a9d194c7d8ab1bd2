mod encryptor;
mod factory;
mod tcp;
mod tls;
mod websocket;

pub use encryptor::Encryptor;
pub use factory::{create_encryptor, create_handshaker};
pub use tcp::PlainHandshaker;
pub use tls::TlsHandshaker;
pub use websocket::{check_path, real_client_ip, WebSocketHandshaker, WsStream};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportType {
    /// 原始 TCP
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    /// TLS（与 tls 等价）
    #[serde(rename = "ssl")]
    Ssl,
    /// TLS 1.3
    #[serde(rename = "tls")]
    Tls,
    /// 逐帧流加密
    #[serde(rename = "encryptor")]
    Encryptor,
    /// WebSocket
    #[serde(rename = "websocket")]
    WebSocket,
    /// WebSocket over TLS（与 websocket+tls 等价）
    #[serde(rename = "websocket+ssl")]
    WebSocketSsl,
    /// WebSocket over TLS
    #[serde(rename = "websocket+tls")]
    WebSocketTls,
}

impl TransportType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::Ssl => "ssl",
            TransportType::Tls => "tls",
            TransportType::Encryptor => "encryptor",
            TransportType::WebSocket => "websocket",
            TransportType::WebSocketSsl => "websocket+ssl",
            TransportType::WebSocketTls => "websocket+tls",
        }
    }

    /// 是否需要 TLS 握手
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            TransportType::Ssl
                | TransportType::Tls
                | TransportType::WebSocketSsl
                | TransportType::WebSocketTls
        )
    }

    /// 是否需要 WebSocket 升级
    pub fn is_websocket(self) -> bool {
        matches!(
            self,
            TransportType::WebSocket | TransportType::WebSocketSsl | TransportType::WebSocketTls
        )
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "ssl" => Ok(Self::Ssl),
            "tls" => Ok(Self::Tls),
            "encryptor" => Ok(Self::Encryptor),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "websocket+ssl" => Ok(Self::WebSocketSsl),
            "websocket+tls" | "wss" => Ok(Self::WebSocketTls),
            _ => anyhow::bail!("Unknown transport type: {}", s),
        }
    }
}

/// 握手角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// 主动拨号的一方
    Client,
    /// 接受连接的一方
    Server,
}

/// 传输层连接抽象
///
/// 统一封装不同传输方式（TCP、TLS、WebSocket）的字节流
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 握手完成后的字节流
pub struct Handshaked {
    pub stream: Pin<Box<dyn Transport>>,
    /// 由代理头部（X-Real-IP 等）得到的真实客户端地址
    pub real_ip: Option<IpAddr>,
}

impl Handshaked {
    pub fn new(stream: Pin<Box<dyn Transport>>) -> Self {
        Self {
            stream,
            real_ip: None,
        }
    }
}

/// 握手策略
///
/// 组合进 `Transmission`，在原始 socket 上完成协议相关的握手
#[async_trait]
pub trait Handshaker: Send + Sync {
    /// 在给定字节流上执行握手
    async fn handshake(
        &self,
        stream: Pin<Box<dyn Transport>>,
        role: HandshakeRole,
    ) -> Result<Handshaked>;

    /// 获取传输类型
    fn transport_type(&self) -> TransportType;
}
