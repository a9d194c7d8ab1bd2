// 原始 TCP 传输：握手立即成功

use super::{HandshakeRole, Handshaked, Handshaker, Transport, TransportType};
use crate::error::Result;
use async_trait::async_trait;
use std::pin::Pin;

/// 无握手策略（tcp / encryptor）
///
/// encryptor 的密钥在构造时已派生，握手阶段不收发任何字节
pub struct PlainHandshaker {
    kind: TransportType,
}

impl PlainHandshaker {
    pub fn new(kind: TransportType) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Handshaker for PlainHandshaker {
    async fn handshake(
        &self,
        stream: Pin<Box<dyn Transport>>,
        _role: HandshakeRole,
    ) -> Result<Handshaked> {
        Ok(Handshaked::new(stream))
    }

    fn transport_type(&self) -> TransportType {
        self.kind
    }
}
