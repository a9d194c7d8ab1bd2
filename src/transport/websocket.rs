// WebSocket 传输实现
//
// 升级完成后每次写入作为一条二进制消息发送，长度前缀分帧位于消息负载内

use super::tls::TlsHandshaker;
use super::{HandshakeRole, Handshaked, Handshaker, Transport, TransportType};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};
use tracing::debug;

/// 真实客户端地址头部，按优先级排列
const REAL_IP_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "remote-host",
    "x-forwarded-for",
];

/// 校验请求路径是否位于根路径之下
///
/// 根路径长度不超过 1 时全部接受；否则忽略大小写与查询串，
/// 要求与根路径相同或以 "根路径/" 开头
pub fn check_path(root: &str, target: &str) -> bool {
    if root.len() <= 1 {
        return true;
    }

    let mut path = target.trim().to_lowercase();
    if let Some(index) = path.find(['?', '#']) {
        path.truncate(index);
    }

    let root = root.to_lowercase();
    if path == root {
        return true;
    }

    match path.strip_prefix(root.as_str()) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// 从代理头部提取真实客户端 IP
pub fn real_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    REAL_IP_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        // X-Forwarded-For 可能是逗号分隔的列表，取第一个
        value.split(',').next()?.trim().parse::<IpAddr>().ok()
    })
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// WebSocket 握手策略，可选在外层先完成 TLS
pub struct WebSocketHandshaker {
    kind: TransportType,
    host: String,
    path: String,
    tls: Option<TlsHandshaker>,
}

impl WebSocketHandshaker {
    pub fn new(kind: TransportType, host: &str, path: &str, tls: Option<TlsHandshaker>) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        Self {
            kind,
            host: host.to_string(),
            path: path.to_string(),
            tls,
        }
    }
}

#[async_trait]
impl Handshaker for WebSocketHandshaker {
    async fn handshake(
        &self,
        stream: Pin<Box<dyn Transport>>,
        role: HandshakeRole,
    ) -> Result<Handshaked> {
        let stream = match &self.tls {
            Some(tls) => tls.wrap(stream, role).await?,
            None => stream,
        };

        match role {
            HandshakeRole::Client => {
                let url = format!("ws://{}{}", self.host, self.path);
                let (ws, _) = client_async(url.as_str(), stream).await.map_err(|e| {
                    TunnelError::handshake(format!("WebSocket upgrade to {} failed: {}", url, e))
                })?;
                Ok(Handshaked::new(Box::pin(WsStream::new(ws))))
            }
            HandshakeRole::Server => {
                let root = self.path.as_str();
                let mut real_ip = None;
                let callback = |request: &Request, response: Response| {
                    let target = request.uri().to_string();
                    if !check_path(root, &target) {
                        debug!("Rejecting WebSocket upgrade for path {}", target);
                        return Err(not_found());
                    }
                    real_ip = real_client_ip(request.headers());
                    Ok(response)
                };

                let ws = accept_hdr_async(stream, callback).await.map_err(|e| {
                    TunnelError::handshake(format!("WebSocket accept failed: {}", e))
                })?;

                Ok(Handshaked {
                    stream: Box::pin(WsStream::new(ws)),
                    real_ip,
                })
            }
        }
    }

    fn transport_type(&self) -> TransportType {
        self.kind
    }
}

/// WebSocket 流包装器，实现 AsyncRead + AsyncWrite
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // 先消费上一条消息的剩余数据
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = data,
                Some(Ok(Message::Text(text))) => {
                    this.read_buf = Bytes::copy_from_slice(text.as_bytes())
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // Ping/Pong 由 tungstenite 自动处理
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()))
                }
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }
}
