/// 分帧传输
///
/// 在一条原始字节流上叠加 2 字节大端长度前缀的分帧格式，
/// 帧长度限定在 1..=MSS。握手策略决定字节流外层的协议（TLS、WebSocket 等），
/// 流加密器（若有）在分帧之前加密、读取之后解密。
use crate::config::{AppConfig, EndpointConfig};
use crate::error::{with_timeout, Result, TunnelError};
use crate::net::{self, SocketOptions};
use crate::transport::{
    create_encryptor, create_handshaker, Encryptor, HandshakeRole, Handshaker, Transport,
    TransportType,
};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// 长度前缀字节数
pub const FRAME_HEADER_LEN: usize = 2;

/// 关闭时等待对端确认（TLS close_notify、WebSocket Close）的上限
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedTransport = Pin<Box<dyn Transport>>;

/// 握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionState {
    Unestablished,
    Handshaking,
    Established,
    Closed,
}

/// 读半部：固定大小的接收缓冲区
pub struct FrameReader {
    inner: ReadHalf<BoxedTransport>,
    cipher: Option<Arc<Encryptor>>,
    mss: usize,
    buf: Vec<u8>,
    plain: Vec<u8>,
}

impl FrameReader {
    fn new(inner: ReadHalf<BoxedTransport>, cipher: Option<Arc<Encryptor>>, mss: usize) -> Self {
        Self {
            inner,
            cipher,
            mss,
            buf: vec![0u8; mss],
            plain: Vec::with_capacity(mss),
        }
    }

    /// 读取一帧；长度非法、截断或 EOF 均为致命错误
    pub async fn read_frame(&mut self) -> Result<&[u8]> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.inner.read_exact(&mut header).await?;

        let len = u16::from_be_bytes(header) as usize;
        if len == 0 || len > self.mss {
            return Err(TunnelError::FrameSize { len, max: self.mss });
        }

        self.inner.read_exact(&mut self.buf[..len]).await?;

        match &self.cipher {
            Some(cipher) => {
                cipher.decrypt(&self.buf[..len], &mut self.plain)?;
                Ok(&self.plain)
            }
            None => Ok(&self.buf[..len]),
        }
    }

    pub fn max_segment_size(&self) -> usize {
        self.mss
    }
}

/// 写半部
///
/// 可克隆；所有克隆共享一把 FIFO 公平锁，同一时刻只有一个写操作在进行，
/// 其余写操作按到达顺序排队
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<WriteHalf<BoxedTransport>>>,
    cipher: Option<Arc<Encryptor>>,
    mss: usize,
}

impl FrameWriter {
    fn new(inner: WriteHalf<BoxedTransport>, cipher: Option<Arc<Encryptor>>, mss: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            cipher,
            mss,
        }
    }

    /// 写入一帧，负载长度必须在 1..=MSS
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > self.mss {
            return Err(TunnelError::FrameSize {
                len: payload.len(),
                max: self.mss,
            });
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        match &self.cipher {
            Some(cipher) => {
                let mut encrypted = Vec::with_capacity(payload.len());
                cipher.encrypt(payload, &mut encrypted)?;
                if encrypted.is_empty() || encrypted.len() > self.mss {
                    return Err(TunnelError::FrameSize {
                        len: encrypted.len(),
                        max: self.mss,
                    });
                }
                frame.put_u16(encrypted.len() as u16);
                frame.put_slice(&encrypted);
            }
            None => {
                frame.put_u16(payload.len() as u16);
                frame.put_slice(payload);
            }
        }

        let mut inner = self.inner.lock().await;
        inner.write_all(&frame).await?;
        inner.flush().await?;
        Ok(())
    }

    /// 关闭写方向，错误忽略
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, inner.shutdown()).await;
    }

    pub fn max_segment_size(&self) -> usize {
        self.mss
    }
}

/// 一条分帧传输连接
pub struct Transmission {
    kind: TransportType,
    state: TransmissionState,
    mss: usize,
    remote_addr: SocketAddr,
    socket: Option<TcpStream>,
    handshaker: Arc<dyn Handshaker>,
    cipher: Option<Arc<Encryptor>>,
    reader: Option<FrameReader>,
    writer: Option<FrameWriter>,
}

impl Transmission {
    pub fn new(
        socket: TcpStream,
        handshaker: Arc<dyn Handshaker>,
        cipher: Option<Arc<Encryptor>>,
        mss: usize,
    ) -> Result<Self> {
        let remote_addr = socket.peer_addr()?;
        Ok(Self {
            kind: handshaker.transport_type(),
            state: TransmissionState::Unestablished,
            mss,
            remote_addr,
            socket: Some(socket),
            handshaker,
            cipher,
            reader: None,
            writer: None,
        })
    }

    /// 执行握手，仅能在 Unestablished 状态调用一次
    pub async fn handshake(&mut self, role: HandshakeRole) -> Result<()> {
        if self.state != TransmissionState::Unestablished {
            return Err(TunnelError::handshake(format!(
                "cannot handshake in state {:?}",
                self.state
            )));
        }
        let socket = self.socket.take().ok_or(TunnelError::Closed)?;
        self.state = TransmissionState::Handshaking;

        let handshaked = match self.handshaker.handshake(Box::pin(socket), role).await {
            Ok(handshaked) => handshaked,
            Err(e) => {
                self.state = TransmissionState::Closed;
                return Err(e);
            }
        };

        if let Some(ip) = handshaked.real_ip {
            self.remote_addr = SocketAddr::new(ip, self.remote_addr.port());
        }

        let (read_half, write_half) = tokio::io::split(handshaked.stream);
        self.reader = Some(FrameReader::new(read_half, self.cipher.clone(), self.mss));
        self.writer = Some(FrameWriter::new(write_half, self.cipher.clone(), self.mss));
        self.state = TransmissionState::Established;
        Ok(())
    }

    /// 读取一帧
    pub async fn read_frame(&mut self) -> Result<&[u8]> {
        match self.reader.as_mut() {
            Some(reader) if self.state == TransmissionState::Established => {
                reader.read_frame().await
            }
            _ => Err(TunnelError::Closed),
        }
    }

    /// 写入一帧
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        self.writer()?.write_frame(payload).await
    }

    /// 获取共享写半部
    pub fn writer(&self) -> Result<FrameWriter> {
        match &self.writer {
            Some(writer) if self.state == TransmissionState::Established => Ok(writer.clone()),
            _ => Err(TunnelError::Closed),
        }
    }

    /// 关闭连接，可重复调用
    pub async fn close(&mut self) {
        if self.state == TransmissionState::Closed {
            return;
        }
        self.state = TransmissionState::Closed;
        if let Some(writer) = self.writer.take() {
            writer.shutdown().await;
        }
        self.reader = None;
        self.socket = None;
    }

    /// 拆分为读、写两半，交给转发器
    pub fn into_split(mut self) -> Result<(FrameReader, FrameWriter)> {
        if self.state != TransmissionState::Established {
            return Err(TunnelError::Closed);
        }
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Ok((reader, writer)),
            _ => Err(TunnelError::Closed),
        }
    }

    pub fn state(&self) -> TransmissionState {
        self.state
    }

    pub fn kind(&self) -> TransportType {
        self.kind
    }

    pub fn max_segment_size(&self) -> usize {
        self.mss
    }

    /// 远端地址，WebSocket 代理头部会修正其 IP
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl fmt::Debug for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmission")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("remote_addr", &self.remote_addr)
            .field("mss", &self.mss)
            .finish()
    }
}

/// 按配置创建传输连接
#[derive(Clone)]
pub struct TransmissionFactory {
    handshaker: Arc<dyn Handshaker>,
    cipher: Option<Arc<Encryptor>>,
    mss: usize,
    options: SocketOptions,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TransmissionFactory {
    /// `peer` 为客户端拨号目标（决定 TLS SNI），服务端传 None
    pub fn new(config: &AppConfig, peer: Option<&EndpointConfig>) -> anyhow::Result<Self> {
        Ok(Self {
            handshaker: create_handshaker(config, peer)?,
            cipher: create_encryptor(config)?,
            mss: config.max_segment_size(),
            options: SocketOptions {
                no_delay: config.no_delay,
                keep_alive: config.keep_alive,
            },
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
        })
    }

    /// 直接由组件构造
    pub fn from_parts(
        handshaker: Arc<dyn Handshaker>,
        cipher: Option<Arc<Encryptor>>,
        mss: usize,
    ) -> Self {
        Self {
            handshaker,
            cipher,
            mss,
            options: SocketOptions {
                no_delay: true,
                keep_alive: false,
            },
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// 包装一个 socket，不执行握手
    pub fn create(&self, socket: TcpStream) -> Result<Transmission> {
        Transmission::new(socket, self.handshaker.clone(), self.cipher.clone(), self.mss)
    }

    /// 包装已接受的 socket 并以服务端角色握手
    pub async fn accept(&self, socket: TcpStream) -> Result<Transmission> {
        net::apply_options(&socket, self.options);
        let mut transmission = self.create(socket)?;
        with_timeout(
            self.handshake_timeout,
            transmission.handshake(HandshakeRole::Server),
        )
        .await?;
        Ok(transmission)
    }

    /// 拨号并以客户端角色握手
    pub async fn connect(&self, addr: SocketAddr) -> Result<Transmission> {
        let socket = net::connect(addr, self.connect_timeout, self.options).await?;
        let mut transmission = self.create(socket)?;
        with_timeout(
            self.handshake_timeout,
            transmission.handshake(HandshakeRole::Client),
        )
        .await?;
        Ok(transmission)
    }

    pub fn transport_type(&self) -> TransportType {
        self.handshaker.transport_type()
    }

    pub fn max_segment_size(&self) -> usize {
        self.mss
    }
}
