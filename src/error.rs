/// 自定义错误类型
///
/// 核心模块（传输、握手编解码、转发、调度）统一返回 `TunnelError`，
/// 配置、证书与命令行部分沿用 anyhow
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    TransportError(String),

    /// 传输层握手失败（TLS、WebSocket 升级等）
    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    /// 协议错误（帧长度非法、通道头无法解析等）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 帧长度超出 1..=MSS
    #[error("Frame length {len} out of range (1..={max})")]
    FrameSize { len: usize, max: usize },

    /// 通道不存在或已过期
    #[error("Channel {0:#010x} not found")]
    ChannelNotFound(u32),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 传输已关闭或尚未建立
    #[error("Transmission is closed")]
    Closed,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建握手错误
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建传输层错误
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// 检查是否为协议错误（含帧长度错误）
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ProtocolError(_) | Self::FrameSize { .. })
    }
}

/// 为 future 加上超时，超时映射为 `TunnelError::Timeout`
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error() {
        let err = TunnelError::timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_channel_not_found_formats_hex() {
        let err = TunnelError::ChannelNotFound(0x8000_0007);
        assert_eq!(err.to_string(), "Channel 0x80000007 not found");
    }

    #[test]
    fn test_frame_size_is_protocol_error() {
        let err = TunnelError::FrameSize { len: 600, max: 512 };
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("600"));
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = TunnelError::config_error("test");
        let timeout_err = TunnelError::timeout(Duration::from_secs(1));

        assert!(config_err.is_config_error());
        assert!(!config_err.is_timeout());

        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_config_error());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
