// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::transport::TransportType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 最小帧对齐长度
pub const MIN_ALIGNMENT: usize = 510;

/// 帧对齐上限（2 字节长度前缀可表示的最大值）
pub const MAX_ALIGNMENT: usize = 65535;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 客户端：接受本地连接，拨出两条隧道腿
    #[default]
    Client,
    /// 服务端：两个监听器，按通道号配对隧道腿
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// 网络端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// IP 地址或域名
    pub addr: String,
    /// 端口
    pub port: u16,
    /// `addr` 是否为需要解析的域名
    #[serde(default)]
    pub domain: bool,
}

impl EndpointConfig {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            domain: false,
        }
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') && !self.domain {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// TLS 配置（tls / ssl / websocket+tls / websocket+ssl）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// 客户端 SNI 主机名，未设置时使用对端地址
    pub host: Option<String>,
    /// 客户端是否校验服务端证书
    pub verify_peer: bool,
    /// 客户端自定义 CA 证书
    pub ca_cert_path: Option<PathBuf>,
    /// 服务端证书
    pub cert_path: Option<PathBuf>,
    /// 服务端私钥
    pub key_path: Option<PathBuf>,
    /// 服务端附加证书链
    pub chain_path: Option<PathBuf>,
    /// 加密私钥的口令
    pub key_password: Option<String>,
    /// OpenSSL 风格的套件列表，如 "TLS_AES_256_GCM_SHA384:TLS_AES_128_GCM_SHA256"
    pub ciphersuites: Option<String>,
}

/// WebSocket 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// 客户端发送的 Host
    #[serde(default)]
    pub host: String,
    /// 升级路径（服务端作为根路径校验）
    #[serde(default = "default_ws_path")]
    pub path: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            path: default_ws_path(),
        }
    }
}

/// 流加密配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptorConfig {
    /// 加密算法，如 "aes-256-cfb"
    pub method: String,
    /// 密码
    pub password: String,
}

/// 超时配置（秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// 拨号、通道握手与待配对通道的超时
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// 传输层握手超时
    #[serde(default = "default_handshake_timeout")]
    pub handshake: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            handshake: default_handshake_timeout(),
        }
    }
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_alignment() -> usize {
    MIN_ALIGNMENT
}

fn default_backlog() -> u32 {
    511
}

fn default_no_delay() -> bool {
    true
}

/// 应用配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 运行模式
    #[serde(default)]
    pub mode: Mode,
    /// 传输协议
    #[serde(default)]
    pub protocol: TransportType,
    /// 客户端：本地监听端点；服务端：可选的转发目标，缺省时直接桥接两条隧道腿
    #[serde(default)]
    pub local: Option<EndpointConfig>,
    /// 入站腿端点（客户端拨号目标 / 服务端监听地址）
    pub inbound: EndpointConfig,
    /// 出站腿端点（客户端拨号目标 / 服务端监听地址）
    pub outbound: EndpointConfig,
    /// 帧对齐长度（最大分段长度）
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    /// 监听队列长度
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// 是否随机设置通道号的反转位
    #[serde(default)]
    pub inversion: bool,
    /// TCP_NODELAY
    #[serde(default = "default_no_delay")]
    pub no_delay: bool,
    /// TCP keep-alive
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub encryptor: Option<EncryptorConfig>,
}

impl AppConfig {
    /// 以默认参数创建配置
    pub fn new(mode: Mode, inbound: EndpointConfig, outbound: EndpointConfig) -> Self {
        Self {
            mode,
            protocol: TransportType::default(),
            local: None,
            inbound,
            outbound,
            alignment: default_alignment(),
            backlog: default_backlog(),
            inversion: false,
            no_delay: default_no_delay(),
            keep_alive: false,
            timeout: TimeoutConfig::default(),
            tls: TlsConfig::default(),
            websocket: WebSocketConfig::default(),
            encryptor: None,
        }
    }

    /// 从文件加载配置并校验
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// 从 TOML 文本解析配置并校验
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate(self)
    }

    /// 协商后的最大分段长度，限制在 [510, 65535]
    pub fn max_segment_size(&self) -> usize {
        self.alignment.clamp(MIN_ALIGNMENT, MAX_ALIGNMENT)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.connect)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_TOML: &str = r#"
mode = "client"
protocol = "websocket+tls"
alignment = 1400
inversion = true

[local]
addr = "127.0.0.1"
port = 1080

[inbound]
addr = "tunnel.example.com"
port = 8443
domain = true

[outbound]
addr = "tunnel.example.com"
port = 9443
domain = true

[websocket]
host = "tunnel.example.com"
path = "/ws"

[tls]
host = "tunnel.example.com"
verify_peer = true
"#;

    #[test]
    fn test_parse_client_config() {
        let config = AppConfig::from_toml(CLIENT_TOML).unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.protocol, TransportType::WebSocketTls);
        assert_eq!(config.local, Some(EndpointConfig::new("127.0.0.1", 1080)));
        assert!(config.inbound.domain);
        assert_eq!(config.websocket.path, "/ws");
        assert!(config.tls.verify_peer);
        assert!(config.inversion);
        assert_eq!(config.max_segment_size(), 1400);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml(
            r#"
mode = "server"
[inbound]
addr = "0.0.0.0"
port = 7000
[outbound]
addr = "0.0.0.0"
port = 7001
"#,
        )
        .unwrap();
        assert_eq!(config.protocol, TransportType::Tcp);
        assert_eq!(config.backlog, 511);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_segment_size(), MIN_ALIGNMENT);
        assert!(config.no_delay);
        assert!(config.local.is_none());
    }

    #[test]
    fn test_max_segment_size_clamped() {
        let mut config = AppConfig::new(
            Mode::Server,
            EndpointConfig::new("127.0.0.1", 7000),
            EndpointConfig::new("127.0.0.1", 7001),
        );
        config.alignment = 100;
        assert_eq!(config.max_segment_size(), 510);
        config.alignment = 100_000;
        assert_eq!(config.max_segment_size(), 65535);
        config.alignment = 512;
        assert_eq!(config.max_segment_size(), 512);
    }

    #[test]
    fn test_protocol_names() {
        for (name, expected) in [
            ("tcp", TransportType::Tcp),
            ("ssl", TransportType::Ssl),
            ("tls", TransportType::Tls),
            ("encryptor", TransportType::Encryptor),
            ("websocket", TransportType::WebSocket),
            ("websocket+ssl", TransportType::WebSocketSsl),
            ("websocket+tls", TransportType::WebSocketTls),
        ] {
            let toml = format!(
                "mode = \"server\"\nprotocol = \"{}\"\n[inbound]\naddr = \"127.0.0.1\"\nport = 1\n[outbound]\naddr = \"127.0.0.1\"\nport = 2\n[encryptor]\nmethod = \"aes-128-cfb\"\npassword = \"pw\"\n[websocket]\nhost = \"h\"\n",
                name
            );
            let config = AppConfig::from_toml(&toml).unwrap();
            assert_eq!(config.protocol, expected);
        }
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(EndpointConfig::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
        assert_eq!(EndpointConfig::new("::1", 80).to_string(), "[::1]:80");
    }
}
