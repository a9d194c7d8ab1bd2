/// UDS Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transmission;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use client::{run_client, Router};
pub use config::{AppConfig, EndpointConfig, Mode};
pub use error::{Result, TunnelError};
pub use server::{run_server, ChannelRegistry, Switches};
pub use stats::{TrafficSnapshot, TrafficStats};
pub use transmission::{Transmission, TransmissionFactory};
pub use transport::TransportType;
pub use tunnel::{ChannelId, Connection, ConnectionHandle, Endpoint};
