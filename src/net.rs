// 套接字监听、拨号与地址解析

use crate::config::EndpointConfig;
use crate::error::{with_timeout, Result, TunnelError};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// 连接参数
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub no_delay: bool,
    pub keep_alive: bool,
}

fn is_broadcast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_broadcast(),
        IpAddr::V6(_) => false,
    }
}

fn parse_ip(endpoint: &EndpointConfig) -> Result<SocketAddr> {
    let ip: IpAddr = endpoint.addr.trim().parse().map_err(|_| {
        TunnelError::config_error(format!("Invalid IP address: {}", endpoint.addr))
    })?;
    Ok(SocketAddr::new(ip, endpoint.port))
}

/// 解析端点，域名经 DNS 解析后取第一个地址
pub async fn resolve(endpoint: &EndpointConfig) -> Result<SocketAddr> {
    if !endpoint.domain {
        return parse_ip(endpoint);
    }

    let mut addrs = tokio::net::lookup_host((endpoint.addr.trim(), endpoint.port))
        .await
        .map_err(|e| TunnelError::connection_failed(endpoint.to_string(), e))?;
    addrs
        .next()
        .ok_or_else(|| TunnelError::config_error(format!("No address found for {}", endpoint)))
}

/// 监听地址校验：拒绝广播与组播地址
pub fn validate_listen_addr(addr: &SocketAddr) -> Result<()> {
    let ip = addr.ip();
    if is_broadcast(&ip) || ip.is_multicast() {
        return Err(TunnelError::config_error(format!(
            "Cannot listen on broadcast/multicast address {}",
            addr
        )));
    }
    Ok(())
}

/// 拨号地址校验：拒绝任意地址、广播、组播与 0 端口
pub fn validate_peer_addr(addr: &SocketAddr) -> Result<()> {
    let ip = addr.ip();
    if ip.is_unspecified() || is_broadcast(&ip) || ip.is_multicast() || addr.port() == 0 {
        return Err(TunnelError::config_error(format!(
            "Invalid peer address {}",
            addr
        )));
    }
    Ok(())
}

/// 启动时检查拨号端点
///
/// IP 端点必须能通过 `validate_peer_addr`；域名端点在拨号时才解析，这里不检查
pub fn check_peer_endpoint(endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.domain {
        return Ok(());
    }
    validate_peer_addr(&parse_ip(endpoint)?)
}

/// 创建监听器（SO_REUSEADDR + 指定 backlog）
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    validate_listen_addr(&addr)?;

    let bind = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;
        TcpListener::from_std(socket.into())
    };

    bind().map_err(|e| TunnelError::connection_failed(format!("listen {}", addr), e))
}

/// 为已建立的连接设置套接字选项，失败只记录告警
pub fn apply_options(stream: &TcpStream, options: SocketOptions) {
    if options.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    if options.keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
    }
}

/// 带超时拨号
pub async fn connect(
    addr: SocketAddr,
    timeout: Duration,
    options: SocketOptions,
) -> Result<TcpStream> {
    validate_peer_addr(&addr)?;

    let stream = with_timeout(timeout, async {
        TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::connection_failed(addr.to_string(), e))
    })
    .await?;

    apply_options(&stream, options);
    Ok(stream)
}
