// 服务端：双监听配对器
//
// 入站监听器为每条新腿分配通道号并写给客户端，出站监听器读取通道号、
// 取出对应的入站腿，再按反转位决定转发方向。

mod registry;

pub use registry::ChannelRegistry;

use crate::config::{AppConfig, EndpointConfig};
use crate::error::{with_timeout, Result, TunnelError};
use crate::net::{self, SocketOptions};
use crate::stats::TrafficStats;
use crate::transmission::{Transmission, TransmissionFactory};
use crate::tunnel::channel::{read_channel_id, write_channel_id};
use crate::tunnel::{ChannelId, Connection, ConnectionTable, Endpoint};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// 两个监听器共享的状态
#[derive(Clone)]
struct SwitchesState {
    factory: TransmissionFactory,
    registry: ChannelRegistry,
    connections: ConnectionTable,
    stats: TrafficStats,
    /// 转发目标，未配置时直接桥接两条腿
    target: Option<EndpointConfig>,
    options: SocketOptions,
    connect_timeout: Duration,
}

/// 服务端配对器
pub struct Switches {
    inbound: TcpListener,
    outbound: TcpListener,
    state: SwitchesState,
}

impl Switches {
    /// 绑定入站与出站监听器，任一失败即返回错误
    pub async fn listen(config: AppConfig) -> anyhow::Result<Self> {
        if let Some(target) = &config.local {
            net::check_peer_endpoint(target)
                .with_context(|| format!("Invalid forward target {}", target))?;
        }

        let factory =
            TransmissionFactory::new(&config, None).context("Failed to create transport")?;

        let inbound_addr = net::resolve(&config.inbound).await?;
        let outbound_addr = net::resolve(&config.outbound).await?;
        let inbound = net::bind_listener(inbound_addr, config.backlog)
            .with_context(|| format!("Failed to listen on inbound {}", config.inbound))?;
        let outbound = net::bind_listener(outbound_addr, config.backlog)
            .with_context(|| format!("Failed to listen on outbound {}", config.outbound))?;

        info!(
            "Switches listening on inbound {} and outbound {} (transport: {})",
            inbound.local_addr()?,
            outbound.local_addr()?,
            factory.transport_type()
        );

        Ok(Self {
            inbound,
            outbound,
            state: SwitchesState {
                registry: ChannelRegistry::new(config.inversion, config.connect_timeout()),
                connections: ConnectionTable::new(),
                stats: TrafficStats::new(),
                target: config.local.clone(),
                options: SocketOptions {
                    no_delay: config.no_delay,
                    keep_alive: config.keep_alive,
                },
                connect_timeout: config.connect_timeout(),
                factory,
            },
        })
    }

    pub fn inbound_addr(&self) -> Result<SocketAddr> {
        Ok(self.inbound.local_addr()?)
    }

    pub fn outbound_addr(&self) -> Result<SocketAddr> {
        Ok(self.outbound.local_addr()?)
    }

    /// 待配对通道表
    pub fn registry(&self) -> ChannelRegistry {
        self.state.registry.clone()
    }

    /// 活动连接表
    pub fn connections(&self) -> ConnectionTable {
        self.state.connections.clone()
    }

    pub fn stats(&self) -> TrafficStats {
        self.state.stats.clone()
    }

    /// 运行两个接受循环，直到任务被取消
    pub async fn run(self) -> anyhow::Result<()> {
        let Switches {
            inbound,
            outbound,
            state,
        } = self;
        let state = Arc::new(state);

        loop {
            tokio::select! {
                result = inbound.accept() => match result {
                    Ok((socket, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_inbound(socket, &state).await {
                                debug!("Inbound leg from {} dropped: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept inbound connection: {}", e),
                },
                result = outbound.accept() => match result {
                    Ok((socket, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_outbound(socket, &state).await {
                                debug!("Outbound leg from {} dropped: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept outbound connection: {}", e),
                },
            }
        }
    }
}

/// 入站腿：握手、分配通道号、登记、写出通道号
async fn handle_inbound(socket: TcpStream, state: &SwitchesState) -> Result<()> {
    let leg = state.factory.accept(socket).await?;
    debug!(
        "Inbound {} leg from {} established",
        leg.kind(),
        leg.remote_addr()
    );

    let writer = leg.writer()?;
    let id = state.registry.register(leg)?;

    let written = with_timeout(state.connect_timeout, write_channel_id(&writer, id)).await;
    if let Err(e) = written {
        state.registry.close(id).await;
        return Err(e);
    }
    Ok(())
}

/// 出站腿：握手、读取通道号、配对、启动转发
async fn handle_outbound(socket: TcpStream, state: &SwitchesState) -> Result<()> {
    let mut leg = state.factory.accept(socket).await?;
    debug!(
        "Outbound {} leg from {} established",
        leg.kind(),
        leg.remote_addr()
    );

    let id = match with_timeout(state.connect_timeout, read_channel_id(&mut leg)).await {
        Ok(id) => id,
        Err(e) => {
            leg.close().await;
            return Err(e);
        }
    };

    let inbound = match state.registry.pop(id) {
        Ok(inbound) => inbound,
        Err(e) => {
            leg.close().await;
            return Err(e);
        }
    };

    let connection = connect_channel(id, inbound, leg, state).await?;

    if !state.connections.start(connection.with_stats(state.stats.clone())) {
        warn!("Channel {} is already active, rejected", id);
        return Err(TunnelError::protocol(format!("duplicate channel {}", id)));
    }
    debug!(
        "Channel {} established ({} active)",
        id,
        state.connections.len()
    );
    Ok(())
}

/// 按反转位与转发目标组装连接
async fn connect_channel(
    id: ChannelId,
    inbound: Transmission,
    outbound: Transmission,
    state: &SwitchesState,
) -> Result<Connection> {
    let (mut rx, mut tx) = if id.is_inverted() {
        (outbound, inbound)
    } else {
        (inbound, outbound)
    };

    let Some(target) = &state.target else {
        return Ok(Connection::new(
            id,
            Endpoint::framed(rx)?,
            Endpoint::framed(tx)?,
        ));
    };

    let dialed = async {
        let addr = net::resolve(target).await?;
        net::connect(addr, state.connect_timeout, state.options).await
    };
    match with_timeout(state.connect_timeout, dialed).await {
        Ok(socket) => Ok(Connection::new(
            id,
            Endpoint::split(rx, tx)?,
            Endpoint::raw(socket),
        )),
        Err(e) => {
            // 目标不可达：两条腿一起关闭
            rx.close().await;
            tx.close().await;
            Err(e)
        }
    }
}

/// 运行服务端直到 Ctrl+C，退出前关闭所有活动连接
pub async fn run_server(switches: Switches) -> anyhow::Result<()> {
    let connections = switches.connections();
    info!("Waiting for connections... (Press Ctrl+C to stop)");

    let result = tokio::select! {
        result = switches.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            Ok(())
        }
    };

    info!("Closing {} active connection(s)", connections.len());
    connections.close_all();
    result
}
