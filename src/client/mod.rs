// 客户端：双腿拨号器
//
// 每个本地连接依次拨两条隧道腿：第一条读取服务端分配的通道号，
// 第二条把通道号写回服务端，然后按反转位把本地连接桥接到两条腿上。

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

/// 一条隧道腿的拨号参数
#[derive(Clone)]
struct Leg {
    endpoint: EndpointConfig,
    factory: TransmissionFactory,
}

impl Leg {
    fn new(config: &AppConfig, endpoint: &EndpointConfig) -> anyhow::Result<Self> {
        let factory = TransmissionFactory::new(config, Some(endpoint))
            .with_context(|| format!("Failed to create transport for {}", endpoint))?;
        Ok(Self {
            endpoint: endpoint.clone(),
            factory,
        })
    }

    async fn dial(&self) -> Result<Transmission> {
        let addr = net::resolve(&self.endpoint).await?;
        self.factory.connect(addr).await
    }
}

struct RouterState {
    inbound: Leg,
    outbound: Leg,
    connections: ConnectionTable,
    stats: TrafficStats,
    options: SocketOptions,
    connect_timeout: Duration,
}

/// 客户端拨号器
pub struct Router {
    listener: TcpListener,
    state: Arc<RouterState>,
}

impl Router {
    /// 绑定本地监听地址
    pub async fn listen(config: AppConfig) -> anyhow::Result<Self> {
        let local = config
            .local
            .as_ref()
            .context("Client mode requires a local endpoint")?;

        for (name, endpoint) in [("inbound", &config.inbound), ("outbound", &config.outbound)] {
            net::check_peer_endpoint(endpoint)
                .with_context(|| format!("Invalid {} endpoint {}", name, endpoint))?;
        }

        let inbound = Leg::new(&config, &config.inbound)?;
        let outbound = Leg::new(&config, &config.outbound)?;

        let local_addr = net::resolve(local).await?;
        let listener = net::bind_listener(local_addr, config.backlog)
            .with_context(|| format!("Failed to listen on {}", local))?;

        info!(
            "Router listening on {} (inbound {}, outbound {}, transport: {})",
            listener.local_addr()?,
            config.inbound,
            config.outbound,
            inbound.factory.transport_type()
        );

        Ok(Self {
            listener,
            state: Arc::new(RouterState {
                inbound,
                outbound,
                connections: ConnectionTable::new(),
                stats: TrafficStats::new(),
                options: SocketOptions {
                    no_delay: config.no_delay,
                    keep_alive: config.keep_alive,
                },
                connect_timeout: config.connect_timeout(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 活动连接表
    pub fn connections(&self) -> ConnectionTable {
        self.state.connections.clone()
    }

    pub fn stats(&self) -> TrafficStats {
        self.state.stats.clone()
    }

    /// 接受本地连接，直到任务被取消
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("Accepted local connection from {}", peer);
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        // 整条链路受连接超时约束，超时即丢弃本地连接
                        let routed =
                            with_timeout(state.connect_timeout, route(socket, &state)).await;
                        if let Err(e) = routed {
                            debug!("Local connection from {} dropped: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept local connection: {}", e),
            }
        }
    }
}

/// 为一个本地连接建立两条腿并启动转发
async fn route(local: TcpStream, state: &RouterState) -> Result<()> {
    net::apply_options(&local, state.options);

    let mut first = state.inbound.dial().await?;
    let id = match with_timeout(state.connect_timeout, read_channel_id(&mut first)).await {
        Ok(id) => id,
        Err(e) => {
            first.close().await;
            return Err(e);
        }
    };
    debug!("Channel {} learned from {}", id, state.inbound.endpoint);

    let mut second = match state.outbound.dial().await {
        Ok(second) => second,
        Err(e) => {
            first.close().await;
            return Err(e);
        }
    };
    let sent = match second.writer() {
        Ok(writer) => with_timeout(state.connect_timeout, write_channel_id(&writer, id)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        first.close().await;
        second.close().await;
        return Err(e);
    }

    let connection = Connection::new(id, Endpoint::raw(local), orient(id, first, second)?)
        .with_stats(state.stats.clone());
    if !state.connections.start(connection) {
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

/// 按反转位选择腿的方向
///
/// 未反转：本地 → 第一条腿，第二条腿 → 本地；反转时相反。
fn orient(id: ChannelId, first: Transmission, second: Transmission) -> Result<Endpoint> {
    if id.is_inverted() {
        Endpoint::split(first, second)
    } else {
        Endpoint::split(second, first)
    }
}

/// 运行客户端直到 Ctrl+C，退出前关闭所有活动连接
pub async fn run_client(router: Router) -> anyhow::Result<()> {
    let connections = router.connections();
    info!("Waiting for local connections... (Press Ctrl+C to stop)");

    let result = tokio::select! {
        result = router.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping client...");
            Ok(())
        }
    };

    info!("Closing {} active connection(s)", connections.len());
    connections.close_all();
    result
}
