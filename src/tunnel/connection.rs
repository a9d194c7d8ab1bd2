// 连接转发
//
// 两个已握手的端点之间双向搬运数据。任一方向读写失败即关闭整个连接，
// 关闭只发生一次，并触发一次销毁回调。

use super::channel::ChannelId;
use crate::error::{Result, TunnelError};
use crate::stats::{ConnectionGuard, TrafficStats};
use crate::transmission::{FrameReader, FrameWriter, Transmission};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 原始 socket 每次读取的上限（对端为原始 socket 时）
const RAW_BUFFER_SIZE: usize = 16 * 1024;

enum Source {
    Framed(FrameReader),
    Raw(OwnedReadHalf),
}

enum Sink {
    Framed(FrameWriter),
    Raw(OwnedWriteHalf),
}

impl Sink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Framed(writer) => writer.write_frame(data).await,
            Sink::Raw(writer) => {
                writer.write_all(data).await?;
                Ok(())
            }
        }
    }

    /// 原始数据分帧时单帧的上限
    fn chunk_size(&self) -> usize {
        match self {
            Sink::Framed(writer) => writer.max_segment_size(),
            Sink::Raw(_) => RAW_BUFFER_SIZE,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Sink::Framed(writer) => writer.shutdown().await,
            Sink::Raw(writer) => {
                let _ = writer.shutdown().await;
            }
        }
    }
}

/// 连接的一侧：一个读来源与一个写目标
pub struct Endpoint {
    source: Source,
    sink: Sink,
    /// 拆分端点中不参与转发的半部，随连接一起关闭
    idle_writers: Vec<FrameWriter>,
    idle_readers: Vec<FrameReader>,
}

impl Endpoint {
    /// 单条分帧传输，读写都在同一条腿上
    pub fn framed(transmission: Transmission) -> Result<Self> {
        let (reader, writer) = transmission.into_split()?;
        Ok(Self {
            source: Source::Framed(reader),
            sink: Sink::Framed(writer),
            idle_writers: Vec::new(),
            idle_readers: Vec::new(),
        })
    }

    /// 原始 TCP socket
    pub fn raw(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            source: Source::Raw(reader),
            sink: Sink::Raw(writer),
            idle_writers: Vec::new(),
            idle_readers: Vec::new(),
        }
    }

    /// 两条腿：从 `rx` 读取，向 `tx` 写入
    pub fn split(rx: Transmission, tx: Transmission) -> Result<Self> {
        let (rx_reader, rx_writer) = rx.into_split()?;
        let (tx_reader, tx_writer) = tx.into_split()?;
        Ok(Self {
            source: Source::Framed(rx_reader),
            sink: Sink::Framed(tx_writer),
            idle_writers: vec![rx_writer],
            idle_readers: vec![tx_reader],
        })
    }
}

/// 转发方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// A → B
    Up,
    /// B → A
    Down,
}

async fn pump(
    source: &mut Source,
    sink: &mut Sink,
    direction: Direction,
    stats: Option<&TrafficStats>,
) -> Result<()> {
    let count = |n: usize| {
        if let Some(stats) = stats {
            match direction {
                Direction::Up => stats.add_bytes_up(n as u64),
                Direction::Down => stats.add_bytes_down(n as u64),
            }
        }
    };

    match source {
        Source::Framed(reader) => loop {
            let payload = reader.read_frame().await?;
            sink.write(payload).await?;
            count(payload.len());
        },
        Source::Raw(reader) => {
            let mut buf = vec![0u8; sink.chunk_size()];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Err(TunnelError::Closed);
                }
                sink.write(&buf[..n]).await?;
                count(n);
            }
        }
    }
}

/// 销毁回调，参数为通道号
pub type DisposedCallback = Box<dyn FnOnce(ChannelId) + Send + 'static>;

struct Shared {
    id: ChannelId,
    disposed: AtomicBool,
    /// 请求停止转发
    stop: CancellationToken,
    /// 两侧均已关闭
    finished: CancellationToken,
    on_disposed: Mutex<Option<DisposedCallback>>,
}

impl Shared {
    /// 第一次调用返回 true 并触发回调
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.cancel();
        let callback = self.on_disposed.lock().take();
        if let Some(callback) = callback {
            callback(self.id);
        }
        self.finished.cancel();
        true
    }
}

/// 连接句柄，可克隆，用于从外部关闭连接
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// 关闭连接，可重复调用
    pub fn close(&self) {
        self.shared.stop.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// 等待连接两侧关闭且回调已执行
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }
}

/// 活动连接
pub struct Connection {
    side_a: Endpoint,
    side_b: Endpoint,
    stats: Option<TrafficStats>,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(id: ChannelId, side_a: Endpoint, side_b: Endpoint) -> Self {
        Self {
            side_a,
            side_b,
            stats: None,
            shared: Arc::new(Shared {
                id,
                disposed: AtomicBool::new(false),
                stop: CancellationToken::new(),
                finished: CancellationToken::new(),
                on_disposed: Mutex::new(None),
            }),
        }
    }

    /// 统计流量与连接数
    pub fn with_stats(mut self, stats: TrafficStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// 设置销毁回调
    pub fn on_disposed<F>(self, callback: F) -> Self
    where
        F: FnOnce(ChannelId) + Send + 'static,
    {
        *self.shared.on_disposed.lock() = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// 启动转发任务
    pub fn listen(self) -> ConnectionHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    async fn run(self) {
        let Connection {
            side_a,
            side_b,
            stats,
            shared,
        } = self;
        let id = shared.id;
        let _guard = stats.clone().map(ConnectionGuard::new);

        let Endpoint {
            source: mut a_source,
            sink: mut a_sink,
            idle_writers: a_idle_writers,
            idle_readers: a_idle_readers,
        } = side_a;
        let Endpoint {
            source: mut b_source,
            sink: mut b_sink,
            idle_writers: b_idle_writers,
            idle_readers: b_idle_readers,
        } = side_b;

        debug!("Channel {} relay started", id);

        let reason = tokio::select! {
            result = pump(&mut a_source, &mut b_sink, Direction::Up, stats.as_ref()) => result,
            result = pump(&mut b_source, &mut a_sink, Direction::Down, stats.as_ref()) => result,
            _ = shared.stop.cancelled() => Ok(()),
        };

        match reason {
            Err(TunnelError::Closed) | Ok(()) => debug!("Channel {} closed", id),
            Err(e) => debug!("Channel {} closed: {}", id, e),
        }

        a_sink.shutdown().await;
        b_sink.shutdown().await;
        for writer in a_idle_writers.iter().chain(b_idle_writers.iter()) {
            writer.shutdown().await;
        }
        drop((a_source, b_source, a_idle_readers, b_idle_readers));
        drop((a_sink, b_sink, a_idle_writers, b_idle_writers));

        shared.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::tests::transmission_pair;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_raw_to_framed_relay() {
        let (mut app, local) = tcp_pair().await;
        let (tunnel_near, mut tunnel_far) = transmission_pair(None, 512).await;

        let stats = TrafficStats::new();
        let handle = Connection::new(
            ChannelId::new(1),
            Endpoint::raw(local),
            Endpoint::framed(tunnel_near).unwrap(),
        )
        .with_stats(stats.clone())
        .listen();

        app.write_all(b"ping").await.unwrap();
        let frame = timeout(Duration::from_secs(2), tunnel_far.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"ping");

        tunnel_far.write_frame(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(2), app.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"pong");

        handle.close();
        timeout(Duration::from_secs(2), handle.closed()).await.unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_up, 4);
        assert_eq!(snapshot.bytes_down, 4);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_large_raw_write_is_split_into_frames() {
        let (mut app, local) = tcp_pair().await;
        let (tunnel_near, mut tunnel_far) = transmission_pair(None, 512).await;
        let _handle = Connection::new(
            ChannelId::new(2),
            Endpoint::raw(local),
            Endpoint::framed(tunnel_near).unwrap(),
        )
        .listen();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        app.write_all(&data).await.unwrap();

        let mut received = Vec::new();
        while received.len() < data.len() {
            let frame = timeout(Duration::from_secs(2), tunnel_far.read_frame())
                .await
                .unwrap()
                .unwrap();
            assert!(frame.len() <= 512);
            received.extend_from_slice(frame);
        }
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_split_endpoint_orientation() {
        let (mut app, local) = tcp_pair().await;
        let (rx_near, mut rx_far) = transmission_pair(None, 512).await;
        let (tx_near, mut tx_far) = transmission_pair(None, 512).await;

        let _handle = Connection::new(
            ChannelId::new(3),
            Endpoint::raw(local),
            Endpoint::split(rx_near, tx_near).unwrap(),
        )
        .listen();

        app.write_all(b"up").await.unwrap();
        let frame = timeout(Duration::from_secs(2), tx_far.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"up");

        rx_far.write_frame(b"down").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(2), app.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"down");
    }

    #[tokio::test]
    async fn test_peer_close_closes_both_sides() {
        let (mut app, local) = tcp_pair().await;
        let (tunnel_near, tunnel_far) = transmission_pair(None, 512).await;

        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();
        let handle = Connection::new(
            ChannelId::new(4),
            Endpoint::raw(local),
            Endpoint::framed(tunnel_near).unwrap(),
        )
        .on_disposed(move |id| {
            assert_eq!(id, ChannelId::new(4));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .listen();

        drop(tunnel_far);
        timeout(Duration::from_secs(2), handle.closed()).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), app.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(handle.is_disposed());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_disposes_once() {
        for _ in 0..20 {
            let (a_near, mut a_far) = transmission_pair(None, 512).await;
            let (b_near, mut b_far) = transmission_pair(None, 512).await;

            let disposed = Arc::new(AtomicUsize::new(0));
            let counter = disposed.clone();
            let handle = Connection::new(
                ChannelId::new(5),
                Endpoint::framed(a_near).unwrap(),
                Endpoint::framed(b_near).unwrap(),
            )
            .on_disposed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .listen();

            let h1 = handle.clone();
            let h2 = handle.clone();
            tokio::join!(
                async move { h1.close() },
                async move { h2.close() },
                a_far.close(),
                b_far.close(),
            );

            timeout(Duration::from_secs(2), handle.closed()).await.unwrap();
            handle.close();
            assert_eq!(disposed.load(Ordering::SeqCst), 1);
        }
    }
}
