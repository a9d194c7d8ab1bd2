use crate::error::{Result, TunnelError};
use crate::transmission::Transmission;
use crate::tunnel::{ChannelId, INVERSION_FLAG, MAGNITUDE_MASK};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// 等待配对的入站腿
struct PendingChannel {
    leg: Transmission,
    /// 超时任务，配对成功时取消
    timer: AbortHandle,
}

struct RegistryInner {
    counter: u32,
    inversion: bool,
    pending: HashMap<ChannelId, PendingChannel>,
}

/// 分配下一个通道号
///
/// 计数器在 [1, 0x7FFFFFFF] 内递增回绕，跳过 0；
/// 序号的两种反转形式都未被占用时才分配。
pub(crate) fn allocate_id(
    counter: &mut u32,
    invert: bool,
    max_attempts: usize,
    taken: impl Fn(ChannelId) -> bool,
) -> Option<ChannelId> {
    for _ in 0..max_attempts {
        *counter = if *counter >= MAGNITUDE_MASK {
            1
        } else {
            *counter + 1
        };
        let magnitude = *counter;
        if taken(ChannelId::new(magnitude)) || taken(ChannelId::new(magnitude | INVERSION_FLAG)) {
            continue;
        }
        let raw = if invert {
            magnitude | INVERSION_FLAG
        } else {
            magnitude
        };
        return Some(ChannelId::new(raw));
    }
    None
}

/// 待配对通道表
///
/// 每个条目带一个超时任务。配对（`pop`）与超时谁先移除条目谁生效，
/// 入站腿只会被释放一次。
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    timeout: Duration,
}

impl ChannelRegistry {
    /// `inversion` 为真时随机设置反转位；`timeout` 为配对期限
    pub fn new(inversion: bool, timeout: Duration) -> Self {
        let counter = rand::rng().random_range(1..=MAGNITUDE_MASK);
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                counter,
                inversion,
                pending: HashMap::new(),
            })),
            timeout,
        }
    }

    /// 分配通道号并登记入站腿，同时启动超时任务
    pub fn register(&self, leg: Transmission) -> Result<ChannelId> {
        let mut inner = self.inner.lock();
        let invert = inner.inversion && rand::rng().random_bool(0.5);
        let attempts = inner.pending.len() + 1;

        let RegistryInner {
            counter, pending, ..
        } = &mut *inner;
        let id = allocate_id(counter, invert, attempts, |id| pending.contains_key(&id))
            .ok_or_else(|| TunnelError::protocol("no free channel id"))?;

        let registry = self.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // 超时路径不 abort 自身任务，关闭握手需要跑完
            if let Some(PendingChannel { mut leg, .. }) = registry.take(id) {
                debug!("Channel {} expired before rendezvous", id);
                leg.close().await;
            }
        })
        .abort_handle();

        pending.insert(id, PendingChannel { leg, timer });
        debug!("Channel {} pending ({} waiting)", id, pending.len());
        Ok(id)
    }

    /// 取出待配对的入站腿并取消其超时任务
    pub fn pop(&self, id: ChannelId) -> Result<Transmission> {
        self.remove(id).ok_or(TunnelError::ChannelNotFound(id.raw()))
    }

    /// 移除并关闭入站腿；条目不存在时什么也不做
    pub async fn close(&self, id: ChannelId) {
        if let Some(mut leg) = self.remove(id) {
            debug!("Channel {} dropped", id);
            leg.close().await;
        }
    }

    /// 移除条目并取消其超时任务
    fn remove(&self, id: ChannelId) -> Option<Transmission> {
        let entry = self.take(id)?;
        entry.timer.abort();
        Some(entry.leg)
    }

    fn take(&self, id: ChannelId) -> Option<PendingChannel> {
        self.inner.lock().pending.remove(&id)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.inner.lock().pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::tests::transmission_pair;
    use crate::transmission::TransmissionFactory;
    use crate::transport::{HandshakeRole, Handshaked, Handshaker, Transport, TransportType};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::TcpListener;

    /// 关闭时先挂起一次再完成，并记录关闭是否走完
    struct SlowShutdown {
        inner: Pin<Box<dyn Transport>>,
        yielded: bool,
        finished: Arc<AtomicBool>,
    }

    impl AsyncRead for SlowShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.inner.as_mut().poll_read(cx, buf)
        }
    }

    impl AsyncWrite for SlowShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.inner.as_mut().poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.inner.as_mut().poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if !self.yielded {
                self.yielded = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let result = std::task::ready!(self.inner.as_mut().poll_shutdown(cx));
            self.finished.store(true, Ordering::SeqCst);
            Poll::Ready(result)
        }
    }

    struct SlowShutdownHandshaker {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Handshaker for SlowShutdownHandshaker {
        async fn handshake(
            &self,
            stream: Pin<Box<dyn Transport>>,
            _role: HandshakeRole,
        ) -> Result<Handshaked> {
            Ok(Handshaked::new(Box::pin(SlowShutdown {
                inner: stream,
                yielded: false,
                finished: self.finished.clone(),
            })))
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Tcp
        }
    }

    #[test]
    fn test_allocate_skips_zero_and_wraps() {
        let mut counter = MAGNITUDE_MASK - 1;
        let id = allocate_id(&mut counter, false, 1, |_| false).unwrap();
        assert_eq!(id.raw(), MAGNITUDE_MASK);
        let id = allocate_id(&mut counter, false, 1, |_| false).unwrap();
        assert_eq!(id.raw(), 1);
    }

    #[test]
    fn test_allocate_skips_both_inversion_forms() {
        let taken: HashSet<ChannelId> = [ChannelId::new(2), ChannelId::new(3 | INVERSION_FLAG)]
            .into_iter()
            .collect();
        let mut counter = 1;
        let id = allocate_id(&mut counter, true, 3, |id| taken.contains(&id)).unwrap();
        assert_eq!(id, ChannelId::new(4 | INVERSION_FLAG));
        assert!(id.is_inverted());
    }

    #[test]
    fn test_allocate_gives_up_when_all_taken() {
        let mut counter = 10;
        assert!(allocate_id(&mut counter, false, 5, |_| true).is_none());
    }

    #[tokio::test]
    async fn test_register_and_pop() {
        let registry = ChannelRegistry::new(false, Duration::from_secs(10));
        let (_client, server) = transmission_pair(None, 512).await;

        let id = registry.register(server).unwrap();
        assert_ne!(id.magnitude(), 0);
        assert!(!id.is_inverted());
        assert_eq!(registry.len(), 1);

        registry.pop(id).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.pop(id),
            Err(TunnelError::ChannelNotFound(raw)) if raw == id.raw()
        ));
    }

    #[tokio::test]
    async fn test_ids_are_unique_while_pending() {
        let registry = ChannelRegistry::new(true, Duration::from_secs(10));
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for _ in 0..8 {
            let (client, server) = transmission_pair(None, 512).await;
            peers.push(client);
            let id = registry.register(server).unwrap();
            assert!(seen.insert(id.magnitude()));
        }
        assert_eq!(registry.len(), 8);
    }

    #[tokio::test]
    async fn test_pending_channel_expires() {
        let registry = ChannelRegistry::new(false, Duration::from_millis(100));
        let (mut client, server) = transmission_pair(None, 512).await;

        let id = registry.register(server).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!registry.contains(id));
        assert!(registry.pop(id).is_err());
        // 入站腿已被关闭
        let result = tokio::time::timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pop_cancels_expiry() {
        let registry = ChannelRegistry::new(false, Duration::from_millis(100));
        let (mut client, server) = transmission_pair(None, 512).await;

        let id = registry.register(server).unwrap();
        let mut leg = registry.pop(id).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // 超时任务已取消，腿仍可用
        leg.write_frame(b"alive").await.unwrap();
        let frame = client.read_frame().await.unwrap();
        assert_eq!(frame, b"alive");
    }

    #[tokio::test]
    async fn test_close_removes_entry() {
        let registry = ChannelRegistry::new(false, Duration::from_secs(10));
        let (_client, server) = transmission_pair(None, 512).await;
        let id = registry.register(server).unwrap();
        registry.close(id).await;
        registry.close(id).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_expired_leg_is_shut_down_gracefully() {
        let finished = Arc::new(AtomicBool::new(false));
        let factory = TransmissionFactory::from_parts(
            Arc::new(SlowShutdownHandshaker {
                finished: finished.clone(),
            }),
            None,
            512,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, server) = tokio::join!(factory.connect(addr), async {
            let (socket, _) = listener.accept().await.unwrap();
            factory.accept(socket).await
        });

        let registry = ChannelRegistry::new(false, Duration::from_millis(100));
        registry.register(server.unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(registry.is_empty());
        assert!(finished.load(Ordering::SeqCst));
    }
}
