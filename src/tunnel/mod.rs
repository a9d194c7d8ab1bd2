// 隧道核心：通道握手编解码与连接转发

pub mod channel;
pub mod connection;

pub use channel::{ChannelId, INVERSION_FLAG, MAGNITUDE_MASK};
pub use connection::{Connection, ConnectionHandle, Endpoint};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 活动连接表，键为通道号
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<Mutex<HashMap<ChannelId, ConnectionHandle>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接并启动转发
    ///
    /// 通道号已存在时丢弃新连接（两侧随之关闭）并返回 false。
    /// 销毁回调会把连接从表中移除。
    pub fn start(&self, connection: Connection) -> bool {
        let id = connection.id();
        let mut inner = self.inner.lock();
        if inner.contains_key(&id) {
            return false;
        }

        let table = self.clone();
        let connection = connection.on_disposed(move |id| {
            let remaining = {
                let mut inner = table.inner.lock();
                inner.remove(&id);
                inner.len()
            };
            debug!("Channel {} disposed ({} active)", id, remaining);
        });
        inner.insert(id, connection.handle());
        drop(inner);
        connection.listen();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// 关闭所有连接
    pub fn close_all(&self) {
        let handles: Vec<ConnectionHandle> = self.inner.lock().values().cloned().collect();
        for handle in handles {
            handle.close();
        }
    }
}
