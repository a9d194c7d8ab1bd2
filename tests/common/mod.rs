//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;
use uds_tunnel::config::{AppConfig, EncryptorConfig, EndpointConfig, Mode};
use uds_tunnel::transmission::TransmissionFactory;
use uds_tunnel::transport::{PlainHandshaker, TransportType};
use uds_tunnel::{Router, Switches};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};
    use uds_tunnel::tls;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Send data through the tunnel and read back the same amount
pub async fn test_proxy_connection(
    proxy_port: u16,
    test_data: &[u8],
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(format!("127.0.0.1:{}", proxy_port))
            .await
            .map_err(|e| format!("Failed to connect to proxy: {}", e))?;

        stream
            .write_all(test_data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = Vec::new();
        let mut buf = vec![0u8; 8192];

        while response.len() < test_data.len() {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) => return Err(format!("Failed to read response: {}", e)),
            }
        }

        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

/// 本机端点
pub fn local(port: u16) -> EndpointConfig {
    EndpointConfig::new("127.0.0.1", port)
}

/// 一对客户端/服务端配置，共享协议参数
pub struct TunnelConfigs {
    pub client: AppConfig,
    pub server: AppConfig,
    pub local_port: u16,
    _cleanup: Option<TestCleanup>,
}

/// 按协议生成配置；`target` 为服务端转发目标端口
pub fn tunnel_configs(protocol: TransportType, target: Option<u16>) -> TunnelConfigs {
    let inbound = local(get_available_port());
    let outbound = local(get_available_port());
    let local_port = get_available_port();

    let mut server = AppConfig::new(Mode::Server, inbound.clone(), outbound.clone());
    let mut client = AppConfig::new(Mode::Client, inbound, outbound);
    client.local = Some(local(local_port));
    server.local = target.map(local);

    for config in [&mut server, &mut client] {
        config.protocol = protocol;
        config.alignment = 1024;
        config.timeout.connect = 5;
        config.timeout.handshake = 5;
        config.websocket.host = "localhost".to_string();
        config.websocket.path = "/tunnel".to_string();
        if protocol == TransportType::Encryptor {
            config.encryptor = Some(EncryptorConfig {
                method: "aes-256-cfb".to_string(),
                password: "uds-tunnel-test".to_string(),
            });
        }
    }

    let cleanup = if protocol.is_tls() {
        let (cert_path, key_path) = generate_test_certs();
        server.tls.cert_path = Some(cert_path.clone());
        server.tls.key_path = Some(key_path.clone());
        client.tls.verify_peer = false;
        Some(TestCleanup::new(cert_path, key_path))
    } else {
        None
    };

    TunnelConfigs {
        client,
        server,
        local_port,
        _cleanup: cleanup,
    }
}

/// 启动服务端与客户端，返回服务端（用于检查表状态）与本地端口
pub async fn start_tunnel(configs: &TunnelConfigs) -> (uds_tunnel::ChannelRegistry, u16) {
    let switches = Switches::listen(configs.server.clone())
        .await
        .expect("Failed to start switches");
    let registry = switches.registry();
    tokio::spawn(switches.run());

    let router = Router::listen(configs.client.clone())
        .await
        .expect("Failed to start router");
    let port = router.local_addr().unwrap().port();
    tokio::spawn(router.run());

    (registry, port)
}

/// 明文 TCP 分帧工厂，模拟对端
pub fn plain_factory(mss: usize) -> TransmissionFactory {
    TransmissionFactory::from_parts(
        Arc::new(PlainHandshaker::new(TransportType::Tcp)),
        None,
        mss,
    )
}
