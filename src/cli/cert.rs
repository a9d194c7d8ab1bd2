use anyhow::Result;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::config::AppConfig;
use crate::tls;

/// Generate self-signed TLS certificate
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let mut sans = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !sans.iter().any(|n| n == common_name) {
        sans.push(common_name.to_string());
    }

    tls::generate_self_signed_cert(common_name, &sans, Path::new(cert_out), Path::new(key_out))?;

    println!("Generated self-signed certificate: {}", cert_out);
    println!("Generated private key: {}", key_out);

    Ok(())
}

/// 服务端使用 TLS 但未配置证书时，运行时生成自签名证书并写回配置
pub fn ensure_server_certs(config: &mut AppConfig) -> Result<()> {
    if !config.protocol.is_tls() {
        return Ok(());
    }

    match (&config.tls.cert_path, &config.tls.key_path) {
        (Some(_), Some(_)) => Ok(()),
        (None, None) => {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let temp_dir = std::env::temp_dir();
            let cert_path = temp_dir.join(format!("uds-tunnel-cert-{}.pem", ts));
            let key_path = temp_dir.join(format!("uds-tunnel-key-{}.pem", ts));

            // 以入站监听地址为 CN/SAN（0.0.0.0 时退回 localhost）
            let cn = match config.inbound.addr.as_str() {
                "0.0.0.0" | "::" => "localhost",
                addr => addr,
            };
            let alt = vec![cn.to_string()];

            tls::generate_self_signed_cert(cn, &alt, &cert_path, &key_path)?;

            info!(
                "Generated self-signed server certificate at {:?} and key at {:?}",
                cert_path, key_path
            );

            config.tls.cert_path = Some(cert_path);
            config.tls.key_path = Some(key_path);
            Ok(())
        }
        _ => anyhow::bail!(
            "Both cert_path and key_path must be set, or leave both empty to auto-generate"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, Mode};
    use crate::transport::TransportType;

    #[test]
    fn test_ensure_server_certs_generates_pair() {
        let mut config = AppConfig::new(
            Mode::Server,
            EndpointConfig::new("127.0.0.1", 7000),
            EndpointConfig::new("127.0.0.1", 7001),
        );
        config.protocol = TransportType::Tls;

        ensure_server_certs(&mut config).unwrap();
        let cert = config.tls.cert_path.clone().unwrap();
        let key = config.tls.key_path.clone().unwrap();
        assert!(cert.exists());
        assert!(key.exists());

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[test]
    fn test_ensure_server_certs_skips_plain_transport() {
        let mut config = AppConfig::new(
            Mode::Server,
            EndpointConfig::new("127.0.0.1", 7000),
            EndpointConfig::new("127.0.0.1", 7001),
        );
        ensure_server_certs(&mut config).unwrap();
        assert!(config.tls.cert_path.is_none());
    }

    #[test]
    fn test_ensure_server_certs_rejects_half_config() {
        let mut config = AppConfig::new(
            Mode::Server,
            EndpointConfig::new("127.0.0.1", 7000),
            EndpointConfig::new("127.0.0.1", 7001),
        );
        config.protocol = TransportType::WebSocketTls;
        config.tls.cert_path = Some("cert.pem".into());
        assert!(ensure_server_certs(&mut config).is_err());
    }
}
