use anyhow::{bail, Result};
use tracing::warn;

use super::{AppConfig, EndpointConfig, Mode, MAX_ALIGNMENT, MIN_ALIGNMENT};
use crate::transport::{Encryptor, TransportType};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证端点
    pub fn validate_endpoint(endpoint: &EndpointConfig, context: &str) -> Result<()> {
        Self::validate_address(&endpoint.addr, context)?;
        Self::validate_port(endpoint.port, context)?;
        if !endpoint.domain && endpoint.addr.parse::<std::net::IpAddr>().is_err() {
            bail!(
                "{}: '{}' is not an IP address (set domain = true for host names)",
                context,
                endpoint.addr
            );
        }
        Ok(())
    }

    /// 验证拨号端点：IP 地址不能是任意地址、广播或组播
    pub fn validate_peer_endpoint(endpoint: &EndpointConfig, context: &str) -> Result<()> {
        Self::validate_endpoint(endpoint, context)?;
        crate::net::check_peer_endpoint(endpoint)
            .map_err(|e| anyhow::anyhow!("{}: {}", context, e))
    }

    /// 验证完整配置
    pub fn validate(config: &AppConfig) -> Result<()> {
        Self::validate_endpoint(&config.inbound, "inbound")?;
        Self::validate_endpoint(&config.outbound, "outbound")?;
        if config.inbound == config.outbound {
            bail!("inbound and outbound must be different endpoints");
        }

        match config.mode {
            Mode::Client => {
                Self::validate_peer_endpoint(&config.inbound, "inbound")?;
                Self::validate_peer_endpoint(&config.outbound, "outbound")?;
                match &config.local {
                    Some(local) => Self::validate_endpoint(local, "local")?,
                    None => bail!("client mode requires a [local] listen endpoint"),
                }
            }
            Mode::Server => {
                if let Some(target) = &config.local {
                    Self::validate_peer_endpoint(target, "local (forward target)")?;
                }
            }
        }

        if config.alignment < MIN_ALIGNMENT || config.alignment > MAX_ALIGNMENT {
            warn!(
                "alignment {} is outside [{}, {}], using {}",
                config.alignment,
                MIN_ALIGNMENT,
                MAX_ALIGNMENT,
                config.max_segment_size()
            );
        }

        if config.backlog == 0 {
            bail!("backlog must be greater than 0");
        }
        if config.timeout.connect == 0 {
            bail!("timeout.connect must be greater than 0");
        }
        if config.timeout.handshake == 0 {
            bail!("timeout.handshake must be greater than 0");
        }

        Self::validate_protocol(config)
    }

    /// 验证协议相关的子配置
    pub fn validate_protocol(config: &AppConfig) -> Result<()> {
        if config.protocol == TransportType::Encryptor {
            let Some(encryptor) = &config.encryptor else {
                bail!("protocol 'encryptor' requires an [encryptor] section");
            };
            if !Encryptor::is_supported(&encryptor.method) {
                bail!("Unsupported encryptor method: {}", encryptor.method);
            }
            if encryptor.password.is_empty() {
                bail!("encryptor.password cannot be empty");
            }
        }

        if config.protocol.is_websocket() {
            if config.websocket.host.trim().is_empty() {
                bail!("protocol '{}' requires websocket.host", config.protocol);
            }
            if !config.websocket.path.is_empty() && !config.websocket.path.starts_with('/') {
                bail!(
                    "websocket.path must start with '/' (got '{}')",
                    config.websocket.path
                );
            }
        }

        if config.protocol.is_tls() && config.mode == Mode::Server {
            match (&config.tls.cert_path, &config.tls.key_path) {
                (Some(_), Some(_)) | (None, None) => {}
                _ => bail!(
                    "tls.cert_path and tls.key_path must both be set, or both omitted to auto-generate"
                ),
            }
            if config.tls.chain_path.is_some() && config.tls.cert_path.is_none() {
                bail!("tls.chain_path requires tls.cert_path");
            }
        }

        Ok(())
    }
}
