use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, Mode};
use crate::transport::Encryptor;

/// 检查配置文件权限（仅Unix系统）
///
/// 配置中含有密码（加密器口令、私钥口令）时，组或其他用户可读会给出告警
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str, has_secrets: bool) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    if !has_secrets {
        return Ok(());
    }

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // o+r = 0o004
    if mode & 0o004 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: Config file '{}' is readable by others (permissions: {:o})\n\
             This file contains passwords.\n\
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    // g+r = 0o040
    if mode & 0o040 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: Config file '{}' is readable by group (permissions: {:o})\n\
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str, _has_secrets: bool) -> Result<()> {
    Ok(())
}

/// 配置中是否含有密码
pub fn has_secrets(config: &AppConfig) -> bool {
    config.encryptor.is_some() || config.tls.key_password.is_some()
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置中引用的文件不存在时给出告警
fn file_warnings(config: &AppConfig) -> Vec<String> {
    let tls = &config.tls;
    [
        ("CA certificate", &tls.ca_cert_path),
        ("Certificate", &tls.cert_path),
        ("Key", &tls.key_path),
        ("Certificate chain", &tls.chain_path),
    ]
    .into_iter()
    .filter_map(|(label, path)| {
        path.as_ref()
            .filter(|p| !p.exists())
            .map(|p| format!("{} file not found: {:?}", label, p))
    })
    .collect()
}

fn check_details(config: &AppConfig) -> serde_json::Value {
    let mut details = serde_json::json!({
        "mode": config.mode.to_string(),
        "protocol": config.protocol.as_str(),
        "inbound": config.inbound.to_string(),
        "outbound": config.outbound.to_string(),
        "alignment": config.max_segment_size(),
        "backlog": config.backlog,
        "inversion": config.inversion,
        "connect_timeout": config.timeout.connect,
        "handshake_timeout": config.timeout.handshake,
    });

    if let Some(local) = &config.local {
        details["local"] = serde_json::json!(local.to_string());
    }
    if let Some(encryptor) = &config.encryptor {
        details["encryptor_method"] = serde_json::json!(encryptor.method);
    }
    if config.protocol.is_websocket() {
        details["websocket_host"] = serde_json::json!(config.websocket.host);
        details["websocket_path"] = serde_json::json!(config.websocket.path);
    }
    if config.protocol.is_tls() && config.mode == Mode::Server {
        let mode = if config.tls.cert_path.is_some() {
            "file"
        } else {
            "auto-generate"
        };
        details["cert_mode"] = serde_json::json!(mode);
    }
    details
}

fn print_text_summary(config: &AppConfig, warnings: &[String]) {
    println!("✓ Mode: {}", config.mode);
    println!("✓ Protocol: {}", config.protocol);
    if let Some(local) = &config.local {
        let label = match config.mode {
            Mode::Client => "Local listen",
            Mode::Server => "Forward target",
        };
        println!("✓ {}: {}", label, local);
    }
    println!("✓ Inbound: {}", config.inbound);
    println!("✓ Outbound: {}", config.outbound);
    println!("✓ Alignment: {}", config.max_segment_size());
    println!("✓ Inversion: {}", config.inversion);
    println!(
        "✓ Timeouts: connect {}s, handshake {}s",
        config.timeout.connect, config.timeout.handshake
    );
    if let Some(encryptor) = &config.encryptor {
        println!("✓ Encryptor method: {}", encryptor.method);
    }
    if config.protocol.is_tls() && config.mode == Mode::Server && config.tls.cert_path.is_none()
    {
        println!("✓ Certificate/Key: will be auto-generated at runtime");
    }
    for warning in warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ {} configuration is valid!", config.mode);
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                config_type: "unknown".to_string(),
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match AppConfig::load(config_path) {
        Ok(config) => {
            let warnings = file_warnings(&config);
            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    config_type: config.mode.to_string(),
                    warnings,
                    error: None,
                    details: check_details(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_text_summary(&config, &warnings);
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    config_type: "unknown".to_string(),
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure [inbound] and [outbound] sections are present and differ");
                println!("  3. Client mode needs a [local] section");
                println!("  4. Ensure port numbers are valid (1-65535)");
                println!(
                    "  5. protocol = \"encryptor\" needs [encryptor] with one of: {}",
                    Encryptor::methods().join(", ")
                );
                println!("  6. WebSocket protocols need [websocket] host, path must start with '/'");
            }

            Err(e)
        }
    }
}
