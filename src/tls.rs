use anyhow::{bail, Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

use crate::config::TlsConfig;

/// 默认 TLS 1.3 套件顺序（32 位 ARM 上优先 ChaCha20）
#[cfg(target_arch = "arm")]
pub const DEFAULT_CIPHERSUITES: &str =
    "TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384";

/// 默认 TLS 1.3 套件顺序
#[cfg(not(target_arch = "arm"))]
pub const DEFAULT_CIPHERSUITES: &str =
    "TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_GCM_SHA256";

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// 统一套件名：TLS13_AES_256_GCM_SHA384 与 TLS_AES_256_GCM_SHA384 视为相同
fn normalize_suite_name(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase().replace('-', "_");
    match upper.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => upper,
    }
}

/// 按 OpenSSL 风格的冒号分隔列表构造加密套件提供者，保持列表顺序
pub fn crypto_provider(ciphersuites: Option<&str>) -> Result<Arc<CryptoProvider>> {
    let list = ciphersuites
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_CIPHERSUITES);

    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    let available = provider.cipher_suites.clone();

    let mut selected = Vec::new();
    for name in list.split(':').map(normalize_suite_name) {
        if name.is_empty() {
            continue;
        }
        match available
            .iter()
            .find(|suite| normalize_suite_name(&format!("{:?}", suite.suite())) == name)
        {
            Some(suite) if !selected.contains(suite) => selected.push(*suite),
            Some(_) => {}
            None => tracing::warn!("Ignoring unknown TLS ciphersuite: {}", name),
        }
    }

    if selected.is_empty() {
        bail!("No usable TLS ciphersuite in '{}'", list);
    }
    provider.cipher_suites = selected;
    Ok(Arc::new(provider))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;
    Ok(certs)
}

/// 加载私钥，设置口令时按加密 PEM 解析
fn load_private_key(path: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    let pem =
        std::fs::read(path).with_context(|| format!("Failed to open key file: {:?}", path))?;

    if let Some(password) = password.filter(|p| !p.is_empty()) {
        let pkey = openssl::pkey::PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())
            .with_context(|| format!("Failed to decrypt private key: {:?}", path))?;
        let der = pkey
            .private_key_to_pkcs8()
            .context("Failed to convert private key to PKCS#8")?;
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)));
    }

    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .context("Failed to parse private key")?
        .context("No private key found")?;
    Ok(key)
}

/// 加载服务器 TLS 配置
pub fn load_server_config(
    tls: &TlsConfig,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>> {
    // 证书 + 可选的附加证书链
    let mut certs = load_certs(cert_path)?;
    if let Some(chain_path) = &tls.chain_path {
        certs.extend(load_certs(chain_path)?);
    }
    if certs.is_empty() {
        bail!("No certificate found in {:?}", cert_path);
    }

    let key = load_private_key(key_path, tls.key_password.as_deref())?;

    let config = rustls::ServerConfig::builder_with_provider(crypto_provider(
        tls.ciphersuites.as_deref(),
    )?)
    .with_protocol_versions(TLS13_ONLY)
    .context("Failed to select TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Failed to create server config")?;

    Ok(Arc::new(config))
}

/// 加载客户端 TLS 配置
pub fn load_client_config(tls: &TlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = &tls.ca_cert_path {
        // 加载自定义 CA 证书
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate")?;
        }
    } else if tls.verify_peer {
        // 使用系统 CA 证书
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }
    }

    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider(
        tls.ciphersuites.as_deref(),
    )?)
    .with_protocol_versions(TLS13_ONLY)
    .context("Failed to select TLS protocol versions")?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    if !tls.verify_peer {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(Arc::new(config))
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}

/// 不验证证书的验证器（verify_peer = false）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
