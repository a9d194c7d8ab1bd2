use anyhow::Result;
use tracing::info;

use crate::config::{AppConfig, Mode};
use crate::{client, server, Router, Switches};

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path, has_secrets};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// 按配置中的模式运行客户端或服务端
async fn run(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    info!("Loading configuration from: {}", config_path);
    let mut app_config = AppConfig::load(&config_path)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path, has_secrets(&app_config))?;

    // 监听成功后才打印启动信息，端点取实际绑定的地址
    match app_config.mode {
        Mode::Client => {
            let router = Router::listen(app_config.clone()).await?;
            print_banner(&client_banner(&app_config, &router)?);
            client::run_client(router).await
        }
        Mode::Server => {
            cert::ensure_server_certs(&mut app_config)?;
            let switches = Switches::listen(app_config.clone()).await?;
            print_banner(&server_banner(&app_config, &switches)?);
            server::run_server(switches).await
        }
    }
}

fn banner_header(config: &AppConfig) -> Vec<String> {
    let mut lines = vec![
        format!("Application       : uds-tunnel v{}", env!("CARGO_PKG_VERSION")),
        format!("Mode              : {}", config.mode),
        format!("Protocol          : {}", config.protocol),
        format!("Process           : {}", std::process::id()),
    ];
    if let Ok(cwd) = std::env::current_dir() {
        lines.push(format!("Working directory : {}", cwd.display()));
    }
    lines
}

fn client_banner(config: &AppConfig, router: &Router) -> Result<Vec<String>> {
    let mut lines = banner_header(config);
    lines.push(format!("Local             : {}", router.local_addr()?));
    lines.push(format!("Inbound           : {}", config.inbound));
    lines.push(format!("Outbound          : {}", config.outbound));
    Ok(lines)
}

fn server_banner(config: &AppConfig, switches: &Switches) -> Result<Vec<String>> {
    let mut lines = banner_header(config);
    lines.push(format!("Inbound           : {}", switches.inbound_addr()?));
    lines.push(format!("Outbound          : {}", switches.outbound_addr()?));
    match &config.local {
        Some(target) => lines.push(format!("Target            : {}", target)),
        None => lines.push("Target            : (bridge)".to_string()),
    }
    Ok(lines)
}

fn print_banner(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}
