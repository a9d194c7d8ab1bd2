use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "uds-tunnel")]
#[command(author, version, about = "Traffic-splitting tunnel over two independent legs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 按配置运行客户端或服务端
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 模板类型
        #[arg(value_parser = ["client", "server"])]
        template_type: String,

        /// 输出文件路径，未指定时打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem", value_name = "PATH")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem", value_name = "PATH")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
