use anyhow::{bail, Context, Result};

const CLIENT_TEMPLATE: &str = include_str!("../../templates/client.toml");
const SERVER_TEMPLATE: &str = include_str!("../../templates/server.toml");

/// 取得指定类型的配置模板
pub fn template_content(template_type: &str) -> Result<&'static str> {
    match template_type {
        "client" => Ok(CLIENT_TEMPLATE),
        "server" => Ok(SERVER_TEMPLATE),
        other => bail!("Unknown template type: {}", other),
    }
}

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = template_content(template_type)?;

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
