use anyhow::Result;
use callwatch::config::{load_config, MonitorConfig};
use colored::Colorize;
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Prints the effective configuration (file, defaults and environment
/// overrides merged) as pretty JSON with the webhook URL masked
pub fn show(path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!(path = %path.display(), "Loading configuration for display");

    let cfg = load_config(path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();
    println!("{}", serde_json::to_string_pretty(&sanitized)?);

    Ok(())
}

/// Execute the config validate command
pub fn validate(path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());

    let cfg = match load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{} {}", "✗".red(), e.to_string().red());
            return Err(e.into());
        }
    };

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Storage: {}", cfg.storage_path.display());
    println!(
        "  Retention: {} days (entries), {} days (summaries)",
        cfg.log_retention_days, cfg.summary_retention_days
    );
    let rules = cfg.alert_rules();
    println!(
        "  Alert Rules: {} ({} enabled{})",
        rules.len(),
        rules.iter().filter(|r| r.enabled).count(),
        if cfg.alerts.is_none() { ", built-in" } else { "" }
    );
    println!(
        "  Webhook: {}",
        if cfg.webhook_url.is_some() { "configured" } else { "not configured" }
    );

    info!("Configuration validation successful");
    Ok(())
}

fn sanitize_secrets(cfg: &MonitorConfig) -> MonitorConfig {
    let mut sanitized = cfg.clone();
    sanitized.webhook_url = cfg.webhook_url.as_deref().map(mask_url);
    sanitized
}

/// Keep scheme and host, hide path and query (webhook URLs often embed tokens)
///
/// Example: "https://hooks.example.com/services/T000/B000/XXXX" -> "https://hooks.example.com/***"
fn mask_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "***".to_string();
    };
    let host = rest.split('/').next().unwrap_or_default();
    if rest.len() == host.len() {
        return url.to_string();
    }
    format!("{}://{}/***", scheme, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://hooks.example.com/services/T000/B000/XXXX"),
            "https://hooks.example.com/***"
        );
        assert_eq!(mask_url("http://localhost:9000"), "http://localhost:9000");
        assert_eq!(mask_url("not a url"), "***");
    }

    #[test]
    fn test_sanitize_keeps_everything_else() {
        let cfg = MonitorConfig {
            webhook_url: Some("https://alerts.example.com/hook/secret".to_string()),
            ..Default::default()
        };
        let sanitized = sanitize_secrets(&cfg);
        assert_eq!(sanitized.webhook_url.as_deref(), Some("https://alerts.example.com/***"));
        assert_eq!(sanitized.alerts, cfg.alerts);
    }
}
