// `tandem config`: show or change ~/.tandem/config.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use tandem_session::config::{global_config_path, TimingConfig};
use tandem_session::ClientConfig;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Save this signaling relay URL as the default
    #[arg(long)]
    set_signaling_url: Option<String>,
    /// Save this display name as the default
    #[arg(long)]
    set_name: Option<String>,
    /// Save this cursor color as the default
    #[arg(long)]
    set_color: Option<String>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

/// The configuration a `tandem join` would use right now.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig {
    pub path: Option<PathBuf>,
    pub signaling_url: String,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub timing: TimingConfig,
}

impl ResolvedConfig {
    fn new(path: Option<PathBuf>, config: &ClientConfig) -> Self {
        Self {
            path,
            signaling_url: config.resolved_signaling_url(),
            user_id: config.user_id.clone(),
            display_name: config.display_name.clone(),
            color: config.color.clone(),
            timing: config.timing.clone(),
        }
    }
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let path = global_config_path();

    let result = match &path {
        Some(path) if has_changes(&args) => apply_changes(path, &args),
        _ => Ok(ClientConfig::load()),
    };

    match result {
        Ok(config) => {
            output::print_output(format, &ResolvedConfig::new(path, &config), format_human)?;
            Ok(())
        }
        Err(e) => {
            output::print_anyhow_error(format, &e);
            Err(e)
        }
    }
}

fn has_changes(args: &ConfigArgs) -> bool {
    args.set_signaling_url.is_some() || args.set_name.is_some() || args.set_color.is_some()
}

fn apply_changes(path: &Path, args: &ConfigArgs) -> anyhow::Result<ClientConfig> {
    let mut config = if path.exists() {
        ClientConfig::load_from(path)
            .with_context(|| format!("failed to read config {}", path.display()))?
    } else {
        ClientConfig::default()
    };
    if let Some(url) = &args.set_signaling_url {
        config.signaling_url = Some(url.clone());
    }
    if let Some(name) = &args.set_name {
        config.display_name = Some(name.clone());
    }
    if let Some(color) = &args.set_color {
        config.color = Some(color.clone());
    }
    config
        .save_to(path)
        .with_context(|| format!("failed to write config {}", path.display()))?;
    Ok(config)
}

fn format_human(config: &ResolvedConfig) -> String {
    let unset = || "(unset)".to_string();
    let mut lines = Vec::new();
    if let Some(path) = &config.path {
        lines.push(format!("config file:    {}", path.display()));
    }
    lines.push(format!("signaling url:  {}", config.signaling_url));
    lines.push(format!("user id:        {}", config.user_id.clone().unwrap_or_else(unset)));
    lines.push(format!("display name:   {}", config.display_name.clone().unwrap_or_else(unset)));
    lines.push(format!("color:          {}", config.color.clone().unwrap_or_else(unset)));
    let timing = &config.timing;
    lines.push(format!(
        "timing:         heartbeat {}ms, cursor debounce {}ms, stale after {}ms",
        timing.heartbeat_interval_ms, timing.cursor_debounce_ms, timing.stale_after_ms
    ));
    lines.push(format!(
        "reconnect:      base {}ms, max {}ms, {} attempts",
        timing.reconnect_base_delay_ms, timing.reconnect_max_delay_ms, timing.reconnect_max_attempts
    ));
    lines.push(format!("undo depth:     {}", timing.undo_depth));
    lines.join("\n")
}
