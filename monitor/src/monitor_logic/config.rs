use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use lib_eddn::{ClientOptions, RenderQueueOptions};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "EDDN live telemetry terminal dashboard", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "EDDN_GATEWAY_URL", help = "WebSocket URL of the EDDN gateway.")]
    pub gateway_url: Option<String>,

    #[clap(long, env = "EDDN_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "EDDN_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "EDDN_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "EDDN_REGION_MAP_PATH", help = "Path to the packed region map resource.")]
    pub region_map_path: Option<PathBuf>,

    #[clap(long, env = "EDDN_RESET_TIMEOUT_SECONDS", help = "Seconds of gateway silence before the watchdog forces a reconnect (0 disables).")]
    pub reset_timeout_seconds: Option<u64>,

    #[clap(long, env = "EDDN_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for gateway reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "EDDN_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for gateway reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "EDDN_LIST_LENGTH", help = "Rows each display module keeps on screen.")]
    pub list_length: Option<usize>,

    #[clap(long, env = "EDDN_CULL_FACTOR", help = "Render queue capacity as a multiple of the list length.")]
    pub cull_factor: Option<usize>,

    #[clap(long, env = "EDDN_OLD_THRESHOLD_MS", help = "Events older than this many milliseconds are tagged old.")]
    pub old_threshold_ms: Option<i64>,

    #[clap(long, env = "EDDN_NEW_THRESHOLD_MS", help = "Events timestamped further in the future than this (negative ms) are tagged new.")]
    pub new_threshold_ms: Option<i64>,

    #[clap(long, env = "EDDN_JOURNAL_TOPICS", value_delimiter = ',', help = "Comma-separated journal topics for the journal panel.")]
    pub journal_topics: Option<Vec<String>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            gateway_url: other.gateway_url.or(self.gateway_url),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            region_map_path: other.region_map_path.or(self.region_map_path),
            reset_timeout_seconds: other.reset_timeout_seconds.or(self.reset_timeout_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            list_length: other.list_length.or(self.list_length),
            cull_factor: other.cull_factor.or(self.cull_factor),
            old_threshold_ms: other.old_threshold_ms.or(self.old_threshold_ms),
            new_threshold_ms: other.new_threshold_ms.or(self.new_threshold_ms),
            journal_topics: other.journal_topics.or(self.journal_topics),
        }
    }

    /// Client options assembled from the merged configuration.
    pub fn client_options(&self) -> ClientOptions {
        let mut opts = ClientOptions::for_url(
            self.gateway_url
                .clone()
                .unwrap_or_else(|| "wss://eddn.edcd.io/ws".to_string()),
        );
        if let Some(secs) = self.reset_timeout_seconds {
            opts.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.reconnect_base_delay_ms {
            opts.transport.base_reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_max_delay_ms {
            opts.transport.max_reconnect_interval = Duration::from_millis(ms);
        }
        opts
    }

    /// Render queue options shared by the display modules.
    pub fn render_options(&self) -> RenderQueueOptions {
        let mut opts = RenderQueueOptions::default();
        if let Some(n) = self.list_length {
            opts.list_length = n.max(1);
        }
        if let Some(n) = self.cull_factor {
            opts.cull_factor = n.max(1);
        }
        if let Some(ms) = self.old_threshold_ms {
            opts.old_threshold_ms = ms;
        }
        if let Some(ms) = self.new_threshold_ms {
            opts.new_threshold_ms = ms;
        }
        opts
    }
}

pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        gateway_url: Some("wss://eddn.edcd.io/ws".to_string()),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        reset_timeout_seconds: Some(60),
        reconnect_base_delay_ms: Some(1100),
        reconnect_max_delay_ms: Some(30000),
        list_length: Some(20),
        cull_factor: Some(2),
        old_threshold_ms: Some(3_600_000),
        new_threshold_ms: Some(-180_000),
        journal_topics: Some(
            [
                "journal:fsdjump",
                "journal:docked",
                "journal:location",
                "journal:scan",
                "journal:carrierjump",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ),
        ..Default::default()
    };

    // 2. Load from config file (eddn_monitor.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args_for_path = Config::parse();

    let config_file_path = cli_args_for_path
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("eddn_monitor.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!("Failed to parse config file: {}. Falling back to other sources.", config_file_path.display());
            }
        } else {
            log::warn!("Failed to read config file: {}. Falling back to other sources.", config_file_path.display());
        }
    } else {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", config_file_path.display());
    }

    // 3. Override with environment variables and CLI arguments.
    //    clap::Parser handles env vars and CLI args; merge them over the file config.
    let cli_args_final = Config::parse();
    current_config.merge(cli_args_final)
}
