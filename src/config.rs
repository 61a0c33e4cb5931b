use crate::error::{ApiError, ErrorCode, RelayResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "termrelay.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub edge: EdgeConfig,
    pub session: SessionConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Session service: holds the registry and the attached processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: String,
    /// Base used when handing out `websocketUrl` from the management API.
    pub public_ws_base: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3006".to_string(),
            public_ws_base: "ws://localhost:3006".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub listen: String,
    /// Session service base URL; `/ws/{sessionId}` is appended per connection.
    pub upstream: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            upstream: "ws://127.0.0.1:3006".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub docker_path: String,
    pub working_dir: String,
    pub shell: String,
    pub term: String,
    pub colorterm: String,
    /// Session id whose process streams the dev-server log before the shell.
    pub main_session_id: String,
    pub main_log_path: String,
    pub default_cols: u16,
    pub default_rows: u16,
    pub default_user_id: String,
    pub default_workspace_id: String,
    /// Capacity of the per-session process output channel, in chunks.
    pub output_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            docker_path: "docker".to_string(),
            working_dir: "/workspace".to_string(),
            shell: "/bin/sh".to_string(),
            term: "xterm-256color".to_string(),
            colorterm: "truecolor".to_string(),
            main_session_id: "main".to_string(),
            main_log_path: "/tmp/app.log".to_string(),
            default_cols: 80,
            default_rows: 24,
            default_user_id: "auto".to_string(),
            default_workspace_id: "auto".to_string(),
            output_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Edge router upgrade endpoint.
    pub edge_url: String,
    /// Optional overall connectivity endpoint, watched with a fixed-delay reconnect.
    pub status_url: Option<String>,
    pub reconnect_delay_ms: u64,
    pub history_max_bytes: usize,
    pub history_max_lines: usize,
    pub template_id: String,
    pub template_name: String,
    pub public_port: u16,
    pub main_startup_delay_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            edge_url: "ws://127.0.0.1:3000/ws".to_string(),
            status_url: None,
            reconnect_delay_ms: 3_000,
            history_max_bytes: 2 * 1024 * 1024,
            history_max_lines: 20_000,
            template_id: String::new(),
            template_name: "Custom".to_string(),
            public_port: 0,
            main_startup_delay_ms: 1_500,
            restart_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the session service (registry and attached processes).
    Serve(ServeArgs),
    /// Run the stateless edge router.
    Edge(EdgeArgs),
    /// Attach the local terminal to a tab through an edge router.
    Attach(AttachArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub docker_path: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct EdgeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub upstream: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct AttachArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub user_id: String,
    #[arg(long, default_value = "main")]
    pub term_id: String,
    #[arg(long)]
    pub container_id: Option<String>,
    #[arg(long)]
    pub edge_url: Option<String>,
    #[arg(long)]
    pub template: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> RelayResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("TERMRELAY_SERVICE_LISTEN") {
            self.service.listen = value;
        }
        if let Ok(value) = env::var("TERMRELAY_EDGE_LISTEN") {
            self.edge.listen = value;
        }
        if let Ok(value) = env::var("TERMRELAY_UPSTREAM") {
            self.edge.upstream = value;
        }
        if let Ok(value) = env::var("TERMRELAY_EDGE_URL") {
            self.client.edge_url = value;
        }
        if let Ok(value) = env::var("TERMRELAY_DOCKER_PATH") {
            self.session.docker_path = value;
        }
        if let Ok(value) = env::var("TERMRELAY_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("TERMRELAY_LOG_FORMAT")
            && let Some(format) = parse_log_format(&value)
        {
            self.logging.format = format.to_string();
        }
    }

    pub fn apply_serve_args(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.service.listen = listen.clone();
        }
        if let Some(path) = &args.docker_path {
            self.session.docker_path = path.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn apply_edge_args(&mut self, args: &EdgeArgs) {
        if let Some(listen) = &args.listen {
            self.edge.listen = listen.clone();
        }
        if let Some(upstream) = &args.upstream {
            self.edge.upstream = upstream.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn apply_attach_args(&mut self, args: &AttachArgs) {
        if let Some(url) = &args.edge_url {
            self.client.edge_url = url.clone();
        }
        if let Some(template) = &args.template {
            self.client.template_id = template.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }
}

fn parse_log_format(value: &str) -> Option<&'static str> {
    match value.to_ascii_lowercase().as_str() {
        "text" => Some("text"),
        "json" => Some("json"),
        _ => None,
    }
}
