use clap::Parser;

use crate::feed::transport::{CommandTransport, WebSocketTransport};
use crate::feed::FeedConfig;
use crate::model::SourceId;

/// EPL prediction-market edge dashboard
#[derive(Parser, Debug, Clone)]
#[command(name = "epl-edge", version, about)]
pub struct Config {
    /// Dashboard listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// Command emitting model-feed JSON lines on stdout
    #[arg(long, env = "MODEL_CMD")]
    pub model_cmd: Option<String>,

    /// WebSocket URL pushing model-feed JSON lines
    #[arg(long, env = "MODEL_WS_URL")]
    pub model_ws_url: Option<String>,

    /// Command emitting Kalshi-feed JSON lines on stdout
    #[arg(long, env = "KALSHI_CMD")]
    pub kalshi_cmd: Option<String>,

    /// WebSocket URL pushing Kalshi-feed JSON lines
    #[arg(long, env = "KALSHI_WS_URL")]
    pub kalshi_ws_url: Option<String>,

    /// Command emitting Manifold-feed JSON lines on stdout
    #[arg(long, env = "MANIFOLD_CMD")]
    pub manifold_cmd: Option<String>,

    /// WebSocket URL pushing Manifold-feed JSON lines
    #[arg(long, env = "MANIFOLD_WS_URL")]
    pub manifold_ws_url: Option<String>,

    /// JSON file of team aliases merged over the built-in table
    #[arg(long, env = "TEAM_ALIASES")]
    pub team_aliases: Option<String>,

    /// Seconds a market entry survives without a refresh before eviction
    #[arg(long, env = "STALE_AFTER_SECS", default_value = "900")]
    pub stale_after_secs: u64,

    /// Seconds between staleness sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "30")]
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut any = false;
        for (name, cmd, ws) in self.producer_options() {
            if cmd.is_some() && ws.is_some() {
                anyhow::bail!(
                    "configure either --{name}-cmd or --{name}-ws-url for {name}, not both"
                );
            }
            any |= cmd.is_some() || ws.is_some();
        }
        if !any {
            anyhow::bail!(
                "no producer configured; set at least one of MODEL_CMD, KALSHI_CMD, MANIFOLD_CMD or their WS counterparts"
            );
        }
        if self.stale_after_secs == 0 {
            anyhow::bail!("stale_after_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        Ok(())
    }

    /// Build the feed configuration for every producer the flags name.
    pub fn feeds(&self) -> anyhow::Result<Vec<FeedConfig>> {
        let mut feeds = Vec::new();
        for (source, (_, cmd, ws)) in SourceId::ALL.iter().zip(self.producer_options()) {
            if let Some(cmd) = cmd {
                feeds.push(FeedConfig {
                    source: *source,
                    transport: Box::new(CommandTransport::from_command_line(cmd)?),
                });
            } else if let Some(url) = ws {
                feeds.push(FeedConfig {
                    source: *source,
                    transport: Box::new(WebSocketTransport::new(url)),
                });
            }
        }
        Ok(feeds)
    }

    fn producer_options(&self) -> [(&'static str, &Option<String>, &Option<String>); 3] {
        [
            ("model", &self.model_cmd, &self.model_ws_url),
            ("kalshi", &self.kalshi_cmd, &self.kalshi_ws_url),
            ("manifold", &self.manifold_cmd, &self.manifold_ws_url),
        ]
    }
}
