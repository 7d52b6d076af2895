//! Binary entry point for the flowmon agent.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use flowmon::config::{CollectorConfig, ConfigEvent, FilterRuleConfig, ReportConfig};
use flowmon::fcm::{FcmConfig, FcmManager};
use flowmon::gatekeeper::DirStore;
use flowmon::logging::init_logging;

#[derive(Parser, Debug)]
#[command(
    name = "flowmond",
    version,
    about = "Network flow telemetry and classification agent"
)]
struct Cli {
    /// Agent configuration file
    #[arg(long, default_value = "/etc/flowmon/flowmond.toml")]
    config: PathBuf,

    /// Log filter, e.g. info or flowmon=debug
    #[arg(long, default_value = "info", env = "FLOWMON_LOG")]
    log_level: String,

    /// Persistent-store root for the gatekeeper cache
    #[arg(long, default_value = "/var/lib/flowmon")]
    store_root: PathBuf,

    /// Scheduler tick granularity in milliseconds
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,
}

/// Static bootstrap config; runtime changes arrive as config events from
/// the management plane bridge.
#[derive(Debug, Default, Deserialize)]
struct AgentConfig {
    #[serde(default)]
    collectors: Vec<CollectorConfig>,
    #[serde(default)]
    reports: Vec<ReportConfig>,
    #[serde(default)]
    filters: Vec<FilterRuleConfig>,
    #[serde(default)]
    total_ram_bytes: u64,
    #[serde(default)]
    max_mem_kb: Option<u64>,
}

fn load_config(path: &PathBuf) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if !path.exists() {
        info!(target: "flowmond", path = %path.display(), "no config file; starting empty");
        return Ok(AgentConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("logging init failed: {e}");
        return ExitCode::FAILURE;
    }

    let agent_config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(target: "flowmond", error = %e, "config load failed");
            return ExitCode::FAILURE;
        }
    };

    let mut fcm_config = FcmConfig {
        total_ram_bytes: agent_config.total_ram_bytes,
        ..Default::default()
    };
    if let Some(kb) = agent_config.max_mem_kb {
        fcm_config.default_max_mem_kb = kb;
    }

    let mut manager = FcmManager::new(fcm_config);
    manager.set_gatekeeper_store(Box::new(DirStore::new(&cli.store_root)));

    for report in agent_config.reports {
        manager.apply_report_event(ConfigEvent::New(report));
    }
    for filter in agent_config.filters {
        manager.apply_filter_event(ConfigEvent::New(filter));
    }
    for collector in agent_config.collectors {
        manager.apply_collector_event(ConfigEvent::New(collector));
    }

    info!(target: "flowmond", "agent started");
    let tick = Duration::from_millis(cli.tick_ms.max(100));
    let started = Instant::now();
    let epoch_base = epoch_secs();

    loop {
        std::thread::sleep(tick);
        let now = epoch_base + started.elapsed().as_secs();
        manager.step(now);
        if manager.exit_requested() {
            manager.persist_gatekeeper_cache();
            info!(target: "flowmond", "restart requested by memory watchdog");
            return ExitCode::SUCCESS;
        }
    }
}
