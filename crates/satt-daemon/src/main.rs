//! `attenuator-ioc`: the solid-attenuator control engine daemon. One process
//! per device prefix, no subcommands (spec §6 "CLI / process model").

use anyhow::{Context, Result};
use clap::Parser;
use satt_actuator::ProcessModel;
use satt_blade::Blade;
use satt_configset::ConfigurationSet;
use satt_control::{ControlSurface, FilterRecord};
use satt_engine::Stack;
use satt_events::{EVENT_CHANNEL_CAP, Event};
use satt_table::{AbsorptionRow, AbsorptionTable, Material};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "attenuator-ioc", about = "Solid-attenuator control engine")]
struct Args {
    /// Configuration file path (overrides discovery of `attenuator.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Directory holding per-material absorption table files.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,
    /// Device prefix, overriding the config file value.
    #[arg(long = "prefix")]
    prefix: Option<String>,
    /// Blade count, overriding the config file value.
    #[arg(long = "blades")]
    blades: Option<usize>,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) -> Result<()> {
        let log_dir = Path::new(".");
        let file_appender = tracing_appender::rolling::never(log_dir, "attenuator-ioc.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => self.log_guard = Some(guard),
            Err(_err) => {
                // A global subscriber is already installed (e.g. under test harnesses).
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

/// A handful of built-in materials used when `data_dir` has no file for a
/// material, so the daemon is runnable out of the box without external
/// table acquisition (explicitly out of scope, spec §1).
fn builtin_material(name: &str) -> Material {
    let (mu_per_m, atomic_weight_g, density_g_cm3, z) = match name {
        "C" => (0.6_f64, 12.011, 2.267, 6),
        _ => (1.0_f64, 28.085, 2.329, 14), // Si, and the fallback default
    };
    let rows = (0..=1000)
        .map(|i| AbsorptionRow {
            e: 1000.0 + i as f64,
            f2: 0.0,
            mu: mu_per_m,
        })
        .collect();
    let table = AbsorptionTable::from_rows(rows).expect("builtin table is well-formed");
    Material::new(name, z, atomic_weight_g, density_g_cm3, table)
}

/// Load `<data_dir>/<material>.csv` (`e,f2,mu` rows, no header) if present,
/// falling back to the built-in table otherwise. A present-but-malformed
/// file is `BadTable` and fatal (spec §7).
fn load_material(data_dir: &Path, name: &str) -> Result<Material> {
    let path = data_dir.join(format!("{name}.csv"));
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return Ok(builtin_material(name)),
    };

    let mut rows = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split(',');
        let parse = |p: Option<&str>| -> Result<f64> {
            p.context("missing column")?
                .trim()
                .parse::<f64>()
                .context("non-numeric column")
        };
        let e = parse(parts.next())?;
        let f2 = parse(parts.next())?;
        let mu = parse(parts.next())?;
        rows.push(AbsorptionRow { e, f2, mu });
    }

    let table = AbsorptionTable::from_rows(rows)
        .with_context(|| format!("absorption table for {name} at {}", path.display()))?;
    Ok(Material::new(name, 0, 1.0, 1.0, table))
}

/// A default thickness schedule for blades with no explicit per-blade
/// configuration source (persisted per-blade thickness is outside this
/// crate's config schema; see DESIGN.md).
fn default_thickness(index: usize) -> f64 {
    0.0005 * (index + 1) as f64
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut startup = AppStartup::new();
    startup.configure_logging()?;
    AppStartup::install_panic_hook();
    info!(target: "runtime.startup", "starting");

    let file_config = satt_config::load_from(args.config.clone())?;
    let prefix = args.prefix.unwrap_or(file_config.prefix);
    let blade_count = args.blades.unwrap_or(file_config.blade_count);
    let data_dir = args.data_dir.unwrap_or_else(|| PathBuf::from(&file_config.data_dir));

    info!(
        target: "runtime.startup",
        prefix = %prefix,
        blade_count,
        data_dir = %data_dir.display(),
        "configuration loaded"
    );

    let si = Arc::new(load_material(&data_dir, "Si")?);
    let c = Arc::new(load_material(&data_dir, "C")?);

    let mut blades = Vec::with_capacity(blade_count);
    let mut filters = Vec::with_capacity(blade_count);
    for index in 0..blade_count {
        let thickness = default_thickness(index);
        let material = if index % 2 == 0 { si.clone() } else { c.clone() };
        blades.push(Blade::new(index, material.clone(), thickness)?);
        filters.push(FilterRecord::new(material.formula.clone(), thickness)?);
    }

    let configset = ConfigurationSet::enumerate(blade_count)?;
    let control = ControlSurface::new(filters, vec!["Si".to_string(), "C".to_string()]);
    let actuator = Arc::new(ProcessModel::new());
    let motion_timeout = Duration::from_millis(file_config.motion_timeout_ms);
    let stack = Stack::new(
        blades,
        configset,
        control,
        actuator,
        motion_timeout,
        file_config.run_clear_retries,
    );

    let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAP);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "runtime.shutdown", "ctrl_c received");
            let _ = shutdown_tx.send(Event::Shutdown).await;
        }
    });

    info!(target: "runtime", prefix = %prefix, "entering reactive loop");
    stack.run(rx).await;
    info!(target: "runtime.shutdown", "reactive loop exited");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}
