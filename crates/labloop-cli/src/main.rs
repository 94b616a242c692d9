//! lab CLI: run simulated experiments and inspect or convert their logs.

use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use labloop::{
    read_csv, read_parquet, write_csv, write_parquet, ExperimentBuilder, ExperimentConfig,
    Measurement, ProgressPlot, Snapshot, StopHandle,
};

#[derive(Parser)]
#[command(
    name = "lab",
    about = "labloop: periodic measurement loops with condition sweeps",
    version,
    author
)]
struct Cli {
    /// Also write logs to `lab.log` in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment config against the built-in simulated source
    Run {
        /// Path to the experiment YAML
        config: PathBuf,
        /// Stop after this many samples
        #[arg(long)]
        max_samples: Option<usize>,
        /// Override the config's tick interval (seconds)
        #[arg(long)]
        interval: Option<f64>,
        /// Hide the progress spinner
        #[arg(long, short)]
        quiet: bool,
    },
    /// Show the schema and last rows of a CSV or Parquet log
    Inspect {
        /// Log file (`.csv` or `.parquet`)
        file: PathBuf,
        /// Number of trailing rows to show
        #[arg(long, short, default_value_t = 10)]
        tail: usize,
        /// CSV field separator
        #[arg(long, default_value_t = ',')]
        separator: char,
    },
    /// Convert a log to CSV, JSON or Parquet
    Export {
        /// Log file (`.csv` or `.parquet`)
        file: PathBuf,
        /// Output format
        #[arg(long, short, value_enum, default_value_t = Format::Csv)]
        format: Format,
        /// Output file (default: stdout, not available for parquet)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// CSV field separator, for input and output
        #[arg(long, default_value_t = ',')]
        separator: char,
    },
    /// Write an example experiment config
    Init {
        /// Where to write the YAML
        #[arg(default_value = "experiment.yaml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Csv,
    Json,
    Parquet,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Run {
            config,
            max_samples,
            interval,
            quiet,
        } => cmd_run(&config, max_samples, interval, quiet),
        Commands::Inspect {
            file,
            tail,
            separator,
        } => cmd_inspect(&file, tail, separator),
        Commands::Export {
            file,
            format,
            output,
            separator,
        } => cmd_export(&file, format, output.as_deref(), separator),
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

/// Compact logs on stderr, plus a plain-text file when `--log-dir` is given.
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "lab.log"));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(guard)
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_run(path: &Path, max_samples: Option<usize>, interval: Option<f64>, quiet: bool) -> Result<()> {
    let mut config = ExperimentConfig::load(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;
    if let Some(secs) = interval {
        config.interval_secs = secs;
    }
    let interval = config.interval()?;

    let stop = Arc::new(OnceLock::new());
    let mut builder = ExperimentBuilder::from_config(&config, simulated_source(max_samples, Arc::clone(&stop)));
    let progress = (!quiet).then(ProgressPlot::new);
    if let Some(progress) = &progress {
        builder = builder.plot(progress.clone());
    }
    let mut exp = builder.build()?;
    let _ = stop.set(exp.stop_handle());
    watch_ctrl_c(exp.stop_handle())?;

    println!("Running: {}", config.name);
    let outcome = exp.run(interval);
    if let Some(progress) = &progress {
        progress.finish();
    }
    let summary = outcome?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Run", "Status", "Samples", "Conditions", "Duration"]);
    table.add_row([
        summary.run_id.to_string(),
        summary.status.to_string(),
        summary.samples.to_string(),
        summary.conditions_applied.to_string(),
        format_duration(summary.duration_secs),
    ]);
    println!("{table}");

    for (label, path) in [
        ("CSV", config.csv.as_ref().map(|c| &c.path)),
        ("Parquet", config.parquet.as_ref().map(|c| &c.path)),
        ("Plot", config.plot.as_ref().map(|c| &c.path)),
    ] {
        if let Some(path) = path {
            println!("{label}: {}", path.display());
        }
    }
    Ok(())
}

/// Stand-in instrument: the sum of the numeric conditions plus a 0.5 Hz sine.
fn simulated_source(
    max_samples: Option<usize>,
    stop: Arc<OnceLock<StopHandle>>,
) -> impl FnMut(&mut Measurement) -> anyhow::Result<()> + Send + 'static {
    let mut taken = 0usize;
    move |m| {
        let offset: f64 = m.iter().skip(1).filter_map(|(_, v)| v.as_f64()).sum();
        let value = offset + (2.0 * PI * 0.5 * m.time()).sin();
        m.set("value", value)?;
        m.set("channel", "sim")?;
        taken += 1;
        if max_samples.is_some_and(|n| taken >= n) {
            if let Some(handle) = stop.get() {
                handle.stop();
            }
        }
        Ok(())
    }
}

/// Stop the run on ctrl-c. The watcher thread lives until the process exits.
fn watch_ctrl_c(handle: StopHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("lab-ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupted, stopping after the current tick");
                        handle.stop();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
                }
            });
        })?;
    Ok(())
}

fn load_log(path: &Path, separator: char) -> Result<Snapshot> {
    if !path.exists() {
        anyhow::bail!("Log file not found: {}", path.display());
    }
    let data = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") | Some("txt") => read_csv(path, separator)?,
        Some("parquet") => read_parquet(path)?,
        _ => anyhow::bail!(
            "Cannot tell the log format of {} (expected .csv or .parquet)",
            path.display()
        ),
    };
    info!(path = %path.display(), rows = data.len(), "log loaded");
    Ok(data)
}

fn cmd_inspect(path: &Path, tail: usize, separator: char) -> Result<()> {
    let data = load_log(path, separator)?;

    println!("Log: {}", path.display());
    println!("Rows: {}", data.len());
    println!();

    println!("── Columns ─────────────────────────────");
    let mut columns = Table::new();
    columns.load_preset(UTF8_FULL);
    columns.set_header(["Column", "Type"]);
    for column in data.schema().columns() {
        columns.add_row([column.name.clone(), column.kind.to_string()]);
    }
    println!("{columns}");

    if data.is_empty() || tail == 0 {
        return Ok(());
    }

    let skip = data.len().saturating_sub(tail);
    println!("── Last {} rows ─────────────────────────", data.len() - skip);
    let mut rows = Table::new();
    rows.load_preset(UTF8_FULL);
    rows.set_header(data.schema().names().collect::<Vec<_>>());
    for row in data.rows().skip(skip) {
        rows.add_row(row.cells().iter().map(|c| c.to_string()).collect::<Vec<_>>());
    }
    println!("{rows}");
    Ok(())
}

fn cmd_export(path: &Path, format: Format, output: Option<&Path>, separator: char) -> Result<()> {
    let data = load_log(path, separator)?;

    match (format, output) {
        (Format::Parquet, None) => anyhow::bail!("Parquet export needs --output"),
        (Format::Parquet, Some(out)) => write_parquet(out, &data)?,
        (Format::Csv, Some(out)) => write_csv(std::fs::File::create(out)?, &data, separator)?,
        (Format::Csv, None) => write_csv(std::io::stdout().lock(), &data, separator)?,
        (Format::Json, out) => {
            let records: Vec<serde_json::Map<String, serde_json::Value>> = data
                .rows()
                .map(|row| {
                    row.iter()
                        .map(|(name, cell)| -> serde_json::Result<_> {
                            Ok((name.to_string(), serde_json::to_value(cell)?))
                        })
                        .collect::<serde_json::Result<_>>()
                })
                .collect::<serde_json::Result<_>>()?;
            let content = serde_json::to_string_pretty(&records)?;
            match out {
                Some(out) => std::fs::write(out, content + "\n")?,
                None => println!("{content}"),
            }
        }
    }

    if let Some(out) = output {
        println!("Exported {} rows to {}", data.len(), out.display());
    }
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = ExperimentConfig::new("bias_sweep")
        .with_interval(0.1)
        .with_condition("bias", [0.0, 0.5, 1.0, 1.5])
        .with_condition("range", ["1mA", "1mA", "10mA", "10mA"]);
    config.measurements_per_condition = Some(5);
    config.csv = Some(labloop::models::CsvConfig {
        path: "bias_sweep.csv".into(),
        separator: ',',
    });
    config.plot = Some(labloop::models::PlotConfig {
        path: "bias_sweep.svg".into(),
        columns: Some(vec!["value".into()]),
        width: 1024,
        height: 768,
        every: 5,
    });
    config.save(path)?;
    println!("Wrote example config to {}", path.display());
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{secs:.2}s");
    }
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m {}s", m, s)
    }
}
