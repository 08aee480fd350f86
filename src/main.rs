use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use twinrs::logging::{init_logging, LogFormat, LogLevel};
use twinrs::{
    BroadcastPublisher, MonitoringSession, MonitoringSummary, RiskLevel, SimulationEngine,
    SimulatorConfig, TickEvent, TwinError,
};

/// TwinRS - Live athlete telemetry simulator
///
/// Simulates heart rate, steps, sleep, stress, recovery and hydration for
/// any number of athletes and streams the readings with risk alerts.
#[derive(Parser)]
#[command(name = "twinrs")]
#[command(author = "TwinRS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Live athlete telemetry simulator", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track athletes and stream their tick events
    Run {
        /// Athlete ID to track (repeatable)
        #[arg(short, long)]
        athlete: Vec<String>,

        /// Number of generated athletes when no ID is given
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Stop after this many ticks (0 runs until Ctrl-C)
        #[arg(short, long, default_value = "10")]
        ticks: usize,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Monitor one athlete and summarize the session
    Monitor {
        /// Athlete ID (generated if omitted)
        #[arg(short, long)]
        athlete: Option<String>,

        /// Number of samples to collect
        #[arg(short, long, default_value = "60")]
        samples: usize,
    },

    /// Show or write configuration
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write the default configuration file
        #[arg(short, long)]
        init: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

/// Flat row for table and CSV output
#[derive(Debug, Serialize, Tabled)]
struct EventRow {
    athlete_id: String,
    activity: String,
    heart_rate: u16,
    hrv: u16,
    steps: u64,
    sleep_hours: f64,
    calories_burned: u64,
    stress_level: u8,
    recovery_score: u8,
    hydration_level: u8,
    is_sleeping: bool,
    risks: String,
}

impl From<&TickEvent> for EventRow {
    fn from(event: &TickEvent) -> Self {
        let s = event.snapshot();
        EventRow {
            athlete_id: event.athlete_id.clone(),
            activity: s.activity.to_string(),
            heart_rate: s.heart_rate,
            hrv: s.hrv,
            steps: s.steps,
            sleep_hours: s.sleep_hours,
            calories_burned: s.calories_burned,
            stress_level: s.stress_level,
            recovery_score: s.recovery_score,
            hydration_level: s.hydration_level,
            is_sleeping: s.is_sleeping,
            risks: event
                .risks()
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = execute(cli).await {
        report_error(&e);
        std::process::exit(1);
    }
}

/// Log a failure at its severity and tell the user what happened
fn report_error(e: &anyhow::Error) {
    match e.chain().find_map(|cause| cause.downcast_ref::<TwinError>()) {
        Some(twin) => {
            let level = twin.severity().to_tracing_level();
            if level == tracing::Level::ERROR {
                tracing::error!(error = %twin, "Command failed");
            } else if level == tracing::Level::WARN {
                tracing::warn!(error = %twin, "Command failed");
            } else {
                tracing::info!(error = %twin, "Command failed");
            }
            eprintln!("{} {}", "Error:".red().bold(), twin.user_message());
        }
        None => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SimulatorConfig::load_from_file(path)?,
        None => SimulatorConfig::load_or_default(),
    };

    let mut log_config = config.logging.clone();
    if cli.verbose > 0 {
        log_config.level = LogLevel::from_verbosity(cli.verbose);
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config)?;

    match cli.command {
        Commands::Run {
            athlete,
            count,
            ticks,
            format,
        } => {
            let athletes = if athlete.is_empty() {
                (0..count.max(1)).map(|_| generated_id()).collect()
            } else {
                let mut ids = athlete;
                ids.sort();
                ids.dedup();
                ids
            };
            run(config, athletes, ticks, format).await?;
        }

        Commands::Monitor { athlete, samples } => {
            let athlete_id = athlete.unwrap_or_else(generated_id);
            monitor(config, athlete_id, samples).await?;
        }

        Commands::Config { show, init } => {
            if init {
                let path = cli.config.unwrap_or_else(SimulatorConfig::default_config_path);
                SimulatorConfig::default().save_to_file(&path)?;
                println!("{} {}", "✓ Wrote default configuration to".green(), path.display());
            }
            if show || !init {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

fn generated_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("athlete-{}", &id[..8])
}

async fn run(
    config: SimulatorConfig,
    athletes: Vec<String>,
    ticks: usize,
    format: OutputFormat,
) -> Result<()> {
    let publisher = BroadcastPublisher::new(config.event_channel_capacity);
    let mut rx = publisher.subscribe();
    let engine = SimulationEngine::new(config, Arc::new(publisher))?;

    for athlete_id in &athletes {
        engine.start(athlete_id.as_str())?;
    }
    if format == OutputFormat::Table {
        eprintln!(
            "{}",
            format!("Tracking {} athlete(s): {}", athletes.len(), athletes.join(", "))
                .cyan()
                .bold()
        );
    }

    let mut csv_writer = csv::Writer::from_writer(io::stdout());
    let mut status = engine.subscribe_status();
    let mut batcher = TickBatcher::new(athletes.len());
    let mut completed_ticks = 0usize;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while ticks == 0 || completed_ticks < ticks {
        let event = tokio::select! {
            msg = rx.recv() => match msg {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Output fell behind, events skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            Ok(()) = status.changed() => {
                engine.ensure_healthy()?;
                continue;
            }
            _ = &mut ctrl_c => break,
        };

        if let Some(tick) = batcher.close_if_repeated(&event.athlete_id) {
            finish_tick(&tick, format);
            completed_ticks += 1;
            if ticks != 0 && completed_ticks >= ticks {
                break;
            }
        }

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Csv => {
                csv_writer
                    .serialize(EventRow::from(&event))
                    .context("Failed to write CSV row")?;
                csv_writer.flush()?;
            }
            OutputFormat::Table => {}
        }
        if let Some(tick) = batcher.push(event) {
            finish_tick(&tick, format);
            completed_ticks += 1;
        }
    }

    engine.halt();
    Ok(())
}

/// Groups streamed events into ticks
///
/// A tick is complete once every athlete has reported. An athlete reporting
/// twice closes the pending tick early, which happens after lag or when an
/// athlete fails to advance.
struct TickBatcher {
    athletes: usize,
    pending: Vec<TickEvent>,
}

impl TickBatcher {
    fn new(athletes: usize) -> Self {
        Self {
            athletes,
            pending: Vec::with_capacity(athletes),
        }
    }

    /// Close the pending tick if `athlete_id` already reported in it
    fn close_if_repeated(&mut self, athlete_id: &str) -> Option<Vec<TickEvent>> {
        if self.pending.iter().any(|e| e.athlete_id == athlete_id) {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Add an event; returns the tick it completes
    fn push(&mut self, event: TickEvent) -> Option<Vec<TickEvent>> {
        self.pending.push(event);
        if self.pending.len() >= self.athletes {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

fn finish_tick(tick: &[TickEvent], format: OutputFormat) {
    if format == OutputFormat::Table {
        print_batch(tick);
    }
}

fn print_batch(batch: &[TickEvent]) {
    let rows: Vec<EventRow> = batch.iter().map(EventRow::from).collect();
    println!("{}", Table::new(rows));
    for event in batch {
        for risk in event.risks() {
            let level = match risk.level {
                RiskLevel::High => risk.level.to_string().red().bold(),
                RiskLevel::Medium => risk.level.to_string().yellow().bold(),
            };
            println!("  [{}] {} {}: {}", level, event.athlete_id, risk.name, risk.message);
        }
    }
}

async fn monitor(config: SimulatorConfig, athlete_id: String, samples: usize) -> Result<()> {
    let publisher = BroadcastPublisher::new(config.event_channel_capacity);
    let engine = SimulationEngine::new(config, Arc::new(publisher.clone()))?;
    let session = MonitoringSession::new(&publisher, athlete_id.as_str(), samples, engine.tick_interval());
    engine.start(athlete_id.as_str())?;

    println!("{}", format!("Monitoring {}...", athlete_id).blue().bold());
    let progress = ProgressBar::new(samples as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} samples ({elapsed})")
            .context("Invalid progress template")?,
    );

    let summary = session
        .run_with_progress(|n| progress.set_position(n as u64))
        .await?;
    progress.finish_and_clear();
    engine.ensure_healthy()?;
    engine.halt();

    match summary {
        Some(summary) => print_summary(&summary),
        None => println!("{}", "No monitoring data received".yellow()),
    }
    Ok(())
}

fn print_summary(summary: &MonitoringSummary) {
    println!("{}", "Monitoring Results:".green().bold());
    println!("  Samples: {}", summary.sample_count);
    println!("  Average Heart Rate: {:.1} BPM", summary.avg_heart_rate);
    println!("  Maximum Heart Rate: {} BPM", summary.max_heart_rate);
    println!("  Total Steps: {}", summary.total_steps);
    println!("  Duration: {:.1} minutes", summary.duration_minutes);

    if !summary.anomalies.is_empty() {
        println!("{}", "Alerts:".red().bold());
        for anomaly in &summary.anomalies {
            println!("  - {}", anomaly.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use twinrs::AthleteState;

    fn event(athlete_id: &str) -> TickEvent {
        TickEvent::new(athlete_id.to_string(), &AthleteState::baseline(Utc::now()), Vec::new())
    }

    fn ids(tick: &[TickEvent]) -> Vec<&str> {
        tick.iter().map(|e| e.athlete_id.as_str()).collect()
    }

    #[test]
    fn test_tick_completes_when_all_report() {
        let mut batcher = TickBatcher::new(2);
        assert!(batcher.close_if_repeated("A").is_none());
        assert!(batcher.push(event("A")).is_none());
        assert!(batcher.close_if_repeated("B").is_none());

        let tick = batcher.push(event("B")).unwrap();
        assert_eq!(ids(&tick), vec!["A", "B"]);
    }

    #[test]
    fn test_short_tick_does_not_shift_later_ticks() {
        let mut batcher = TickBatcher::new(3);
        batcher.push(event("A"));
        batcher.push(event("B"));

        // C never reported; A opens the next tick
        let short = batcher.close_if_repeated("A").unwrap();
        assert_eq!(ids(&short), vec!["A", "B"]);

        assert!(batcher.push(event("A")).is_none());
        assert!(batcher.push(event("B")).is_none());
        let full = batcher.push(event("C")).unwrap();
        assert_eq!(ids(&full), vec!["A", "B", "C"]);
    }
}
