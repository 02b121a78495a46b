use anyhow::{Context, Result};
use clap::Parser;
use dosegrid_dosimetry::{parse_dose_target, DoseGridApp, DoseGridConfig, SeedStrategy};
use serde_json::json;
use shared_logging::{DiagnosticLogger, LogLevel, LogRecord};
use tokio::{io::BufReader, runtime::Runtime};

#[derive(Parser, Debug)]
#[command(
    name = "dosegrid",
    version,
    about = "Dose accumulation over a 4x4 absorber/detector grid",
    long_about = "Without an argument, reads commands from stdin (`help` lists them). \
                  With a dose target, scans the beam over every grid cell, one run per cell."
)]
struct Cli {
    /// Dose target for the scan; parsed leniently, non-numeric input counts as 0.
    #[arg(allow_hyphen_values = true)]
    dose_target: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DoseGridConfig::from_env().context("loading configuration")?;
    let runtime = Runtime::new().context("starting runtime")?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: DoseGridConfig) -> Result<()> {
    let mut app = DoseGridApp::builder(config).stdout_echo(true).build()?;
    match cli.dose_target {
        None => {
            let stdin = BufReader::new(tokio::io::stdin());
            app.run_session(stdin, tokio::io::stdout()).await?;
        }
        Some(raw) => {
            let target = parse_dose_target(&raw);
            let iterations = app
                .scan(target, SeedStrategy::WallClock)
                .await
                .with_context(|| format!("scan for dose target {target}"))?;
            let failed: Vec<usize> = iterations
                .iter()
                .filter(|iteration| iteration.outcome.is_err())
                .map(|iteration| iteration.index)
                .collect();
            if !failed.is_empty() {
                let record = LogRecord::new("dosegrid", LogLevel::Warn, "scan.failed_cells")
                    .with_metadata(&json!({ "iterations": failed }));
                DiagnosticLogger::stderr(LogLevel::Warn).log(&record)?;
            }
        }
    }

    let unwritten: Vec<u64> = app
        .controller()
        .pending_reports()
        .iter()
        .map(|record| record.run_index)
        .collect();
    if !unwritten.is_empty() {
        let record = LogRecord::new("dosegrid", LogLevel::Warn, "report.unwritten")
            .with_metadata(&json!({ "run_indices": unwritten }));
        DiagnosticLogger::stderr(LogLevel::Warn).log(&record)?;
    }
    Ok(())
}
