//! tach-trace CLI - maintenance over an Allure results directory
//!
//! Used between or after test invocations that share one results
//! directory: `finalize` applies the run-wide parentSuite correction and
//! writes the run-level documents, `summary` counts results, `clean`
//! empties the directory.

use anyhow::{Context as _, Result};
use clap::Parser;
use tach_trace::config::{Cli, Commands, OutputFormat, TraceConfig};
use tach_trace::environment::EnvironmentFacts;
use tach_trace::logging;
use tach_trace::reporter::{HumanReporter, JsonReporter, LifecycleListener};
use tach_trace::results::ResultWriter;
use tach_trace::session::{self, StatusCounts};
use tracing::info;

fn main() {
    logging::init_cli();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut reporter: Box<dyn LifecycleListener> = match cli.format {
        OutputFormat::Human => Box::new(HumanReporter),
        OutputFormat::Json => Box::new(JsonReporter),
    };
    let writer = ResultWriter::new(&cli.dir);

    match cli.command {
        Commands::Finalize { render } => {
            let mut config = TraceConfig::from_env();
            config.results_dir = cli.dir.clone();

            let environment = EnvironmentFacts::collect(&config);
            let report = session::finalize_results(&writer, Vec::new(), &environment)
                .with_context(|| format!("failed to finalize {}", cli.dir.display()))?;
            info!(
                rewritten = report.rewritten,
                parent_suite = report.parent_suite.as_deref().unwrap_or("-"),
                "results finalized"
            );

            if render || config.auto_report {
                session::render_report(&config.report_command, &cli.dir, &config.report_dir)
                    .context("report rendering failed")?;
            }
            reporter.results(&cli.dir, &count(&writer));
        }
        Commands::Summary => {
            reporter.results(&cli.dir, &count(&writer));
        }
        Commands::Clean => {
            let removed = session::clean_dir(&cli.dir)
                .with_context(|| format!("failed to clean {}", cli.dir.display()))?;
            info!(removed, dir = %cli.dir.display(), "results directory cleaned");
        }
    }
    Ok(())
}

fn count(writer: &ResultWriter) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for status in writer.existing().iter().filter_map(|r| r.status()) {
        counts.add(status);
    }
    counts
}
