use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callrelay::{HttpTarget, LoadHarness, LoadTestConfig, LoadTestReport};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "load-tool")]
#[command(about = "Ramped synthetic call load against a callrelay deployment")]
struct Cli {
    /// Total synthetic calls to release
    #[arg(long, default_value_t = 100)]
    calls: u64,

    /// Seconds over which calls ramp from zero to --calls
    #[arg(long, default_value_t = 30)]
    ramp_up: u64,

    /// Sustain window in minutes; no new calls after it ends
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Sustain window in seconds; overrides --duration
    #[arg(long)]
    sustain_seconds: Option<u64>,

    #[arg(long, default_value_t = 100)]
    max_concurrent: usize,

    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    /// Also write the JSON report here
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 10_000)]
    call_timeout_ms: u64,

    #[arg(long, default_value_t = 30)]
    grace_seconds: u64,

    /// p95 dispatch latency must be below this
    #[arg(long, default_value_t = 600.0)]
    latency_threshold_ms: f64,

    /// Minimum success rate, in percent
    #[arg(long, default_value_t = 95.0)]
    success_threshold: f64,
}

impl Cli {
    fn load_config(&self) -> LoadTestConfig {
        let sustain = match self.sustain_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => Duration::from_secs(self.duration * 60),
        };
        LoadTestConfig {
            target_calls: self.calls,
            ramp_up: Duration::from_secs(self.ramp_up),
            sustain,
            max_concurrent: self.max_concurrent,
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            grace_period: Duration::from_secs(self.grace_seconds),
            latency_threshold_ms: self.latency_threshold_ms,
            success_threshold_percent: self.success_threshold,
            ..LoadTestConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(error = %format!("{err:#}"), "load test aborted");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = cli.load_config();
    let target = HttpTarget::new(&cli.url, config.call_timeout)
        .context("failed to build HTTP client")?;
    let harness = LoadHarness::new(config, Arc::new(target)).context("invalid load test options")?;

    info!(url = %cli.url, "running load test");
    let run = harness.run().await.context("load test run failed")?;
    let report = LoadTestReport::from_run(&run);

    write_summary(&mut io::stderr().lock(), &report).context("failed to write summary")?;
    let json = report.to_json_pretty()?;
    println!("{}", json);

    if let Some(path) = &cli.output {
        tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    Ok(report.passed())
}

/// Human-readable summary. Goes to stderr so stdout carries only the JSON report.
fn write_summary(out: &mut impl Write, report: &LoadTestReport) -> io::Result<()> {
    let summary = &report.test_summary;
    let latency = &report.dispatch_latency_ms;
    writeln!(out, "load_test results:")?;
    writeln!(out, "  total_calls: {}", summary.total_calls)?;
    writeln!(out, "  successful: {}", summary.successful_calls)?;
    writeln!(out, "  failed: {}", summary.failed_calls)?;
    writeln!(out, "  timed_out: {}", summary.timed_out_calls)?;
    writeln!(out, "  success_rate_percent: {:.2}", summary.success_rate_percent)?;
    writeln!(out, "  duration_s: {:.2}", summary.test_duration_seconds)?;
    writeln!(out, "  latency_ms_p50: {:.2}", latency.p50)?;
    writeln!(out, "  latency_ms_p95: {:.2}", latency.p95)?;
    writeln!(out, "  latency_ms_p99: {:.2}", latency.p99)?;
    for (prefix, count) in &report.error_analysis {
        writeln!(out, "  error[{}]: {}", prefix, count)?;
    }
    writeln!(out, "  verdict: {}", report.performance_assessment.verdict)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("callrelay=info,load_tool=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
