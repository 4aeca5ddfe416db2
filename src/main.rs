use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use failopen::breaker::Evaluation;
use failopen::config::BreakerConfig;
use failopen::simulate::{self, SimulationPlan};

#[derive(Parser)]
#[command(
    name = "failopen",
    about = "Statistical fail-open circuit breaker for third-party CAPTCHA verification",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $FAILOPEN_CONFIG, then /etc/failopen/failopen.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP surface
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8087")]
        bind: String,
    },

    /// Record one verification attempt
    #[command(group(ArgGroup::new("result").required(true).args(["success", "failure"])))]
    Track {
        #[arg(long)]
        success: bool,
        #[arg(long)]
        failure: bool,
    },

    /// Evaluate the previous window now
    Evaluate {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show counters and baseline
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List baseline samples
    History {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recorded fail-open trips
    Trips {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Drop the baseline so it is relearned from scratch
    ResetHistory,

    /// Replay synthetic traffic through an in-memory breaker
    Simulate {
        #[arg(long, default_value = "14")]
        days: u32,

        /// Normal success rate, percent
        #[arg(long, default_value = "92")]
        rate: f64,

        #[arg(long, default_value = "500")]
        per_bucket: u64,

        /// Zero-based day on which the provider degrades
        #[arg(long)]
        outage_day: Option<u32>,

        /// Success rate during the outage, percent
        #[arg(long, default_value = "40")]
        outage_rate: f64,

        #[arg(long, default_value = "7")]
        seed: u64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<BreakerConfig> {
    match path {
        Some(p) => BreakerConfig::load(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(BreakerConfig::load_or_default()),
    }
}

fn init_tracing(config: &BreakerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_evaluation(eval: &Evaluation) {
    match eval {
        Evaluation::Skipped {
            bucket,
            counts,
            min_attempts,
        } => println!(
            "{bucket}: skipped ({} attempts, need {min_attempts})",
            counts.total()
        ),
        Evaluation::Recorded {
            bucket,
            rate_percent,
            decision,
            appended,
            ..
        } => println!(
            "{bucket}: normal, rate {rate_percent:.2}%{} -- {}",
            if *appended { "" } else { " (already recorded)" },
            decision.reason
        ),
        Evaluation::Tripped {
            bucket, decision, ..
        } => println!("{bucket}: FAIL-OPEN -- {}", decision.reason),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting failopen service");
            failopen::serve(&bind, config).await?;
        }
        Commands::Track { success, .. } => {
            let deployment = failopen::open_deployment(config)?;
            deployment.breaker.track(success)?;
        }
        Commands::Evaluate { json } => {
            let deployment = failopen::open_deployment(config)?;
            let eval = deployment.breaker.evaluate_previous_window()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&eval)?);
            } else {
                print_evaluation(&eval);
            }
        }
        Commands::Status { json } => {
            let deployment = failopen::open_deployment(config)?;
            let status = deployment.breaker.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("\n=== failopen status [{}] ===", status.namespace);
                for (label, b) in [("Current", &status.current), ("Previous", &status.previous)] {
                    let rate = b
                        .rate_percent
                        .map(|r| format!("{r:.2}%"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<9} {:<14} success {:>7}  failure {:>7}  rate {}",
                        label, b.bucket, b.success, b.failure, rate
                    );
                }
                println!(
                    "Baseline  {}/{} samples, mean {:.2}%, stddev {:.2}",
                    status.history_len,
                    status.history_cap,
                    status.baseline_mean,
                    status.baseline_std_dev
                );
                println!(
                    "Policy    min attempts {}, min baseline {}, z <= {:.1}\n",
                    status.min_attempts, status.min_baseline, status.z_threshold
                );
            }
        }
        Commands::History { json } => {
            let deployment = failopen::open_deployment(config)?;
            let samples = deployment.breaker.history()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&samples)?);
            } else if samples.is_empty() {
                println!("No baseline samples recorded.");
            } else {
                println!("{:<14} | {:>8} | Recorded", "Bucket", "Rate");
                println!("{:-<14}-|-{:->8}-|-{:-<25}", "", "", "");
                for s in samples {
                    println!(
                        "{:<14} | {:>7.2}% | {}",
                        s.bucket_id,
                        s.rate_percent,
                        s.recorded_at.to_rfc3339()
                    );
                }
            }
        }
        Commands::Trips { limit } => {
            let deployment = failopen::open_deployment(config)?;
            let log = deployment
                .incidents
                .context("trips are only recorded with the sqlite store backend")?;
            let incidents = log.list_recent(limit)?;
            if incidents.is_empty() {
                println!("No fail-open trips recorded.");
            }
            for i in incidents {
                println!(
                    "{} {:<9} {:<14} {}",
                    i.created_at.to_rfc3339(),
                    format!("{:?}", i.severity),
                    i.evidence.bucket_id,
                    i.reason
                );
            }
        }
        Commands::ResetHistory => {
            let deployment = failopen::open_deployment(config)?;
            let removed = deployment.breaker.reset_history()?;
            println!("Removed {removed} baseline samples.");
        }
        Commands::Simulate {
            days,
            rate,
            per_bucket,
            outage_day,
            outage_rate,
            seed,
            json,
        } => {
            let plan = SimulationPlan {
                days,
                success_rate: rate,
                attempts_per_bucket: per_bucket,
                outage_day,
                outage_rate,
                seed,
            };
            let report = simulate::run(&plan, config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{:<14} | {:<8} | {:>6} | {:>7} | {:>7}", "Bucket", "Outcome", "Total", "Rate", "Z");
                println!("{:-<14}-|-{:-<8}-|-{:->6}-|-{:->7}-|-{:->7}", "", "", "", "", "");
                for w in &report.windows {
                    let rate = w.rate_percent.map(|r| format!("{r:.2}")).unwrap_or_default();
                    let z = w.z_score.map(|z| format!("{z:.2}")).unwrap_or_default();
                    println!(
                        "{:<14} | {:<8} | {:>6} | {:>7} | {:>7}",
                        w.bucket, w.outcome, w.total, rate, z
                    );
                }
                println!(
                    "\n{} trips, {} baseline samples retained",
                    report.trips, report.history_len
                );
            }
        }
    }

    Ok(())
}
