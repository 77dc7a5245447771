// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Certificate renewal agent.
//!
//! # Usage
//!
//! ```text
//! cert-agent [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run          Run the renewal loop (default)
//!   once         Run a single cycle and print the report
//!   status       Show certificate, CRL and decision without acting
//!   refresh-crl  Refresh the CRL cache if it is stale
//!   config       Configuration management
//!
//! Options:
//!   -c, --config <PATH>   Path to configuration file
//!   -h, --help            Print help
//!   -V, --version         Print version
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Run as a service
//! cert-agent --config /etc/cert-agent/config.toml run
//!
//! # What would the agent do right now?
//! cert-agent status --json
//!
//! # Validate configuration file
//! cert-agent config validate --config /path/to/config.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use clap::{Parser, Subcommand};
use usg_cert_agent::config::{AgentConfig, ConfigLoader};
use usg_cert_agent::crl::{HttpCrlSource, RevocationCache};
use usg_cert_agent::decision::CertificateState;
use usg_cert_agent::renewal::{Assessment, CycleReport};
use usg_cert_agent::{AgentError, build_orchestrator, logging};

/// Certificate renewal agent
#[derive(Parser)]
#[command(name = "cert-agent")]
#[command(author = "U.S. Federal Government")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Keeps an X.509 certificate renewed, CRL-aware", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the renewal loop until interrupted
    Run,

    /// Run a single cycle and print the report
    Once {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show certificate, CRL and decision without acting
    Status {
        /// Print the assessment as JSON
        #[arg(long)]
        json: bool,
    },

    /// Refresh the CRL cache if it is stale
    RefreshCrl {
        /// Download even if the cache is fresh
        #[arg(short, long)]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate configuration file
    Validate,

    /// Display effective configuration
    Show {
        /// Output format
        #[arg(long, default_value = "toml")]
        format: ConfigFormat,
    },
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum ConfigFormat {
    Json,
    #[default]
    Toml,
}

type CliResult = Result<ExitCode, Box<dyn std::error::Error>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> CliResult {
    let mut loader = ConfigLoader::new();
    if let Some(ref path) = cli.config {
        loader = loader.with_path(path);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&load(&loader)?).await,
        Commands::Once { json } => cmd_once(&load(&loader)?, json).await,
        Commands::Status { json } => cmd_status(&load(&loader)?, json).await,
        Commands::RefreshCrl { force } => cmd_refresh_crl(&load(&loader)?, force).await,
        Commands::Config { action } => cmd_config(&loader, action),
    }
}

/// Load configuration and install logging. Any error here stops startup.
fn load(loader: &ConfigLoader) -> Result<AgentConfig, AgentError> {
    let config = loader.load()?;
    logging::init(&config.logging)?;
    Ok(config)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_run(config: &AgentConfig) -> CliResult {
    let mut agent = build_orchestrator(config)?;

    tracing::info!(version = usg_cert_agent::VERSION, "cert-agent starting");
    agent.run_until(shutdown_signal()).await;
    tracing::info!("cert-agent stopped");

    Ok(ExitCode::SUCCESS)
}

async fn cmd_once(config: &AgentConfig, json: bool) -> CliResult {
    let mut agent = build_orchestrator(config)?;
    let report = agent.run_cycle().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.reload_error.is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_status(config: &AgentConfig, json: bool) -> CliResult {
    let mut agent = build_orchestrator(config)?;
    let assessment = agent.assess(false).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&assessment)?);
    } else {
        print_assessment(&assessment);
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_refresh_crl(config: &AgentConfig, force: bool) -> CliResult {
    let Some(settings) = config.revocation_settings() else {
        return Err(AgentError::config("CRL checking is not enabled ([crl] enabled = true)").into());
    };

    let cache = RevocationCache::new(std::sync::Arc::new(HttpCrlSource::new()?));
    let max_age_hours = if force { 0.0 } else { settings.max_age_hours };
    let outcome = cache
        .refresh_if_stale(
            &settings.url,
            &settings.cache_path,
            max_age_hours,
            settings.timeout,
        )
        .await;

    println!("CRL cache: {}", settings.cache_path.display());
    println!("  Downloaded: {}", outcome.downloaded);
    println!("  Updated:    {}", outcome.updated);
    println!("  Age:        {}", format_age(outcome.age_hours));
    if let Some(count) = outcome.revoked_count {
        println!("  Revoked:    {}", count);
    }

    match outcome.error {
        Some(e) => {
            eprintln!("Refresh failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

fn cmd_config(loader: &ConfigLoader, action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Validate => {
            let path = loader.find_config_file()?;
            loader.load()?;
            println!("Configuration is valid: {}", path.display());
        }
        ConfigAction::Show { format } => {
            let config = loader.clone().with_validate(false).load()?;
            match format {
                ConfigFormat::Toml => print!("{}", config.to_toml()?),
                ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Output
// ============================================================================

fn print_report(report: &CycleReport) {
    print_assessment(&report.assessment);

    if let Some(ref receipt) = report.published {
        println!();
        println!("Published:");
        println!("  Fingerprint: {}", receipt.fingerprint);
        println!("  Chain:       {}", receipt.chain_written);
    }
    if let Some(ref e) = report.reload_error {
        println!();
        println!("Reload failed: {}", e);
    }
}

fn print_assessment(assessment: &Assessment) {
    println!("Certificate:");
    match &assessment.certificate {
        CertificateState::Absent => println!("  (none)"),
        CertificateState::Unreadable(reason) => println!("  Unreadable: {}", reason),
        CertificateState::Present(cert) => {
            println!("  Path:       {}", cert.path.display());
            println!("  Subject:    {}", cert.subject);
            println!("  Issuer:     {}", cert.issuer);
            println!("  Serial:     {}", cert.serial);
            println!("  Not before: {}", format_time(cert.not_before));
            println!("  Not after:  {}", format_time(cert.not_after));
            if let Some(elapsed) = assessment.elapsed_percent {
                println!(
                    "  Lifetime:   {:.1}% elapsed (renew at {:.1}%)",
                    elapsed, assessment.threshold_percent
                );
            }
        }
    }

    if let Some(ref revocation) = assessment.revocation {
        println!();
        println!("Revocation:");
        println!("  Status:     {:?}", revocation.status);
        println!("  CRL age:    {}", format_age(revocation.refresh.age_hours));
        if let Some(ref issuer) = revocation.crl_issuer {
            println!("  CRL issuer: {}", issuer);
        }
        if let Some(ref reason) = revocation.reason {
            println!("  Note:       {}", reason);
        }
    }

    println!();
    println!("Force trigger: {}", assessment.force_requested);
    println!("Decision:      {}", assessment.decision);
}

fn format_age(age_hours: f64) -> String {
    if age_hours < 0.0 {
        "no cache".to_string()
    } else {
        format!("{age_hours:.2}h")
    }
}

fn format_time(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => format!("{} (unix)", d.as_secs()),
        Err(_) => "before 1970".to_string(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown requested");
}
