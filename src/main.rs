//! CLI for rTMS + LFP condition suites

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use rtms_lfp::condition::ConditionStatus;
use rtms_lfp::error::{ConfigError, RtmsError};
use rtms_lfp::suite::{SuiteConfig, SuiteOrchestrator, SuiteStatus};

const EXIT_PARTIAL: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_OTHER: u8 = 1;

#[derive(Parser)]
#[command(name = "rtms_lfp")]
#[command(about = "rTMS pulse trains, AD pathophysiology and simulated LFP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the Healthy / AD1 / AD3 suite configuration
    Generate {
        /// Output TOML file
        file: PathBuf,

        /// Study name (prefixes the summary files)
        #[arg(short, long, default_value = "rtms_lfp_ad_suite")]
        study_name: String,
    },

    /// List the conditions of a suite
    List {
        /// Suite TOML file
        file: PathBuf,
    },

    /// Run one condition of a suite
    Run {
        /// Suite TOML file
        file: PathBuf,

        /// Condition name
        name: String,
    },

    /// Run every condition of a suite in order
    RunSuite {
        /// Suite TOML file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtms_lfp=info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Generate { file, study_name } => generate(file, study_name),
        Commands::List { file } => list(file),
        Commands::Run { file, name } => run(file, &name),
        Commands::RunSuite { file } => run_suite(file),
    };

    #[cfg(feature = "profiling")]
    rtms_lfp::PROFILER.lock().log_and_clear();

    match result {
        Ok(code) => code,
        Err(RtmsError::Config(e @ ConfigError::Write { .. })) => {
            println!("❌ Error: {}", e);
            ExitCode::from(EXIT_OTHER)
        }
        Err(RtmsError::Config(e)) => {
            println!("❌ Configuration rejected: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            println!("❌ Error: {}", e);
            ExitCode::from(EXIT_OTHER)
        }
    }
}

fn generate(file: PathBuf, study_name: String) -> Result<ExitCode, RtmsError> {
    println!("\n🔧 Generating suite configuration...\n");
    let config = SuiteConfig::generate_ad_suite(study_name);
    config.to_file(&file)?;
    println!("✅ Suite configuration generated: {}", file.display());
    println!("📊 Total conditions: {}", config.conditions.len());
    for c in &config.conditions {
        println!("   - {}: {}", c.name, c.description);
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

fn list(file: PathBuf) -> Result<ExitCode, RtmsError> {
    let config = SuiteConfig::from_file(&file)?;
    let specs = config.build_conditions()?;
    let protocol = config.protocol()?;

    println!("\n╔══════════════════════════════════════════╗");
    println!("║  Suite: {}", config.study_name);
    println!("╚══════════════════════════════════════════╝\n");
    println!(
        "Protocol: {} V/m, {} Hz, {}-{} ms, width {} ms, target {}",
        protocol.field_amplitude_v_per_m(),
        protocol.frequency_hz(),
        protocol.window_start_ms(),
        protocol.window_end_ms(),
        protocol.pulse_width_ms(),
        protocol.target_population()
    );
    println!("Electrodes: {}\n", config.electrodes()?.len());
    for spec in &specs {
        println!(
            "  {:<16} stage {} ({}) {}",
            spec.name,
            spec.pathophysiology.effective_stage().number(),
            if spec.pathophysiology.enabled { "AD" } else { "healthy" },
            spec.description
        );
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

fn run(file: PathBuf, name: &str) -> Result<ExitCode, RtmsError> {
    let config = SuiteConfig::from_file(&file)?;
    let specs = config.build_conditions()?;
    let orchestrator = SuiteOrchestrator::new(
        config.study_name.clone(),
        config.engine_factory(),
        config.run_settings()?,
    );

    println!("\n╔══════════════════════════════════════════╗");
    println!("║  Running condition: {}", name);
    println!("╚══════════════════════════════════════════╝\n");

    let result = orchestrator.run_condition(&specs, name)?;
    match &result.status {
        ConditionStatus::Succeeded => {
            println!("\n✅ Condition '{}' completed successfully!", name);
            if let Some(paths) = &result.persisted {
                println!("📊 Record saved to: {}", paths.record.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        ConditionStatus::Failed { stage, reason } => {
            println!("\n❌ Condition '{}' failed at {}: {}", name, stage, reason);
            Ok(ExitCode::from(EXIT_OTHER))
        }
        ConditionStatus::NotAttempted => Err(ConfigError::NoSuchCondition(name.to_string()).into()),
    }
}

fn run_suite(file: PathBuf) -> Result<ExitCode, RtmsError> {
    let config = SuiteConfig::from_file(&file)?;
    let specs = config.build_conditions()?;
    let orchestrator = SuiteOrchestrator::new(
        config.study_name.clone(),
        config.engine_factory(),
        config.run_settings()?,
    )
    .with_policy(config.run.failure_policy);

    let outcome = orchestrator.run_suite(&specs)?;
    let summary = &outcome.summary;
    if let Err(e) = orchestrator.persist_summary(summary) {
        println!("❌ Could not write suite summary: {}", e);
    }

    println!("\n╔══════════════════════════════════════════╗");
    println!("║  Suite '{}': {:?}", summary.study_name, summary.status);
    println!("╚══════════════════════════════════════════╝\n");
    for record in &summary.records {
        match &record.status {
            ConditionStatus::Succeeded => println!("  ✅ {}", record.name),
            ConditionStatus::Failed { stage, reason } => {
                println!("  ❌ {} (failed at {}): {}", record.name, stage, reason)
            }
            ConditionStatus::NotAttempted => println!("  ⏭  {} (not attempted)", record.name),
        }
    }
    println!();

    Ok(match summary.status {
        SuiteStatus::Complete => ExitCode::SUCCESS,
        SuiteStatus::Partial | SuiteStatus::Aborted => ExitCode::from(EXIT_PARTIAL),
    })
}
