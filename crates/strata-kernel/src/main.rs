use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use strata_kernel::config::{keys, KernelProps};
use strata_kernel::telemetry::{self, LogFormat, TelemetryConfig};
use strata_kernel::{Kernel, KernelError};
use tracing::info;

fn cli() -> Command {
    Command::new("strata-kernel")
        .version(strata_kernel::VERSION)
        .about("Strata module orchestration kernel")
        .arg(
            Arg::new("level")
                .long("level")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("Target start level (defaults to strata.kernel.targetLevel, then 10)"),
        )
        .arg(
            Arg::new("home")
                .long("home")
                .value_parser(value_parser!(PathBuf))
                .help("Kernel home directory"),
        )
        .arg(
            Arg::new("read-only")
                .long("read-only")
                .action(ArgAction::SetTrue)
                .help("Never write kernel state or create module directories"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .default_value("compact")
                .value_parser(["compact", "json"])
                .help("Log output format"),
        )
}

fn requested_level(matches: &ArgMatches) -> Result<Option<u32>, KernelError> {
    let Some(level) = matches.get_one::<i64>("level").copied() else {
        return Ok(None);
    };
    u32::try_from(level)
        .map(Some)
        .map_err(|_| KernelError::InvalidLevel(format!("{level} (must be between 0 and {})", u32::MAX)))
}

fn overrides(matches: &ArgMatches) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    if let Some(home) = matches.get_one::<PathBuf>("home") {
        overrides.insert(keys::HOME.to_string(), home.display().to_string());
    }
    if matches.get_flag("read-only") {
        overrides.insert(keys::READ_ONLY.to_string(), "true".to_string());
    }
    overrides
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let format: LogFormat = matches
        .get_one::<String>("log-format")
        .map_or(Ok(LogFormat::Compact), |f| f.parse())?;
    telemetry::initialise(&TelemetryConfig::from_env(format))?;

    let requested = requested_level(&matches)?;
    let props = KernelProps::load(&overrides(&matches));
    let level = requested.unwrap_or_else(|| props.target_level());
    print!("{}", props.report());

    let kernel = Arc::new(Kernel::builder().props(props).build()?);
    println!("{}", kernel.diagnostics());

    kernel.set_target_level(level)?;
    let controller = Arc::clone(kernel.start_levels());
    tokio::task::spawn_blocking(move || controller.sync()).await??;

    let start_levels = kernel.start_levels();
    println!(
        "Kernel started: currentLevel={} targetLevel={}",
        start_levels.current_level(),
        start_levels.target_level()
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    let closing = Arc::clone(&kernel);
    tokio::task::spawn_blocking(move || closing.close()).await?;
    Ok(())
}
