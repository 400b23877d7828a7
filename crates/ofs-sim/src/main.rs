use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ofs_model::SyncConfig;
use ofs_sim::{run_simulator, simulation_sync_config, SimulatorConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("ofs-sim")
        .version(ofs_sim::VERSION)
        .about("Offline sync core simulator")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run random edits against an unreliable remote and check for lost or resurrected entities")
                .arg(
                    Arg::new("steps")
                        .long("steps")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of random operations"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.2")
                        .value_parser(value_parser!(f64))
                        .help("Fraction of remote calls failing transiently"),
                )
                .arg(
                    Arg::new("scopes")
                        .long("scopes")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Scopes seeded on the remote"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML engine configuration; simulation defaults when absent"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop at the first violation"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the default engine configuration, or validate a file")
                .arg(
                    Arg::new("check")
                        .long("check")
                        .value_parser(value_parser!(PathBuf))
                        .help("Configuration file to validate"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(args: &ArgMatches) -> Result<bool> {
    let sync = match args.get_one::<PathBuf>("config") {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => simulation_sync_config(),
    };
    let config = SimulatorConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        steps: args.get_one::<u64>("steps").copied().unwrap_or(200),
        failure_rate: args.get_one::<f64>("failure-rate").copied().unwrap_or(0.2),
        scopes: args.get_one::<usize>("scopes").copied().unwrap_or(3),
        stop_on_first_violation: args.get_flag("stop-on-violation"),
    };

    let report = run_simulator(config, sync)
        .await
        .context("simulator could not start")?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

fn config(args: &ArgMatches) -> Result<bool> {
    if let Some(path) = args.get_one::<PathBuf>("check") {
        SyncConfig::load(path).with_context(|| format!("invalid config {}", path.display()))?;
        println!("{}: ok", path.display());
    } else {
        print!("{}", SyncConfig::default().to_toml_string()?);
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let passed = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await?,
        Some(("config", args)) => config(args)?,
        _ => {
            cli().print_help()?;
            true
        }
    };
    std::process::exit(if passed { 0 } else { 1 });
}
