mod ast;
mod config;
mod exec;
mod group_key;
mod host;
mod ini;
mod instance_manager;
mod matcher;
mod permutation;
mod reporter;
mod run;
mod runner;
mod sapi;
mod scenario;
mod scenario_set;
mod test_case;
mod test_case_runner;
mod test_pack;
mod tmp_dir;
mod validator;

use std::{
    io::IsTerminal,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use permutation::PermutationLayer;
use reporter::{Formatter, JsonFormatter, SimpleFormatter};
use run::{list_scenario_sets, load_config, run};
use test_case_runner::RunOptions;

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Clone, ValueEnum)]
enum Color {
    Auto,
    Always,
    Never,
}

#[derive(Clone, ValueEnum)]
enum Format {
    Simple,
    Json,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    duration_str::parse(s).map_err(|err| err.to_string())
}

#[derive(Parser)]
#[command(about = "Runs PHPT test packs under every configured scenario set")]
struct Args {
    /// Root directory of the test pack
    test_pack: PathBuf,
    /// Test names or name fragments to run; every test when omitted
    names: Vec<String>,
    #[clap(long = "config")]
    config: Vec<String>,
    #[clap(value_enum, long = "layer", default_value_t = PermutationLayer::Core)]
    layer: PermutationLayer,
    #[clap(long = "ignore-missing")]
    ignore_missing: bool,
    #[clap(long = "threads")]
    threads: Option<usize>,
    #[clap(long = "timeout", default_value = "60s", value_parser = parse_duration)]
    timeout: Duration,
    #[clap(value_enum, long = "color", default_value_t = Color::Auto)]
    color: Color,
    #[clap(value_enum, long = "format", default_value_t = Format::Simple)]
    format: Format,
    #[clap(long = "list-scenario-sets")]
    list_scenario_sets: bool,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SAPIRUN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = ctrlc::set_handler(|| STOP.store(true, Ordering::SeqCst)) {
        tracing::warn!("cannot install interrupt handler: {}", err);
    }

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(err) => std::process::exit(err.to_exit_status()),
    };

    if args.list_scenario_sets {
        list_scenario_sets(&config, args.layer);
        return;
    }

    let use_color = match args.color {
        Color::Auto => std::io::stdout().is_terminal(),
        Color::Always => true,
        Color::Never => false,
    };

    let f: Box<dyn Formatter> = match args.format {
        Format::Simple => Box::<SimpleFormatter>::default(),
        Format::Json => Box::<JsonFormatter>::default(),
    };

    let options = RunOptions {
        test_pack: args.test_pack,
        names: args.names,
        layer: args.layer,
        ignore_missing: args.ignore_missing,
        threads: args.threads,
        timeout: args.timeout,
    };

    if let Err(err) = run(&config, &options, use_color, f, &STOP) {
        std::process::exit(err.to_exit_status());
    }
}
