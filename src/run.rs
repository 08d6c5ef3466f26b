use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::{self, parse, Config},
    permutation::PermutationLayer,
    reporter::{Formatter, Reporter},
    scenario_set::ScenarioSet,
    test_case_runner::{self, run_tests, RunOptions},
    test_pack::TestPackError,
};

#[derive(Debug, PartialEq)]
pub enum RunError {
    TestFailed,
    InvalidInput,
    InternalError,
    Interrupted,
}

impl RunError {
    pub fn to_exit_status(&self) -> i32 {
        match self {
            RunError::TestFailed => 1,
            RunError::InvalidInput => 2,
            RunError::InternalError => 3,
            RunError::Interrupted => 4,
        }
    }
}

pub fn load_config(filenames: &[String]) -> Result<Config, RunError> {
    let (files, errs) = partition_results(filenames.iter().map(|filename| {
        File::open(filename)
            .map_err(|err| config::Error::without_violations(filename, format!("cannot open: {}", err)))
            .and_then(|file| parse(filename, file))
    }));

    let errs = if errs.is_empty() {
        match Config::merge(files) {
            Ok(config) => return Ok(config),
            Err(errs) => errs,
        }
    } else {
        errs
    };

    errs.iter().for_each(|err| {
        eprintln!("{}: {}", err.filename, err.message);
        err.violations.iter().for_each(|violation| {
            eprintln!(
                "{}:{}: {}",
                violation.filename, violation.path, violation.message
            );
        });
    });
    Err(RunError::InvalidInput)
}

pub fn list_scenario_sets(config: &Config, layer: PermutationLayer) {
    config
        .get_scenario_sets(layer)
        .iter()
        .map(ScenarioSet::name)
        .for_each(|name| println!("{}", name));
}

pub fn run(
    config: &Config,
    options: &RunOptions,
    use_color: bool,
    f: Box<dyn Formatter>,
    stop: &AtomicBool,
) -> Result<(), RunError> {
    let runtime = tokio::runtime::Runtime::new().map_err(|err| {
        eprintln!("internal error: cannot start runtime: {}", err);
        RunError::InternalError
    })?;

    let mut w = std::io::stdout();
    let mut r = Reporter::new(&mut w, use_color, f);

    let outcome = match run_tests(config, options, &mut r, stop, runtime.handle()) {
        Ok(outcome) => outcome,
        Err(test_case_runner::Error::TestPack(err @ TestPackError::NotFound(_))) => {
            eprintln!("{}", err);
            return Err(RunError::InvalidInput);
        }
        Err(err) => {
            eprintln!("internal error: {}", err);
            return Err(RunError::InternalError);
        }
    };

    if stop.load(Ordering::SeqCst) {
        return Err(RunError::Interrupted);
    }

    if !outcome.failed_sets.is_empty() {
        eprintln!(
            "scenario sets failed to set up: {}",
            outcome.failed_sets.join(", ")
        );
        return Err(RunError::InvalidInput);
    }

    if !outcome.summary.is_all_passed() {
        return Err(RunError::TestFailed);
    }

    Ok(())
}

fn partition_results<T, E>(results: impl Iterator<Item = Result<T, E>>) -> (Vec<T>, Vec<E>) {
    let mut oks = vec![];
    let mut errs = vec![];

    results.into_iter().for_each(|result| match result {
        Ok(ok) => oks.push(ok),
        Err(err) => errs.push(err),
    });

    (oks, errs)
}
