use std::io::Write;

use serde::Serialize;

use super::{ColorMarker, Formatter};
use crate::{
    host::Host,
    scenario_set::ScenarioSet,
    test_case::{TestResult, TestResultSummary},
};

/// Prints a single JSON document when the run ends.
#[derive(Default)]
pub struct JsonFormatter {
    scenario_sets: Vec<ScenarioSetJson>,
}

#[derive(Serialize)]
struct ScenarioSetJson {
    host: String,
    name: String,
    num_test_cases: usize,
}

#[derive(Serialize)]
struct TestResultJson<'a> {
    #[serde(flatten)]
    result: &'a TestResult,
    passed: bool,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    num_test_cases: usize,
    num_passed_test_cases: usize,
    num_failed_test_cases: usize,
    success: bool,
    scenario_sets: &'a [ScenarioSetJson],
    test_results: Vec<TestResultJson<'a>>,
}

impl Formatter for JsonFormatter {
    fn on_run_start(&mut self, _w: &mut dyn Write, _cm: &ColorMarker) -> Result<(), String> {
        Ok(())
    }

    fn on_scenario_set_start(
        &mut self,
        _w: &mut dyn Write,
        _cm: &ColorMarker,
        host: &Host,
        scenario_set: &ScenarioSet,
        total: usize,
    ) -> Result<(), String> {
        self.scenario_sets.push(ScenarioSetJson {
            host: host.name.clone(),
            name: scenario_set.name(),
            num_test_cases: total,
        });
        Ok(())
    }

    fn on_test_case_end(
        &mut self,
        _w: &mut dyn Write,
        _cm: &ColorMarker,
        _test_result: &TestResult,
    ) -> Result<(), String> {
        Ok(())
    }

    fn on_run_end(
        &mut self,
        w: &mut dyn Write,
        _cm: &ColorMarker,
        summary: &TestResultSummary,
    ) -> Result<(), String> {
        let (passed, failed) = summary.classified_results();

        let report = ReportJson {
            num_test_cases: summary.len(),
            num_passed_test_cases: passed.len(),
            num_failed_test_cases: failed.len(),
            success: summary.is_all_passed(),
            scenario_sets: &self.scenario_sets,
            test_results: summary
                .results
                .iter()
                .map(|tr| TestResultJson {
                    result: tr,
                    passed: tr.is_passed(),
                })
                .collect(),
        };

        let json = serde_json::to_string(&report).map_err(|err| err.to_string())?;

        write!(w, "{}", json).map_err(|err| err.to_string())
    }
}
