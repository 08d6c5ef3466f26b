use std::io::Write;

use super::{ColorMarker, Formatter};
use crate::{
    host::Host,
    scenario_set::ScenarioSet,
    test_case::{TestResult, TestResultSummary, TestStatus},
};

/// Prints one mark per test and a failure list at the end.
#[derive(Default)]
pub struct SimpleFormatter {
    marks_on_line: bool,
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {}\n", line))
        .collect::<String>()
}

impl Formatter for SimpleFormatter {
    fn on_run_start(&mut self, _w: &mut dyn Write, _cm: &ColorMarker) -> Result<(), String> {
        Ok(())
    }

    fn on_scenario_set_start(
        &mut self,
        w: &mut dyn Write,
        cm: &ColorMarker,
        host: &Host,
        scenario_set: &ScenarioSet,
        total: usize,
    ) -> Result<(), String> {
        if self.marks_on_line {
            writeln!(w).map_err(|err| err.to_string())?;
            self.marks_on_line = false;
        }
        writeln!(
            w,
            "{} {} test cases",
            cm.cyan(format!("[{}] {}", host.name, scenario_set.name())),
            total
        )
        .map_err(|err| err.to_string())
    }

    fn on_test_case_end(
        &mut self,
        w: &mut dyn Write,
        cm: &ColorMarker,
        test_result: &TestResult,
    ) -> Result<(), String> {
        self.marks_on_line = true;
        let mark = match test_result.status {
            TestStatus::Pass => cm.green("."),
            TestStatus::Fail => cm.red("F"),
            TestStatus::Crash => cm.red("C"),
            TestStatus::Timeout => cm.red("T"),
            TestStatus::Skip => cm.yellow("S"),
            TestStatus::XFail => cm.yellow("X"),
        };
        write!(w, "{}", mark).map_err(|err| err.to_string())
    }

    fn on_run_end(
        &mut self,
        w: &mut dyn Write,
        _cm: &ColorMarker,
        summary: &TestResultSummary,
    ) -> Result<(), String> {
        let (_, failed) = summary.classified_results();

        if !failed.is_empty() {
            write!(w, "\nFailures:\n").map_err(|err| err.to_string())?;
            failed.iter().enumerate().try_for_each(|(i, &tr)| {
                let mut s = format!(
                    "\n{}) {} [{}] {}\n  status: {:?}\n",
                    i + 1,
                    tr.name,
                    tr.host,
                    tr.scenario_set,
                    tr.status
                );
                if let Some(parent) = &tr.redirect_parent {
                    s.push_str(&format!("  redirected from: {}\n", parent));
                }
                tr.messages
                    .iter()
                    .for_each(|m| s.push_str(&format!("  {}\n", m.trim_end().replace('\n', "\n  "))));
                if let Some(output) = &tr.sapi_output {
                    s.push_str("  SAPI output:\n");
                    s.push_str(&indent(output));
                }
                write!(w, "{}", s).map_err(|err| err.to_string())
            })?;
        }

        write!(
            w,
            "\n{} test cases, {} failures ({} crashed, {} timed out, {} skipped)\n",
            summary.len(),
            failed.len(),
            summary.count(TestStatus::Crash),
            summary.count(TestStatus::Timeout),
            summary.count(TestStatus::Skip),
        )
        .map_err(|err| err.to_string())
    }
}
