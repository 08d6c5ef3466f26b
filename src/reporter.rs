mod json_formatter;
mod simple_formatter;

use std::io::Write;

use crate::{
    host::Host,
    scenario_set::ScenarioSet,
    test_case::{TestResult, TestResultSummary},
};

pub use json_formatter::JsonFormatter;
pub use simple_formatter::SimpleFormatter;

pub enum Color {
    Red,
    Green,
    Yellow,
    Cyan,
    Reset,
}

impl Color {
    pub fn to_ansi(&self) -> &'static str {
        match self {
            Color::Red => "\x1b[31m",
            Color::Green => "\x1b[32m",
            Color::Yellow => "\x1b[33m",
            Color::Cyan => "\x1b[36m",
            Color::Reset => "\x1b[0m",
        }
    }
}

pub trait Formatter: Send {
    fn on_run_start(&mut self, w: &mut dyn Write, cm: &ColorMarker) -> Result<(), String>;

    /// Called once the test list of a scenario set is final, before any of its tests run.
    fn on_scenario_set_start(
        &mut self,
        w: &mut dyn Write,
        cm: &ColorMarker,
        host: &Host,
        scenario_set: &ScenarioSet,
        total: usize,
    ) -> Result<(), String>;

    fn on_test_case_end(
        &mut self,
        w: &mut dyn Write,
        cm: &ColorMarker,
        test_result: &TestResult,
    ) -> Result<(), String>;

    fn on_run_end(
        &mut self,
        w: &mut dyn Write,
        cm: &ColorMarker,
        summary: &TestResultSummary,
    ) -> Result<(), String>;
}

pub struct ColorMarker {
    use_color: bool,
}

impl ColorMarker {
    pub fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    pub fn wrap<S: AsRef<str>>(&self, color: Color, s: S) -> String {
        if self.use_color {
            format!(
                "{}{}{}",
                color.to_ansi(),
                s.as_ref(),
                Color::Reset.to_ansi()
            )
        } else {
            s.as_ref().to_string()
        }
    }

    pub fn red<S: AsRef<str>>(&self, s: S) -> String {
        self.wrap(Color::Red, s)
    }

    pub fn green<S: AsRef<str>>(&self, s: S) -> String {
        self.wrap(Color::Green, s)
    }

    pub fn yellow<S: AsRef<str>>(&self, s: S) -> String {
        self.wrap(Color::Yellow, s)
    }

    pub fn cyan<S: AsRef<str>>(&self, s: S) -> String {
        self.wrap(Color::Cyan, s)
    }
}

pub struct Reporter<'a, W: Write> {
    w: &'a mut W,
    use_color: bool,
    formatter: Box<dyn Formatter>,
}

impl<'a, W: Write> Reporter<'a, W> {
    pub fn new(w: &'a mut W, use_color: bool, formatter: Box<dyn Formatter>) -> Self {
        Self {
            w,
            use_color,
            formatter,
        }
    }

    pub fn on_run_start(&mut self) -> Result<(), String> {
        let cm = ColorMarker::new(self.use_color);
        self.formatter.on_run_start(self.w, &cm)?;
        self.flush()
    }

    pub fn on_scenario_set_start(
        &mut self,
        host: &Host,
        scenario_set: &ScenarioSet,
        total: usize,
    ) -> Result<(), String> {
        let cm = ColorMarker::new(self.use_color);
        self.formatter
            .on_scenario_set_start(self.w, &cm, host, scenario_set, total)?;
        self.flush()
    }

    pub fn on_test_case_end(&mut self, test_result: &TestResult) -> Result<(), String> {
        let cm = ColorMarker::new(self.use_color);
        self.formatter.on_test_case_end(self.w, &cm, test_result)?;
        self.flush()
    }

    pub fn on_run_end(&mut self, summary: &TestResultSummary) -> Result<(), String> {
        let cm = ColorMarker::new(self.use_color);
        self.formatter.on_run_end(self.w, &cm, summary)?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), String> {
        self.w.flush().map_err(|err| err.to_string())
    }
}
