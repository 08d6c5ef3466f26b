use std::time::Duration;

use saphyr::Yaml;

use crate::ast::{Ast, Map};

#[derive(PartialEq, Debug, Clone)]
pub struct Violation {
    pub filename: String,
    pub path: String,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct Validator {
    pub filename: String,
    pub paths: Vec<String>,
    pub violations: Vec<Violation>,
}

impl Validator {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            paths: vec!["$".to_string()],
            violations: Vec::new(),
        }
    }

    pub fn current_path(&self) -> String {
        self.paths.join("")
    }

    pub fn add_violation<S: AsRef<str>>(&mut self, message: S) {
        self.violations.push(Violation {
            filename: self.filename.clone(),
            path: self.current_path(),
            message: message.as_ref().to_string(),
        });
    }

    pub fn in_path<T, S: AsRef<str>, F: FnMut(&mut Validator) -> T>(
        &mut self,
        path: S,
        mut f: F,
    ) -> T {
        self.paths.push(path.as_ref().to_string());
        let ret = f(self);
        self.paths.pop();
        ret
    }

    pub fn in_index<T, F: FnMut(&mut Validator) -> T>(&mut self, index: usize, f: F) -> T {
        self.in_path(format!("[{}]", index), f)
    }

    pub fn in_field<T, S: AsRef<str>, F: FnMut(&mut Validator) -> T>(
        &mut self,
        field: S,
        f: F,
    ) -> T {
        self.in_path(format!(".{}", field.as_ref()), f)
    }

    pub fn must_be_map<'a>(&mut self, x: &'a Yaml) -> Option<Map<'a>> {
        match x {
            Yaml::Hash(original) => {
                let mut m = Map::new();
                for (key, value) in original {
                    if let Yaml::String(key) = key {
                        m.insert(key.as_str(), value);
                    } else {
                        self.add_violation(format!(
                            "should be string keyed map, but contains {}",
                            key.type_name()
                        ));
                        return None;
                    }
                }
                Some(m)
            }
            _ => {
                self.add_violation(format!("should be map, but is {}", x.type_name()));
                None
            }
        }
    }

    pub fn must_be_seq<'a>(&mut self, x: &'a Yaml) -> Option<&'a Vec<Yaml>> {
        match x {
            Yaml::Array(seq) => Some(seq),
            _ => {
                self.add_violation(format!("should be seq, but is {}", x.type_name()));
                None
            }
        }
    }

    pub fn must_be_bool(&mut self, x: &Yaml) -> Option<bool> {
        match x {
            Yaml::Boolean(b) => Some(*b),
            _ => {
                self.add_violation(format!("should be bool, but is {}", x.type_name()));
                None
            }
        }
    }

    pub fn must_be_uint(&mut self, x: &Yaml) -> Option<u64> {
        match x {
            Yaml::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => {
                self.add_violation(format!("should be uint, but is {}", x.type_name()));
                None
            }
        }
    }

    pub fn must_be_string(&mut self, x: &Yaml) -> Option<String> {
        match x {
            Yaml::String(s) => Some(s.clone()),
            _ => {
                self.add_violation(format!("should be string, but is {}", x.type_name()));
                None
            }
        }
    }

    /// Accepts any scalar and renders it the way it would appear in an ini or env file.
    pub fn must_be_scalar(&mut self, x: &Yaml) -> Option<String> {
        match x {
            Yaml::String(s) => Some(s.clone()),
            Yaml::Integer(n) => Some(n.to_string()),
            Yaml::Real(r) => Some(r.clone()),
            Yaml::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Yaml::Null => Some(String::new()),
            _ => {
                self.add_violation(format!("should be scalar, but is {}", x.type_name()));
                None
            }
        }
    }

    pub fn must_be_duration(&mut self, x: &Yaml) -> Option<Duration> {
        match x {
            Yaml::Integer(n) if *n >= 0 => Some(Duration::from_secs(*n as u64)),
            Yaml::String(s) => {
                if let Ok(d) = duration_str::parse(s) {
                    Some(d)
                } else {
                    self.add_violation(format!(
                        "should be positive integer or duration string, but is invalid string \"{}\"",
                        s
                    ));
                    None
                }
            }
            _ => {
                self.add_violation(format!(
                    "should be positive integer or duration string, but is {}",
                    x.type_name()
                ));
                None
            }
        }
    }

    pub fn must_be_command(&mut self, x: &Yaml) -> Option<Vec<String>> {
        self.must_be_seq(x)
            .and_then(|seq| self.map_seq(seq, |v, arg| v.must_be_string(arg)))
            .and_then(|command| {
                if command.is_empty() {
                    self.add_violation("should not be empty");
                    None
                } else {
                    Some(command)
                }
            })
    }

    pub fn may_have_map<'a, T, S: AsRef<str> + Copy, F: FnMut(&mut Validator, &Map<'a>) -> T>(
        &mut self,
        m: &Map<'a>,
        field: S,
        mut f: F,
    ) -> Option<T> {
        m.get(field.as_ref()).copied().and_then(|x| {
            self.in_field(field, |v| v.must_be_map(x).map(|m| f(v, &m)))
        })
    }

    pub fn may_have_seq<
        'a,
        T,
        S: AsRef<str> + Copy,
        F: FnMut(&mut Validator, &'a Vec<Yaml>) -> T,
    >(
        &mut self,
        m: &Map<'a>,
        field: S,
        mut f: F,
    ) -> Option<T> {
        m.get(field.as_ref()).copied().and_then(|x| {
            self.in_field(field, |v| v.must_be_seq(x).map(|seq| f(v, seq)))
        })
    }

    pub fn may_have_bool<S: AsRef<str> + Copy>(&mut self, m: &Map, field: S) -> Option<bool> {
        m.get(field.as_ref())
            .and_then(|x| self.in_field(field, |v| v.must_be_bool(x)))
    }

    pub fn may_have_uint<S: AsRef<str> + Copy>(&mut self, m: &Map, field: S) -> Option<u64> {
        m.get(field.as_ref())
            .and_then(|x| self.in_field(field, |v| v.must_be_uint(x)))
    }

    pub fn may_have_string<S: AsRef<str> + Copy>(&mut self, m: &Map, field: S) -> Option<String> {
        m.get(field.as_ref())
            .and_then(|x| self.in_field(field, |v| v.must_be_string(x)))
    }

    pub fn must_have_string<S: AsRef<str> + Copy>(&mut self, m: &Map, field: S) -> Option<String> {
        match m.get(field.as_ref()) {
            Some(x) => self.in_field(field, |v| v.must_be_string(x)),
            None => {
                self.add_violation(format!("should have .{} as string", field.as_ref()));
                None
            }
        }
    }

    pub fn may_have_duration<S: AsRef<str> + Copy>(
        &mut self,
        m: &Map,
        field: S,
    ) -> Option<Duration> {
        m.get(field.as_ref())
            .and_then(|x| self.in_field(field, |v| v.must_be_duration(x)))
    }

    pub fn may_have_command<S: AsRef<str> + Copy>(
        &mut self,
        m: &Map,
        field: S,
    ) -> Option<Vec<String>> {
        m.get(field.as_ref())
            .and_then(|x| self.in_field(field, |v| v.must_be_command(x)))
    }

    pub fn map_seq<T>(
        &mut self,
        seq: &[Yaml],
        mut f: impl FnMut(&mut Validator, &Yaml) -> Option<T>,
    ) -> Option<Vec<T>> {
        seq.iter()
            .enumerate()
            .map(|(i, x)| self.in_index(i, |v| f(v, x)))
            .collect::<Vec<Option<T>>>()
            .into_iter()
            .collect()
    }
}
