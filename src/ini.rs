use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Directives that may legitimately appear more than once in a php.ini.
const MULTI_VALUED: &[&str] = &["extension", "zend_extension"];

/// Directives every test run starts from, before scenarios and overrides apply.
const BASELINE_DIRECTIVES: &[(&str, &str)] = &[
    ("output_handler", ""),
    ("open_basedir", ""),
    ("disable_functions", ""),
    ("output_buffering", "Off"),
    ("error_reporting", "32767"),
    ("display_errors", "1"),
    ("display_startup_errors", "1"),
    ("log_errors", "0"),
    ("html_errors", "0"),
    ("track_errors", "1"),
    ("report_memleaks", "1"),
    ("report_zend_debug", "0"),
    ("docref_root", ""),
    ("docref_ext", ".html"),
    ("error_prepend_string", ""),
    ("error_append_string", ""),
    ("auto_prepend_file", ""),
    ("auto_append_file", ""),
    ("ignore_repeated_errors", "0"),
    ("precision", "14"),
    ("memory_limit", "128M"),
];

/// An effective set of ini directives.
///
/// Equality and hashing only look at the directives themselves; `default`
/// records whether the set is still the untouched baseline of a scenario set.
#[derive(Debug, Clone, Default)]
pub struct PhpIni {
    directives: BTreeMap<String, Vec<String>>,
    default: bool,
}

impl PartialEq for PhpIni {
    fn eq(&self, other: &Self) -> bool {
        self.directives == other.directives
    }
}

impl Eq for PhpIni {}

impl Hash for PhpIni {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.directives.hash(state);
    }
}

impl PhpIni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_baseline() -> Self {
        let mut ini = Self::new();
        BASELINE_DIRECTIVES
            .iter()
            .for_each(|(name, value)| ini.put_single(name, value));
        ini.default = true;
        ini
    }

    /// Parses the body of an INI section, one `name=value` per line.
    pub fn parse(section: &str) -> Self {
        let mut ini = Self::new();
        section
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with(';'))
            .filter_map(|line| line.split_once('='))
            .for_each(|(name, value)| {
                let value = value.trim().trim_matches('"');
                if MULTI_VALUED.contains(&name.trim()) {
                    ini.put_multiple(name.trim(), value);
                } else {
                    ini.put_single(name.trim(), value);
                }
            });
        ini
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn mark_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.directives.get(name).map(Vec::as_slice)
    }

    pub fn put_single<N: AsRef<str>, V: AsRef<str>>(&mut self, name: N, value: V) {
        self.directives.insert(
            name.as_ref().to_string(),
            vec![value.as_ref().to_string()],
        );
        self.default = false;
    }

    pub fn put_multiple<N: AsRef<str>, V: AsRef<str>>(&mut self, name: N, value: V) {
        let values = self
            .directives
            .entry(name.as_ref().to_string())
            .or_default();
        if !values.iter().any(|v| v == value.as_ref()) {
            values.push(value.as_ref().to_string());
        }
        self.default = false;
    }

    /// Overlays `other` on top of this set. Multi-valued directives are merged,
    /// everything else is replaced.
    pub fn replace_all(&mut self, other: &PhpIni) {
        other.directives.iter().for_each(|(name, values)| {
            if MULTI_VALUED.contains(&name.as_str()) {
                values.iter().for_each(|value| self.put_multiple(name, value));
            } else {
                self.directives.insert(name.clone(), values.clone());
            }
        });
        if !other.directives.is_empty() {
            self.default = false;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.directives.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Renders the set as `-d name=value` arguments for the CLI SAPI.
    pub fn to_cli_args(&self) -> Vec<String> {
        self.iter()
            .flat_map(|(name, value)| ["-d".to_string(), format!("{}={}", name, value)])
            .collect()
    }
}

impl std::fmt::Display for PhpIni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| writeln!(f, "{}={}", name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    mod parse {
        use super::*;

        #[test]
        fn reads_directives_and_skips_comments() {
            let ini = PhpIni::parse(
                "; comment\nprecision=10\n\nextension=mysqli\nextension=pdo\nmemory_limit = \"256M\"\n",
            );

            assert_eq!(Some(&["10".to_string()][..]), ini.get("precision"));
            assert_eq!(Some(&["256M".to_string()][..]), ini.get("memory_limit"));
            assert_eq!(
                Some(&["mysqli".to_string(), "pdo".to_string()][..]),
                ini.get("extension")
            );
            assert!(!ini.is_default());
        }

        #[test]
        fn last_single_valued_directive_wins() {
            let ini = PhpIni::parse("precision=10\nprecision=12");

            assert_eq!(Some(&["12".to_string()][..]), ini.get("precision"));
        }
    }

    mod replace_all {
        use super::*;

        #[test]
        fn overlays_directives_and_clears_default_flag() {
            let mut ini = PhpIni::new_baseline();
            assert!(ini.is_default());

            ini.replace_all(&PhpIni::parse("precision=5\nextension=gd"));

            assert_eq!(Some(&["5".to_string()][..]), ini.get("precision"));
            assert_eq!(Some(&["gd".to_string()][..]), ini.get("extension"));
            assert!(!ini.is_default());
        }

        #[test]
        fn empty_overlay_keeps_default_flag() {
            let mut ini = PhpIni::new_baseline();
            ini.replace_all(&PhpIni::new());

            assert!(ini.is_default());
        }
    }

    #[test]
    fn equality_ignores_default_flag() {
        let a = PhpIni::parse("precision=14");
        let b = PhpIni::parse("precision=14").mark_default();

        assert_eq!(a, b);
        assert_ne!(a, PhpIni::parse("precision=14\nlog_errors=1"));
    }

    #[test]
    fn renders_cli_args_and_ini_file() {
        let ini = PhpIni::parse("precision=14\nextension=gd");

        assert_eq!(
            vec!["-d", "extension=gd", "-d", "precision=14"],
            ini.to_cli_args()
        );
        assert_eq!("extension=gd\nprecision=14\n", ini.to_string());
    }
}
