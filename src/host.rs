use std::path::PathBuf;

use crate::tmp_dir::TmpDirFactory;

/// A machine tests run on. Only the local machine is supported.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub php: String,
    pub tmp_dir: Option<PathBuf>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            php: "php".to_string(),
            tmp_dir: None,
        }
    }
}

impl Host {
    pub fn tmp_dir_factory(&self) -> TmpDirFactory {
        TmpDirFactory::new(self.tmp_dir.as_deref())
    }

    /// The CGI binary installed next to the CLI binary, for tests that spawn it.
    pub fn php_cgi(&self) -> String {
        match self.php.strip_suffix("php") {
            Some(prefix) => format!("{}php-cgi", prefix),
            None => "php-cgi".to_string(),
        }
    }
}
