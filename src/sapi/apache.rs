use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::{CrashReport, HttpProbe, ManagedProcessInstance, ProcessSpec, SapiInstance, WebServerManager};
use crate::{
    exec::{execute_command, Status},
    group_key::TestCaseGroupKey,
    host::Host,
    scenario::ApacheSapi,
    tmp_dir::{InstanceDir, TmpDirFactory, TmpDirSupplier},
};

const PORT_RANGE: u16 = 1000;
const LOG_FILE: &str = "error.log";

/// Runs Apache httpd with mod_php in single-process mode (`httpd -X`).
pub struct ApacheManager {
    php: String,
    php_cgi: String,
    apache: ApacheSapi,
    docroot: PathBuf,
    tmp_dirs: TmpDirFactory,
    next_port: AtomicU16,
}

impl ApacheManager {
    pub fn new(host: &Host, apache: ApacheSapi, docroot: &Path) -> Self {
        Self {
            php: host.php.clone(),
            php_cgi: host.php_cgi(),
            apache,
            docroot: docroot.to_path_buf(),
            tmp_dirs: host.tmp_dir_factory(),
            next_port: AtomicU16::new(0),
        }
    }

    fn allocate_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::SeqCst) % PORT_RANGE;
        self.apache.web.port.wrapping_add(offset)
    }

    /// Renders httpd.conf for an instance whose files live in `conf_dir`.
    pub fn configuration(&self, conf_dir: &Path, docroot: &Path, port: u16) -> String {
        let conf_dir = conf_dir.display().to_string();
        let docroot = docroot.display().to_string();
        let docroot = docroot.trim_end_matches('/');

        [
            format!("ServerRoot \"{}\"", conf_dir),
            format!("PidFile \"{}/httpd.pid\"", conf_dir),
            format!("LoadModule php_module \"{}\"", self.apache.module.display()),
            format!("PHPIniDir \"{}/\"", conf_dir),
            "ServerAdmin administrator@127.0.0.1".to_string(),
            format!("ServerName 127.0.0.1:{}", port),
            format!("Listen 127.0.0.1:{}", port),
            format!("ErrorLog \"{}/{}\"", conf_dir, LOG_FILE),
            "LogLevel warn".to_string(),
            format!("DocumentRoot \"{}\"", docroot),
            "<Directory />".to_string(),
            "    AllowOverride none".to_string(),
            "</Directory>".to_string(),
            format!("<Directory \"{}\">", docroot),
            "    Options Indexes FollowSymLinks".to_string(),
            "    AllowOverride None".to_string(),
            "</Directory>".to_string(),
            "DirectoryIndex index.php index.html".to_string(),
            "AddType application/x-httpd-php .php".to_string(),
        ]
        .join("\n")
            + "\n"
    }

    fn process_spec(
        &self,
        key: &TestCaseGroupKey,
        dir: &InstanceDir,
        docroot: &Path,
    ) -> Result<ProcessSpec, String> {
        let port = self.allocate_port();
        let address = format!("127.0.0.1:{}", port);
        let ini_file = dir.save("php.ini", &key.ini.to_string())?;
        let conf_file = dir.save("httpd.conf", &self.configuration(dir.path(), docroot, port))?;

        let mut env = key.env_pairs();
        env.push(("PHPRC".to_string(), ini_file.display().to_string()));
        env.push(("TEST_PHP_EXECUTABLE".to_string(), self.php.clone()));
        env.push(("TEST_PHP_CGI_EXECUTABLE".to_string(), self.php_cgi.clone()));

        Ok(ProcessSpec {
            command: vec![
                self.apache.httpd.display().to_string(),
                "-X".to_string(),
                "-f".to_string(),
                conf_file.display().to_string(),
            ],
            env,
            docroot: docroot.to_path_buf(),
            log_file: dir.file(LOG_FILE),
            probe: HttpProbe::new(&address, self.apache.web.start_timeout),
            address,
        })
    }
}

impl WebServerManager for ApacheManager {
    fn name(&self) -> &str {
        "apache"
    }

    fn get_instance<'a>(
        &'a self,
        key: &'a TestCaseGroupKey,
        docroot: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn SapiInstance>, CrashReport>> {
        Box::pin(async move {
            let crash = |message: String| CrashReport {
                message,
                sapi_output: None,
            };
            let dir = self.tmp_dirs.create("sapirun-apache-").map_err(crash)?;
            let spec = self.process_spec(key, &dir, docroot).map_err(crash)?;

            ManagedProcessInstance::start(key, spec, dir)
                .await
                .map(|instance| Arc::new(instance) as Arc<dyn SapiInstance>)
        })
    }

    fn allow_concurrent_instances(&self) -> bool {
        true
    }

    fn is_ssl_supported(&self) -> bool {
        true
    }

    fn default_docroot(&self) -> &Path {
        &self.docroot
    }

    fn setup(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            if !self.apache.module.is_file() {
                return Err(format!(
                    "PHP module {} does not exist",
                    self.apache.module.display()
                ));
            }
            let command = vec![self.apache.httpd.display().to_string(), "-V".to_string()];
            let output = execute_command(&command, "", &[], None, Duration::from_secs(60)).await?;
            match output.status {
                Status::Exit(0) => {
                    tracing::info!(
                        version = %output.stdout.lines().next().unwrap_or_default(),
                        "using apache"
                    );
                    Ok(())
                }
                status => Err(format!(
                    "{} is not runnable: {:?}",
                    self.apache.httpd.display(),
                    status
                )),
            }
        })
    }
}
