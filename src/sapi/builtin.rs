use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use super::{CrashReport, HttpProbe, ManagedProcessInstance, ProcessSpec, SapiInstance, WebServerManager};
use crate::{
    exec::{execute_command, Status},
    group_key::TestCaseGroupKey,
    host::Host,
    scenario::WebSapi,
    tmp_dir::{TmpDirFactory, TmpDirSupplier},
};

/// Instances take successive ports starting from the configured one.
const PORT_RANGE: u16 = 1000;

/// Runs PHP's built-in web server (`php -S`).
pub struct BuiltinWebServerManager {
    php: String,
    web: WebSapi,
    docroot: PathBuf,
    tmp_dirs: TmpDirFactory,
    next_port: AtomicU16,
}

impl BuiltinWebServerManager {
    pub fn new(host: &Host, web: WebSapi, docroot: &Path) -> Self {
        Self {
            php: host.php.clone(),
            web,
            docroot: docroot.to_path_buf(),
            tmp_dirs: host.tmp_dir_factory(),
            next_port: AtomicU16::new(0),
        }
    }

    fn allocate_address(&self) -> String {
        let offset = self.next_port.fetch_add(1, Ordering::SeqCst) % PORT_RANGE;
        format!("127.0.0.1:{}", self.web.port.wrapping_add(offset))
    }

    fn process_spec(
        &self,
        key: &TestCaseGroupKey,
        docroot: &Path,
        ini_file: &Path,
        log_file: PathBuf,
    ) -> ProcessSpec {
        let address = self.allocate_address();
        let mut env = key.env_pairs();
        env.push(("PHPRC".to_string(), ini_file.display().to_string()));

        ProcessSpec {
            command: vec![
                self.php.clone(),
                "-S".to_string(),
                address.clone(),
                "-t".to_string(),
                docroot.display().to_string(),
                "-c".to_string(),
                ini_file.display().to_string(),
            ],
            env,
            docroot: docroot.to_path_buf(),
            log_file,
            // the built-in server answers 404 for a docroot without an index
            probe: HttpProbe::new(&address, self.web.start_timeout),
            address,
        }
    }
}

impl WebServerManager for BuiltinWebServerManager {
    fn name(&self) -> &str {
        "builtin_web"
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
            let dir = self.tmp_dirs.create("sapirun-builtin-").map_err(crash)?;
            let ini_file = dir.save("php.ini", &key.ini.to_string()).map_err(crash)?;
            let spec = self.process_spec(key, docroot, &ini_file, dir.file("sapi.log"));

            ManagedProcessInstance::start(key, spec, dir)
                .await
                .map(|instance| Arc::new(instance) as Arc<dyn SapiInstance>)
        })
    }

    fn allow_concurrent_instances(&self) -> bool {
        true
    }

    fn is_ssl_supported(&self) -> bool {
        false
    }

    fn default_docroot(&self) -> &Path {
        &self.docroot
    }

    fn setup(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let command = vec![self.php.clone(), "-v".to_string()];
            let output = execute_command(&command, "", &[], None, std::time::Duration::from_secs(30)).await?;
            match output.status {
                Status::Exit(0) => Ok(()),
                status => Err(format!("{} is not runnable: {:?}", self.php, status)),
            }
        })
    }
}
