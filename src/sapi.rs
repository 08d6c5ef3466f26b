mod apache;
mod builtin;
mod http_probe;
mod log_cache;
mod managed_process;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;

use crate::{group_key::TestCaseGroupKey, host::Host, scenario::SapiKind};

pub use apache::ApacheManager;
pub use builtin::BuiltinWebServerManager;
pub use http_probe::HttpProbe;
pub use log_cache::{LivenessThrottle, LogCache};
pub use managed_process::{ManagedProcessInstance, ProcessSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Crashed,
    Closing,
    Closed,
}

/// Why an instance could not be started or stopped serving.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub message: String,
    pub sapi_output: Option<String>,
}

/// A running SAPI process serving every test of one group key.
///
/// Instances are owned by the instance manager; runners only borrow them.
pub trait SapiInstance: Send + Sync {
    fn key(&self) -> &TestCaseGroupKey;

    fn state(&self) -> InstanceState;

    fn is_crashed(&self) -> bool {
        self.state() == InstanceState::Crashed
    }

    /// Checks the process is still alive. Expensive checks are throttled.
    fn is_running(&self) -> BoxFuture<'_, bool>;

    fn mark_crashed(&self);

    /// Stops reuse of a healthy instance that can no longer be trusted, e.g. one
    /// still busy with a timed out request. `is_running` reports false afterwards.
    fn retire(&self);

    /// `host:port` the instance listens on.
    fn address(&self) -> &str;

    fn docroot(&self) -> &Path;

    /// Diagnostic log of the process, cached after the first read.
    fn sapi_output(&self) -> Option<String>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Launches SAPI instances of one web server product.
pub trait WebServerManager: Send + Sync {
    fn name(&self) -> &str;

    fn get_instance<'a>(
        &'a self,
        key: &'a TestCaseGroupKey,
        docroot: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn SapiInstance>, CrashReport>>;

    fn allow_concurrent_instances(&self) -> bool;

    fn is_ssl_supported(&self) -> bool;

    fn default_docroot(&self) -> &Path;

    /// Checks the product is usable on the host before any instance is requested.
    fn setup(&self) -> BoxFuture<'_, Result<(), String>>;
}

/// Manager for the SAPI of a scenario set, or `None` for the CLI.
pub fn new_manager(
    sapi: &SapiKind,
    host: &Host,
    docroot: &Path,
) -> Option<Arc<dyn WebServerManager>> {
    match sapi {
        SapiKind::Cli => None,
        SapiKind::BuiltinWeb(web) => Some(Arc::new(BuiltinWebServerManager::new(
            host,
            web.clone(),
            docroot,
        ))),
        SapiKind::Apache(apache) => Some(Arc::new(ApacheManager::new(
            host,
            apache.clone(),
            docroot,
        ))),
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub mod testutil {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    pub struct StubInstance {
        pub id: usize,
        pub key: TestCaseGroupKey,
        pub address: String,
        pub state: Mutex<InstanceState>,
        pub docroot: PathBuf,
        pub closed: AtomicBool,
        pub retired: AtomicBool,
    }

    impl SapiInstance for StubInstance {
        fn key(&self) -> &TestCaseGroupKey {
            &self.key
        }

        fn state(&self) -> InstanceState {
            *lock(&self.state)
        }

        fn is_running(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move {
                self.state() == InstanceState::Running && !self.retired.load(Ordering::SeqCst)
            })
        }

        fn mark_crashed(&self) {
            *lock(&self.state) = InstanceState::Crashed;
        }

        fn retire(&self) {
            self.retired.store(true, Ordering::SeqCst);
        }

        fn address(&self) -> &str {
            &self.address
        }

        fn docroot(&self) -> &Path {
            &self.docroot
        }

        fn sapi_output(&self) -> Option<String> {
            Some(format!("log of instance {}", self.id))
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
                let mut state = lock(&self.state);
                if *state != InstanceState::Crashed {
                    *state = InstanceState::Closed;
                }
            })
        }
    }

    /// Hands out stub instances and records every spawn.
    #[derive(Default)]
    pub struct StubManager {
        pub concurrent: bool,
        pub spawned: Mutex<Vec<Arc<StubInstance>>>,
        /// Number of spawns to fail, keyed by `TEST` env value.
        pub failures: Mutex<HashMap<String, usize>>,
        pub next_id: AtomicUsize,
        pub docroot: PathBuf,
        /// Address handed to every instance, `127.0.0.1:0` when unset.
        pub address: Option<String>,
    }

    impl StubManager {
        pub fn new(concurrent: bool) -> Self {
            Self {
                concurrent,
                ..Default::default()
            }
        }

        pub fn spawn_count(&self) -> usize {
            lock(&self.spawned).len()
        }

        pub fn instance(&self, i: usize) -> Arc<StubInstance> {
            lock(&self.spawned)[i].clone()
        }
    }

    impl WebServerManager for StubManager {
        fn name(&self) -> &str {
            "stub"
        }

        fn get_instance<'a>(
            &'a self,
            key: &'a TestCaseGroupKey,
            docroot: &'a Path,
        ) -> BoxFuture<'a, Result<Arc<dyn SapiInstance>, CrashReport>> {
            Box::pin(async move {
                let tag = key.env.get("TEST").cloned().unwrap_or_default();
                if let Some(remaining) = lock(&self.failures).get_mut(&tag) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(CrashReport {
                            message: format!("{} failed to start", tag),
                            sapi_output: Some("startup log".to_string()),
                        });
                    }
                }

                let instance = Arc::new(StubInstance {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    key: key.clone(),
                    address: self
                        .address
                        .clone()
                        .unwrap_or_else(|| "127.0.0.1:0".to_string()),
                    state: Mutex::new(InstanceState::Running),
                    docroot: docroot.to_path_buf(),
                    closed: AtomicBool::new(false),
                    retired: AtomicBool::new(false),
                });
                lock(&self.spawned).push(instance.clone());
                Ok(instance as Arc<dyn SapiInstance>)
            })
        }

        fn allow_concurrent_instances(&self) -> bool {
            self.concurrent
        }

        fn is_ssl_supported(&self) -> bool {
            false
        }

        fn default_docroot(&self) -> &Path {
            &self.docroot
        }

        fn setup(&self) -> BoxFuture<'_, Result<(), String>> {
            Box::pin(async { Ok(()) })
        }
    }
}
