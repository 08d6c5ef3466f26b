use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{
    lock, CrashReport, HttpProbe, InstanceState, LivenessThrottle, LogCache, SapiInstance,
};
use crate::{exec::display_command, group_key::TestCaseGroupKey, tmp_dir::InstanceDir};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How to launch one SAPI process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub address: String,
    pub docroot: PathBuf,
    /// File receiving the process output; also the instance's diagnostic log.
    pub log_file: PathBuf,
    pub probe: HttpProbe,
}

/// A web server process spawned for one group key.
pub struct ManagedProcessInstance {
    key: TestCaseGroupKey,
    address: String,
    docroot: PathBuf,
    state: Mutex<InstanceState>,
    child: Mutex<Option<Child>>,
    dir: Mutex<Option<InstanceDir>>,
    log: LogCache,
    probe: HttpProbe,
    liveness: LivenessThrottle,
    retired: AtomicBool,
}

impl ManagedProcessInstance {
    /// Spawns the process and waits until it answers HTTP requests.
    ///
    /// On failure the process is killed and its directory kept for inspection.
    pub async fn start(
        key: &TestCaseGroupKey,
        spec: ProcessSpec,
        dir: InstanceDir,
    ) -> Result<Self, CrashReport> {
        let instance = Self {
            key: key.clone(),
            address: spec.address.clone(),
            docroot: spec.docroot.clone(),
            state: Mutex::new(InstanceState::Created),
            child: Mutex::new(None),
            dir: Mutex::new(Some(dir)),
            log: LogCache::new(spec.log_file.clone()),
            probe: spec.probe.clone(),
            liveness: LivenessThrottle::new(LivenessThrottle::DEFAULT_INTERVAL),
            retired: AtomicBool::new(false),
        };

        match instance.spawn(&spec).await {
            Ok(child) => {
                *lock(&instance.child) = Some(child);
                instance.set_state(InstanceState::Running);
                tracing::debug!(address = %instance.address, "SAPI instance is running");
                Ok(instance)
            }
            Err(message) => {
                instance.set_state(InstanceState::Crashed);
                let sapi_output = instance.log.read();
                let kept = lock(&instance.dir).take().map(InstanceDir::preserve);
                tracing::warn!(
                    address = %instance.address,
                    dir = ?kept,
                    "SAPI instance failed to start: {}",
                    message
                );
                Err(CrashReport {
                    message,
                    sapi_output,
                })
            }
        }
    }

    async fn spawn(&self, spec: &ProcessSpec) -> Result<Child, String> {
        self.set_state(InstanceState::Starting);

        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| "cannot execute empty command".to_string())?;
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|err| format!("cannot open {}: {}", spec.log_file.display(), err))?;
        let stderr = stdout
            .try_clone()
            .map_err(|err| format!("cannot open {}: {}", spec.log_file.display(), err))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = lock(&self.dir).as_ref() {
            cmd.current_dir(dir.path());
        }

        tracing::debug!(command = %display_command(&spec.command), "spawning SAPI instance");
        let mut child = cmd
            .spawn()
            .map_err(|err| format!("cannot execute {:?}: {}", spec.command, err))?;

        let ready = tokio::select! {
            ready = spec.probe.wait() => ready,
            status = child.wait() => Err(match status {
                Ok(status) => format!("exited during startup with {}", status),
                Err(err) => format!("cannot wait for startup: {}", err),
            }),
        };

        match ready {
            Ok(()) => Ok(child),
            Err(message) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(message)
            }
        }
    }

    fn set_state(&self, state: InstanceState) {
        *lock(&self.state) = state;
    }

    fn has_exited(&self) -> bool {
        match lock(&self.child).as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn terminate(mut child: Child) {
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), signal::SIGTERM) {
                Ok(_) | Err(Errno::ESRCH) => {}
                Err(errno) => tracing::warn!(pid, "cannot send SIGTERM: {}", errno.desc()),
            }
        }
        if tokio::time::timeout(CLOSE_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
}

impl SapiInstance for ManagedProcessInstance {
    fn key(&self) -> &TestCaseGroupKey {
        &self.key
    }

    fn state(&self) -> InstanceState {
        *lock(&self.state)
    }

    fn is_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if self.state() != InstanceState::Running || self.retired.load(Ordering::SeqCst) {
                return false;
            }
            if self.has_exited() {
                tracing::warn!(address = %self.address, "SAPI instance exited");
                self.mark_crashed();
                return false;
            }
            if self.liveness.is_due() && !self.probe.is_reachable().await {
                tracing::warn!(address = %self.address, "SAPI instance stopped responding");
                self.mark_crashed();
                return false;
            }
            true
        })
    }

    fn mark_crashed(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, InstanceState::Starting | InstanceState::Running) {
            *state = InstanceState::Crashed;
        }
    }

    fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            tracing::debug!(address = %self.address, "SAPI instance retired");
        }
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn docroot(&self) -> &Path {
        &self.docroot
    }

    fn sapi_output(&self) -> Option<String> {
        self.log.read()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let crashed = {
                let mut state = lock(&self.state);
                if matches!(*state, InstanceState::Closing | InstanceState::Closed) {
                    return;
                }
                let crashed = *state == InstanceState::Crashed;
                *state = InstanceState::Closing;
                crashed
            };

            let child = lock(&self.child).take();
            if let Some(child) = child {
                Self::terminate(child).await;
            }

            // cache the log before its directory may go away
            self.log.read();
            let dir = lock(&self.dir).take();
            if let Some(dir) = dir {
                if crashed {
                    let path = dir.preserve();
                    tracing::info!(dir = %path.display(), "keeping directory of crashed SAPI instance");
                } else {
                    if let Err(err) = dir.delete() {
                        tracing::warn!("{}", err);
                    }
                    self.log.invalidate();
                }
            }

            self.set_state(InstanceState::Closed);
            tracing::debug!(address = %self.address, crashed, "SAPI instance closed");
        })
    }
}
