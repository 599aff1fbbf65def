//! Process factory used by the launcher to start a service.
//!
//! [`SelfExec`] re-executes the current binary in `serve` mode and reads the
//! readiness line from its stdout. [`InProcess`] runs the service on the
//! caller's tokio runtime instead, which keeps tests free of child processes.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{duplex, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::daemon;
use crate::readiness::{ReadinessError, ReadinessReceiver, ReadinessSender};
use crate::ServiceConfig;

/// Something that can start a service instance for a [`ServiceConfig`].
pub trait ServiceSpawner: Send + Sync {
    /// Starts a service and returns a handle to its readiness stream.
    ///
    /// Must not wait for the service to become ready.
    fn spawn(&self, config: &ServiceConfig) -> io::Result<SpawnedService>;
}

#[derive(Debug)]
enum Instance {
    Process(Child),
    Task(JoinHandle<()>),
}

/// A service that has been started but not yet confirmed ready.
#[derive(Debug)]
pub struct SpawnedService {
    readiness: ReadinessReceiver,
    instance: Instance,
}

impl SpawnedService {
    /// Wraps a child process whose stdout carries the readiness line.
    pub fn process(child: Child, readiness: ReadinessReceiver) -> Self {
        Self {
            readiness,
            instance: Instance::Process(child),
        }
    }

    /// Wraps a task running the service in this process.
    pub fn task(handle: JoinHandle<()>, readiness: ReadinessReceiver) -> Self {
        Self {
            readiness,
            instance: Instance::Task(handle),
        }
    }

    /// Returns the child's process id, if the service runs in a child.
    pub fn pid(&self) -> Option<u32> {
        match &self.instance {
            Instance::Process(child) => child.id(),
            Instance::Task(_) => None,
        }
    }

    /// Waits up to `limit` for the readiness line.
    ///
    /// A service that stays silent for the whole window is abandoned: a child
    /// process is killed and a task is aborted. In every other case the
    /// service is left running; a child is not killed when its handle drops.
    pub async fn wait_ready(self, limit: Duration) -> Result<(), ReadinessError> {
        let Self {
            readiness,
            mut instance,
        } = self;
        let result = readiness.wait(limit).await;
        if let Err(ReadinessError::TimedOut(_)) = result {
            instance.abandon();
        }
        result
    }
}

impl Instance {
    fn abandon(&mut self) {
        match self {
            Instance::Process(child) => {
                tracing::warn!(pid = ?child.id(), "killing unresponsive service process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill service process");
                }
            }
            Instance::Task(handle) => handle.abort(),
        }
    }
}

/// Starts the service by re-executing a binary with `serve --detach`.
#[derive(Debug, Clone, Default)]
pub struct SelfExec {
    program: Option<PathBuf>,
}

impl SelfExec {
    /// Re-executes the currently running binary.
    pub fn current_exe() -> Self {
        Self { program: None }
    }

    /// Executes `program` instead of the current binary.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    /// Builds the command line passed to the service process.
    ///
    /// The address and TTL are always forwarded so both sides agree on them;
    /// the log path is forwarded only when logging to a file, and made
    /// absolute first because the detached service changes directory.
    pub fn args(config: &ServiceConfig) -> io::Result<Vec<OsString>> {
        let mut args: Vec<OsString> = vec![
            "--addr".into(),
            config.addr.to_string().into(),
            "--ttl".into(),
            humantime::format_duration(config.ttl).to_string().into(),
        ];
        if let Some(path) = config.log.clone().absolutize()?.path() {
            args.push("--log".into());
            args.push(path.clone().into_os_string());
        }
        args.push("serve".into());
        args.push("--detach".into());
        Ok(args)
    }
}

impl ServiceSpawner for SelfExec {
    fn spawn(&self, config: &ServiceConfig) -> io::Result<SpawnedService> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let args = Self::args(config)?;

        tracing::info!(program = %program.display(), ?args, "spawning service");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("service stdout was not captured"))?;

        tracing::debug!(pid = ?child.id(), "service process spawned");
        Ok(SpawnedService::process(
            child,
            ReadinessReceiver::new(BufReader::new(stdout)),
        ))
    }
}

/// Runs the service as a task on the current tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcess;

impl ServiceSpawner for InProcess {
    fn spawn(&self, config: &ServiceConfig) -> io::Result<SpawnedService> {
        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let (service_end, launcher_end) = duplex(256);
        let config = config.clone();

        let handle = runtime.spawn(async move {
            match daemon::serve(&config, ReadinessSender::new(service_end)).await {
                Ok(reason) => tracing::debug!(?reason, "in-process service stopped"),
                Err(e) if e.is_bind_conflict() => {
                    tracing::debug!("in-process service lost the bind race")
                }
                Err(e) => tracing::warn!(error = %e, "in-process service failed"),
            }
        });

        Ok(SpawnedService::task(
            handle,
            ReadinessReceiver::new(BufReader::new(launcher_end)),
        ))
    }
}
