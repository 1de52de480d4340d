// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collection job contract and the state machine every job kind follows.
//!
//! ```text
//! Uninitialized --init--> Initialized --process--> Running --uninit--> Stopped
//!        \__________________________uninit (no-op)_______________________/
//! ```

use crate::channel_poll::ChannelPoller;
use crate::channels::ChannelValidityCache;
use crate::config::Config;
use crate::drv_event::ProfDrvEvent;
use crate::error::{ProfError, ProfResult};
use crate::hal::DriverHal;
use crate::kind::{DeviceId, JobKind, HOST_DEVICE_ID};
use crate::params::{split_events, JobContext, SessionParams};
use crate::process::ProcessRunner;
use crate::registry::CollectionRegistry;
use crate::timer::TimerManager;
use crate::uploader::{FileChunkDesc, Uploader};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A unit of sampling work bound to one (device, kind).
pub trait CollectionJob: Send {
    fn init(&mut self, cfg: Arc<CollectionJobConfig>) -> ProfResult<()>;
    fn process(&mut self) -> ProfResult<()>;
    fn uninit(&mut self) -> ProfResult<()>;

    /// Whether one running instance blocks this kind on every other device.
    fn is_global_job_level(&self) -> bool {
        false
    }
}

/// Immutable per-(device, kind) configuration.
#[derive(Debug, Clone)]
pub struct CollectionJobConfig {
    pub device: DeviceId,
    pub kind: JobKind,
    pub events: Option<Vec<String>>,
    pub cores: Option<Vec<u32>>,
    /// Data file directory; the file name comes from [`data_file_name`].
    pub data_dir: PathBuf,
    pub params: Arc<SessionParams>,
    pub ctx: Arc<JobContext>,
}

impl CollectionJobConfig {
    /// Config of `kind` on `device`, with its event and core lists taken from
    /// the session parameters.
    pub fn new(
        device: DeviceId,
        kind: JobKind,
        params: Arc<SessionParams>,
        ctx: Arc<JobContext>,
        data_dir: PathBuf,
    ) -> Self {
        let events = params.events(kind).map(split_events);
        let cores = match kind {
            JobKind::AiCoreSample | JobKind::AiCoreTask => params.ai_core_cores.clone(),
            _ => None,
        };
        Self {
            device,
            kind,
            events,
            cores,
            data_dir,
            params,
            ctx,
        }
    }

    pub fn file_desc(&self, template: &str) -> FileChunkDesc {
        FileChunkDesc {
            dir: self.data_dir.clone(),
            file_name: data_file_name(template, self.device),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Bookkeeping of [`JobState`] transitions shared by every job kind.
#[derive(Debug)]
pub struct JobLifecycle {
    state: JobState,
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self {
            state: JobState::Uninitialized,
        }
    }
}

impl JobLifecycle {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run `f` as the init step; only legal from `Uninitialized`.
    pub fn init<T, F>(&mut self, f: F) -> ProfResult<T>
    where
        F: FnOnce() -> ProfResult<T>,
    {
        if self.state != JobState::Uninitialized {
            return Err(ProfError::InvalidState(format!("init in {:?}", self.state)));
        }
        let v = f()?;
        self.state = JobState::Initialized;
        Ok(v)
    }

    /// Run `f` as a process step. A successful step moves the job to
    /// `Running`; a failed one keeps the current state so cleanup still runs.
    pub fn process<F>(&mut self, f: F) -> ProfResult<()>
    where
        F: FnOnce() -> ProfResult<()>,
    {
        match self.state {
            JobState::Initialized | JobState::Running => {
                f()?;
                self.state = JobState::Running;
                Ok(())
            }
            s => Err(ProfError::InvalidState(format!("process in {:?}", s))),
        }
    }

    /// Move to `Stopped`. `f` runs only when the job got past init; every
    /// other state is a no-op success.
    pub fn uninit<F>(&mut self, f: F) -> ProfResult<()>
    where
        F: FnOnce(JobState) -> ProfResult<()>,
    {
        let prev = std::mem::replace(&mut self.state, JobState::Stopped);
        match prev {
            JobState::Initialized | JobState::Running => f(prev),
            _ => Ok(()),
        }
    }
}

/// Shared collaborators handed to every job constructor.
#[derive(Clone)]
pub struct JobDeps {
    pub config: Arc<Config>,
    pub hal: Arc<dyn DriverHal>,
    pub uploader: Arc<dyn Uploader>,
    pub runner: Arc<dyn ProcessRunner>,
    pub registry: Arc<CollectionRegistry>,
    pub timer: Arc<TimerManager>,
    pub channels: Arc<ChannelValidityCache>,
    pub poller: Arc<ChannelPoller>,
    pub drv_event: Arc<ProfDrvEvent>,
}

pub type JobConstructor = fn(&JobDeps, JobKind) -> Box<dyn CollectionJob>;

/// Constructor of every kind, keyed by kind.
pub fn default_constructors() -> HashMap<JobKind, JobConstructor> {
    use crate::channel_job::{ChannelJob, EventChannelJob};
    use crate::host_job::{HostSampleJob, PerfScriptJob};

    let mut m: HashMap<JobKind, JobConstructor> = HashMap::new();
    for kind in JobKind::ALL {
        let ctor: JobConstructor = match kind {
            JobKind::AiCpu => EventChannelJob::boxed,
            JobKind::HostCpu | JobKind::HostMem | JobKind::HostNetwork => HostSampleJob::boxed,
            JobKind::HostSysCall => PerfScriptJob::boxed,
            _ => ChannelJob::boxed,
        };
        m.insert(kind, ctor);
    }
    m
}

/// Fail init when `kind` is not meant for `device`. Host kinds may be
/// requested by any session; device kinds never run on the host sentinel.
pub fn check_device_side(kind: JobKind, device: DeviceId) -> ProfResult<()> {
    if device == HOST_DEVICE_ID && !kind.is_host_kind() {
        return Err(ProfError::Disabled(format!("{:?} does not run on the host", kind)));
    }
    Ok(())
}

/// Join an event list the way the driver expects it.
pub fn join_events(events: &[String]) -> String {
    events.join(",")
}

/// Expand a data file name template: `%d` device, `%p` agent pid, `%h`
/// hostname.
pub fn data_file_name(template: &str, device: DeviceId) -> String {
    let mut name = template.replace("%d", &device.to_string());
    if name.contains("%p") {
        name = name.replace("%p", &std::process::id().to_string());
    }
    if name.contains("%h") {
        match gethostname::gethostname().into_string() {
            Ok(hostname) => name = name.replace("%h", &hostname),
            Err(hostname) => {
                log::error!("Failed to convert the host name {:?} into a string.", hostname);
            }
        }
    }
    name
}
