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

//! Per-device session: builds one job per kind and drives it through the
//! registry.

use crate::error::{keep_first, ProfError, ProfResult};
use crate::job::{default_constructors, CollectionJobConfig, JobConstructor, JobDeps};
use crate::kind::{is_valid_device, DeviceId, JobKind, HOST_DEVICE_ID};
use crate::params::{JobContext, SessionParams};
use crate::registry::shared_job;

use log::{debug, error, info, warn};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of [`JobDeviceSoc::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Jobs registered and processed successfully.
    pub started: usize,
    /// Kinds switched on in the session parameters.
    pub total: usize,
}

/// `<result_dir>/device_<id>/data`, or `<result_dir>/host/data`.
pub fn session_data_dir(result_dir: &Path, device: DeviceId) -> PathBuf {
    let dev = if device == HOST_DEVICE_ID {
        "host".to_string()
    } else {
        format!("device_{}", device)
    };
    result_dir.join(dev).join("data")
}

pub struct JobDeviceSoc {
    device: DeviceId,
    deps: JobDeps,
    constructors: HashMap<JobKind, JobConstructor>,
    data_dir: Option<PathBuf>,
    running: bool,
}

impl JobDeviceSoc {
    pub fn new(device: DeviceId, deps: JobDeps) -> Self {
        Self::with_constructors(device, deps, default_constructors())
    }

    pub fn with_constructors(
        device: DeviceId,
        deps: JobDeps,
        constructors: HashMap<JobKind, JobConstructor>,
    ) -> Self {
        Self {
            device,
            deps,
            constructors,
            data_dir: None,
            running: false,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start every enabled kind. A kind that fails init, is held elsewhere or
    /// fails its first process is logged and does not fail the session.
    pub fn start(&mut self, params: Arc<SessionParams>) -> ProfResult<SessionReport> {
        let device = self.device;
        if !is_valid_device(device) {
            return Err(ProfError::InvalidArgument(format!("device {}", device)));
        }
        if self.running {
            return Err(ProfError::InvalidState(format!(
                "session of device {} already running",
                device
            )));
        }
        params.validate()?;

        let data_dir = session_data_dir(&params.result_dir, device);
        std::fs::create_dir_all(&data_dir).inspect_err(|e| {
            error!("Failed to create {:?}: {}", data_dir, e);
        })?;
        if device != HOST_DEVICE_ID {
            self.deps.channels.get_all_channels(device)?;
        }
        self.running = true;
        self.data_dir = Some(data_dir.clone());

        let ctx = Arc::new(JobContext::new(&params.job_id, device));
        let mut report = SessionReport::default();
        for kind in JobKind::ALL {
            if !params.enabled(kind) {
                continue;
            }
            report.total += 1;
            let Some(ctor) = self.constructors.get(&kind) else {
                warn!("No job for {:?}", kind);
                continue;
            };
            let mut job = ctor(&self.deps, kind);
            let cfg = CollectionJobConfig::new(
                device,
                kind,
                params.clone(),
                ctx.clone(),
                data_dir.clone(),
            );
            if let Err(e) = job.init(Arc::new(cfg)) {
                match e {
                    ProfError::Disabled(_) => debug!("{:?} on device {}: {}", kind, device, e),
                    ProfError::CapabilityUnsupported(_) => {
                        warn!("{:?} unsupported on device {}: {}", kind, device, e)
                    }
                    _ => error!("Failed to init {:?} on device {}: {}", kind, device, e),
                }
                continue;
            }

            let job = shared_job(job);
            match self.deps.registry.register_and_run(device, kind, job.clone()) {
                Ok(()) => report.started += 1,
                Err(ProfError::NotEligible { holder, .. }) => {
                    info!("{:?} already collected by device {}", kind, holder);
                    let cleanup = job.lock().unwrap_or_else(|e| e.into_inner()).uninit();
                    if let Err(e) = cleanup {
                        warn!("Cleanup of unregistered {:?} failed: {}", kind, e);
                    }
                }
                // stays registered, stop() cleans it up
                Err(e) => warn!("{:?} on device {} did not start: {}", kind, device, e),
            }
        }
        info!(
            "Session {} on device {}: {}/{} jobs started",
            params.job_id, device, report.started, report.total
        );
        Ok(report)
    }

    /// Stop every kind registered for this device, then release its poll
    /// readers, channel list and open data files. Returns the first cleanup
    /// failure.
    pub fn stop(&mut self) -> ProfResult<()> {
        let device = self.device;
        let mut result = Ok(());
        for kind in JobKind::ALL {
            match self.deps.registry.unregister_and_stop(device, kind) {
                Ok(()) => debug!("Stopped {:?} on device {}", kind, device),
                Err(ProfError::NotRegistered { .. }) => {}
                Err(e) => keep_first(&mut result, Err(e)),
            }
        }
        self.deps.poller.remove_device(device);
        self.deps.channels.clear_device(device);
        if let Some(dir) = self.data_dir.take() {
            self.deps.uploader.close_dir(&dir);
        }
        self.running = false;
        info!("Session on device {} stopped", device);
        result
    }
}
