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

//! Authoritative set of running collection jobs.
//!
//! At most one job runs per (device, kind), and a global-level kind runs on at
//! most one device. Lock order is registry map, then job; the map lock is
//! never held across `process` or `uninit`.

use crate::error::{ProfError, ProfResult};
use crate::job::CollectionJob;
use crate::kind::{is_valid_device, DeviceId, JobKind};

use log::{debug, error, warn};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// A job shared between the registry and the session that built it.
pub type SharedJob = Arc<Mutex<Box<dyn CollectionJob>>>;

pub fn shared_job(job: Box<dyn CollectionJob>) -> SharedJob {
    Arc::new(Mutex::new(job))
}

fn lock_job(job: &SharedJob) -> MutexGuard<'_, Box<dyn CollectionJob>> {
    job.lock().unwrap_or_else(|e| e.into_inner())
}

struct RunningJobEntry {
    job: SharedJob,
    // cached at insert time so eligibility never takes a job lock
    global: bool,
}

type JobMap = BTreeMap<DeviceId, HashMap<JobKind, RunningJobEntry>>;

#[derive(Default)]
pub struct CollectionRegistry {
    jobs: Mutex<JobMap>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JobMap> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn eligibility(jobs: &JobMap, device: DeviceId, kind: JobKind) -> (bool, DeviceId) {
        for (dev, entries) in jobs.iter() {
            if entries.get(&kind).is_some_and(|e| e.global) {
                return (false, *dev);
            }
        }
        let taken = jobs.get(&device).is_some_and(|m| m.contains_key(&kind));
        (!taken, device)
    }

    /// Whether `(device, kind)` may be registered now. The second value is
    /// the device holding a conflicting global entry, or `device` itself.
    pub fn check_collection_job_is_no_register(
        &self,
        device: DeviceId,
        kind: JobKind,
    ) -> (bool, DeviceId) {
        Self::eligibility(&self.lock(), device, kind)
    }

    /// Insert `job` under `(device, kind)` and run its first `process`.
    ///
    /// A failing `process` leaves the job registered so that
    /// [`CollectionRegistry::unregister_and_stop`] still cleans it up.
    pub fn register_and_run(
        &self,
        device: DeviceId,
        kind: JobKind,
        job: SharedJob,
    ) -> ProfResult<()> {
        if !is_valid_device(device) {
            return Err(ProfError::InvalidArgument(format!("device {}", device)));
        }
        let mut guard = {
            let mut jobs = self.lock();
            let (eligible, holder) = Self::eligibility(&jobs, device, kind);
            if !eligible {
                warn!(
                    "{:?} on device {} not registered, already running on device {}",
                    kind, device, holder
                );
                return Err(ProfError::NotEligible {
                    device,
                    kind,
                    holder,
                });
            }
            // taken before the map lock is released: uninit can't overtake us
            let guard = lock_job(&job);
            let global = guard.is_global_job_level();
            jobs.entry(device).or_default().insert(
                kind,
                RunningJobEntry {
                    job: job.clone(),
                    global,
                },
            );
            guard
        };
        debug!("Registered {:?} on device {}", kind, device);
        guard.process().inspect_err(|e| {
            if e.is_benign() {
                debug!("Process of {:?} on device {}: {}", kind, device, e);
            } else {
                error!("Process of {:?} on device {} failed: {}", kind, device, e);
            }
        })
    }

    /// Remove `(device, kind)` and run its `uninit`. Waits for an in-flight
    /// `process` of the same job.
    pub fn unregister_and_stop(&self, device: DeviceId, kind: JobKind) -> ProfResult<()> {
        if !is_valid_device(device) {
            return Err(ProfError::InvalidArgument(format!("device {}", device)));
        }
        let entry = {
            let mut jobs = self.lock();
            let entry = jobs.get_mut(&device).and_then(|m| m.remove(&kind));
            if jobs.get(&device).is_some_and(HashMap::is_empty) {
                jobs.remove(&device);
            }
            entry
        };
        let Some(entry) = entry else {
            return Err(ProfError::NotRegistered { device, kind });
        };
        debug!("Unregistered {:?} on device {}", kind, device);
        let result = lock_job(&entry.job).uninit();
        result.inspect_err(|e| {
            warn!("Uninit of {:?} on device {} failed: {}", kind, device, e);
        })
    }

    /// Run `process` of an already registered job again.
    pub fn run_once(&self, device: DeviceId, kind: JobKind) -> ProfResult<()> {
        let job = self
            .lock()
            .get(&device)
            .and_then(|m| m.get(&kind))
            .map(|e| e.job.clone());
        match job {
            Some(job) => {
                let result = lock_job(&job).process();
                result
            }
            None => Err(ProfError::NotRegistered { device, kind }),
        }
    }

    pub fn is_registered(&self, device: DeviceId, kind: JobKind) -> bool {
        self.lock()
            .get(&device)
            .is_some_and(|m| m.contains_key(&kind))
    }

    /// Number of registered entries across all devices.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_count(&self, device: DeviceId) -> usize {
        self.lock().get(&device).map_or(0, HashMap::len)
    }
}
