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

use crate::channel_poll::ChannelPoller;
use crate::channels::ChannelValidityCache;
use crate::config::Config;
use crate::drv_event::{ProfDrvEvent, ThreadSleeper};
use crate::error::{keep_first, ProfError, ProfResult};
use crate::hal::DriverHal;
use crate::job::JobDeps;
use crate::kind::DeviceId;
use crate::params::SessionParams;
use crate::process::ProcessRunner;
use crate::registry::CollectionRegistry;
use crate::session::{JobDeviceSoc, SessionReport};
use crate::timer::TimerManager;
use crate::uploader::Uploader;

use log::{info, warn};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type SessionMap = BTreeMap<DeviceId, Arc<Mutex<JobDeviceSoc>>>;

/// Owner of the shared collection machinery and of one session per device.
pub struct ProfAgent {
    deps: JobDeps,
    sessions: Mutex<SessionMap>,
}

impl ProfAgent {
    pub fn new(
        config: Config,
        hal: Arc<dyn DriverHal>,
        uploader: Arc<dyn Uploader>,
        runner: Arc<dyn ProcessRunner>,
    ) -> ProfResult<Self> {
        // the embedding process may have installed a logger already
        let _ = env_logger::try_init();
        info!("Starting profiling agent with {:?}", config);

        let channels = Arc::new(ChannelValidityCache::new(hal.clone()));
        let poller = Arc::new(ChannelPoller::new(hal.clone(), uploader.clone(), &config));
        let drv_event = Arc::new(ProfDrvEvent::new(
            hal.clone(),
            channels.clone(),
            Arc::new(ThreadSleeper),
            &config,
        ));
        poller.start()?;
        Ok(Self {
            deps: JobDeps {
                timer: Arc::new(TimerManager::new(config.timer_interval)),
                config: Arc::new(config),
                hal,
                uploader,
                runner,
                registry: Arc::new(CollectionRegistry::new()),
                channels,
                poller,
                drv_event,
            },
            sessions: Mutex::new(BTreeMap::new()),
        })
    }

    /// Agent configured from `PROF_AGENT_*` environment variables.
    pub fn from_env(
        hal: Arc<dyn DriverHal>,
        uploader: Arc<dyn Uploader>,
        runner: Arc<dyn ProcessRunner>,
    ) -> ProfResult<Self> {
        Self::new(Config::from_env(), hal, uploader, runner)
    }

    fn sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.deps.registry
    }

    /// Devices the driver reports.
    pub fn devices(&self) -> ProfResult<Vec<DeviceId>> {
        self.deps
            .hal
            .device_ids()
            .map_err(|e| ProfError::from_drv("device_ids", e))
    }

    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.sessions().keys().copied().collect()
    }

    pub fn start_session(
        &self,
        device: DeviceId,
        params: SessionParams,
    ) -> ProfResult<SessionReport> {
        let soc = {
            let mut sessions = self.sessions();
            if sessions.contains_key(&device) {
                return Err(ProfError::InvalidState(format!(
                    "device {} already has a session",
                    device
                )));
            }
            let soc = Arc::new(Mutex::new(JobDeviceSoc::new(device, self.deps.clone())));
            sessions.insert(device, soc.clone());
            soc
        };
        let started = soc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start(Arc::new(params));
        if started.is_err() {
            self.sessions().remove(&device);
        }
        started
    }

    pub fn stop_session(&self, device: DeviceId) -> ProfResult<()> {
        let soc = self.sessions().remove(&device);
        let Some(soc) = soc else {
            return Err(ProfError::InvalidState(format!(
                "device {} has no session",
                device
            )));
        };
        let result = soc.lock().unwrap_or_else(|e| e.into_inner()).stop();
        result
    }

    /// Stop every session, then the poll thread.
    pub fn shutdown(&self) -> ProfResult<()> {
        let devices = self.active_devices();
        let mut result = Ok(());
        for device in devices {
            if let Err(e) = self.stop_session(device) {
                warn!("Stopping session of device {} failed: {}", device, e);
                keep_first(&mut result, Err(e));
            }
        }
        self.deps.poller.stop();
        result
    }
}

impl std::ops::Drop for ProfAgent {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Agent shutdown incomplete: {}", e);
        }
    }
}
