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

//! Jobs sampling a device-side driver channel.

use crate::channel_poll::{ChannelPoller, ChannelReaderKey};
use crate::drv_event::{EventCallback, EventSubscriptionState};
use crate::error::{keep_first, ProfError, ProfResult};
use crate::hal::{ChannelId, ChannelStartParams, DriverHal, DrvEvent};
use crate::job::{
    check_device_side, join_events, CollectionJob, CollectionJobConfig, JobDeps, JobLifecycle,
};
use crate::kind::{DeviceId, JobKind};
use crate::params::{JobContext, SessionParams};

use log::{debug, error, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event group the AI-CPU job listens on.
pub const AI_CPU_EVENT_GROUP: &str = "prof_aicpu";

/// A started (or startable) driver channel plus its poll reader.
///
/// `start` is guarded so the job thread and an event worker may both call it.
pub struct ChannelSession {
    hal: Arc<dyn DriverHal>,
    poller: Arc<ChannelPoller>,
    device: DeviceId,
    channel: ChannelId,
    kind: JobKind,
    params: ChannelStartParams,
    reader: ChannelReaderKey,
    ctx: Arc<JobContext>,
    started: AtomicBool,
}

impl ChannelSession {
    fn new(deps: &JobDeps, channel: ChannelId, cfg: &CollectionJobConfig) -> Self {
        let file = cfg.file_desc(&format!("{}.data.%d.slice_0", cfg.kind.file_tag()));
        Self {
            hal: deps.hal.clone(),
            poller: deps.poller.clone(),
            device: cfg.device,
            channel,
            kind: cfg.kind,
            params: ChannelStartParams {
                sample_period: cfg.params.interval(cfg.kind),
                events: cfg.events.clone().unwrap_or_default(),
                cores: cfg.cores.clone().unwrap_or_default(),
                target_pid: None,
            },
            reader: ChannelReaderKey {
                job_id: cfg.ctx.job_id.clone(),
                device: cfg.device,
                channel,
                file,
            },
            ctx: cfg.ctx.clone(),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the channel unless already started. Returns whether this call
    /// started it.
    pub fn start(&self, target_pid: Option<u32>) -> ProfResult<bool> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let mut params = self.params.clone();
        params.target_pid = target_pid;
        if let Err(e) = self.hal.start_channel(self.device, self.channel, &params) {
            self.started.store(false, Ordering::Release);
            error!(
                "Failed to start channel {} of {:?} on device {}, code {}",
                self.channel, self.kind, self.device, e.0
            );
            return Err(ProfError::from_drv("start_channel", e));
        }
        self.poller
            .register_reader(self.reader.clone(), self.ctx.clone());
        info!(
            "Started channel {} of {:?} on device {}, events [{}]",
            self.channel,
            self.kind,
            self.device,
            join_events(&params.events)
        );
        Ok(true)
    }

    /// Stop the channel and drain its reader. Every step runs; the first
    /// failure is returned.
    pub fn stop(&self) -> ProfResult<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());
        let stopped = match self.hal.stop_channel(self.device, self.channel) {
            Err(e) => Err(ProfError::from_drv("stop_channel", e)),
            Ok(()) => Ok(()),
        };
        match stopped {
            Err(ProfError::AlreadyStopped) => {
                debug!("Channel {} on device {} already stopped", self.channel, self.device)
            }
            other => keep_first(&mut result, other),
        }
        if !self.poller.remove_reader(self.device, self.channel) {
            warn!(
                "No poll reader for channel {} on device {}",
                self.channel, self.device
            );
        }
        result
    }
}

/// Init checks shared by the channel jobs. `None` means the channel is not
/// exposed on this device and the job skips silently.
fn channel_session(
    deps: &JobDeps,
    cfg: &CollectionJobConfig,
    require_valid: bool,
) -> ProfResult<Option<Arc<ChannelSession>>> {
    let kind = cfg.kind;
    check_device_side(kind, cfg.device)?;
    if !cfg.params.enabled(kind) {
        return Err(ProfError::Disabled(format!("{:?} switched off", kind)));
    }
    let channel = kind
        .channel()
        .ok_or_else(|| ProfError::InvalidArgument(format!("{:?} has no channel", kind)))?;
    if SessionParams::requires_events(kind) && cfg.events.as_ref().map_or(true, Vec::is_empty) {
        return Err(ProfError::Disabled(format!("{:?} has no events", kind)));
    }
    if let Err(e) = deps.hal.channel_supported(cfg.device, channel) {
        let e = ProfError::from_drv("channel_supported", e);
        warn!("{:?} on device {}: {}", kind, cfg.device, e);
        return Err(e);
    }
    if require_valid && !deps.channels.channel_is_valid(cfg.device, channel) {
        debug!(
            "Channel {} of {:?} not exposed on device {}, skipping",
            channel, kind, cfg.device
        );
        return Ok(None);
    }
    Ok(Some(Arc::new(ChannelSession::new(deps, channel, cfg))))
}

/// Device PMU, peripheral and log channels.
pub struct ChannelJob {
    deps: JobDeps,
    lifecycle: JobLifecycle,
    session: Option<Arc<ChannelSession>>,
}

impl ChannelJob {
    pub fn new(deps: &JobDeps) -> Self {
        Self {
            deps: deps.clone(),
            lifecycle: JobLifecycle::default(),
            session: None,
        }
    }

    pub fn boxed(deps: &JobDeps, _kind: JobKind) -> Box<dyn CollectionJob> {
        Box::new(Self::new(deps))
    }
}

impl CollectionJob for ChannelJob {
    fn init(&mut self, cfg: Arc<CollectionJobConfig>) -> ProfResult<()> {
        let deps = &self.deps;
        self.session = self.lifecycle.init(|| channel_session(deps, &cfg, true))?;
        Ok(())
    }

    fn process(&mut self) -> ProfResult<()> {
        let session = self.session.clone();
        self.lifecycle.process(|| match session {
            Some(s) => s.start(None).map(|_| ()),
            None => Ok(()),
        })
    }

    fn uninit(&mut self) -> ProfResult<()> {
        let session = self.session.take();
        self.lifecycle.uninit(|_| match session {
            Some(s) => s.stop(),
            None => Ok(()),
        })
    }
}

/// AI-CPU channel: only readable while the companion process runs on the
/// device, which an event worker watches for.
pub struct EventChannelJob {
    deps: JobDeps,
    lifecycle: JobLifecycle,
    session: Option<Arc<ChannelSession>>,
    state: Option<Arc<EventSubscriptionState>>,
}

impl EventChannelJob {
    pub fn new(deps: &JobDeps) -> Self {
        Self {
            deps: deps.clone(),
            lifecycle: JobLifecycle::default(),
            session: None,
            state: None,
        }
    }

    pub fn boxed(deps: &JobDeps, _kind: JobKind) -> Box<dyn CollectionJob> {
        Box::new(Self::new(deps))
    }

    fn subscribe(
        deps: &JobDeps,
        cfg: &CollectionJobConfig,
    ) -> ProfResult<(Arc<ChannelSession>, Arc<EventSubscriptionState>)> {
        let session = channel_session(deps, cfg, false)?
            .ok_or_else(|| ProfError::InvalidState("no channel session".into()))?;
        let state = Arc::new(EventSubscriptionState::new(
            cfg.device,
            session.channel,
            cfg.kind,
        ));
        state.set_channel_valid(deps.channels.channel_is_valid(cfg.device, session.channel));

        let cb_session = session.clone();
        let on_event: EventCallback = Arc::new(move |st: &EventSubscriptionState, event: DrvEvent| {
            if let DrvEvent::PeerAttached { .. } = event {
                if st.is_process_run() {
                    if let Err(e) = cb_session.start(st.peer_pid()) {
                        error!("Channel start on attach failed: {}", e);
                    }
                }
            }
        });
        deps.drv_event.subscribe_event_thread_init(
            cfg.device,
            state.clone(),
            AI_CPU_EVENT_GROUP,
            Some(on_event),
        )?;
        Ok((session, state))
    }
}

impl CollectionJob for EventChannelJob {
    fn init(&mut self, cfg: Arc<CollectionJobConfig>) -> ProfResult<()> {
        let deps = &self.deps;
        let (session, state) = self.lifecycle.init(|| Self::subscribe(deps, &cfg))?;
        self.session = Some(session);
        self.state = Some(state);
        Ok(())
    }

    fn process(&mut self) -> ProfResult<()> {
        let session = self.session.clone();
        let state = self.state.clone();
        self.lifecycle.process(|| match (session, state) {
            (Some(session), Some(state)) if state.is_channel_valid() => {
                session.start(state.peer_pid()).map(|_| ())
            }
            _ => {
                debug!("AI-CPU channel not valid yet, waiting for the companion process");
                Ok(())
            }
        })
    }

    fn uninit(&mut self) -> ProfResult<()> {
        let session = self.session.take();
        let state = self.state.take();
        let drv_event = self.deps.drv_event.clone();
        self.lifecycle.uninit(|_| {
            let mut result = Ok(());
            if let Some(state) = state {
                // worker first, so it cannot restart the channel below
                if let Err(e) = drv_event.stop_event_thread(&state) {
                    warn!("Event worker of device {} ended with: {}", state.device, e);
                }
                drv_event.subscribe_event_thread_uninit(state.device, AI_CPU_EVENT_GROUP);
            }
            if let Some(session) = session {
                keep_first(&mut result, session.stop());
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{channel, DrvStatus};
    use crate::mock_hal::{fast_config, test_deps, wait_until, HalCall, TestDeps};

    use std::path::Path;

    fn config_for(
        kind: JobKind,
        device: DeviceId,
        params: SessionParams,
        dir: &Path,
    ) -> Arc<CollectionJobConfig> {
        Arc::new(CollectionJobConfig::new(
            device,
            kind,
            Arc::new(params),
            Arc::new(JobContext::new("7", device)),
            dir.to_path_buf(),
        ))
    }

    fn mem_ctrl_params() -> SessionParams {
        SessionParams {
            job_id: "7".into(),
            mem_ctrl_profiling: true,
            mem_ctrl_interval: 100,
            mem_ctrl_events: Some("read,write".into()),
            ..SessionParams::default()
        }
    }

    fn with_cache(t: &TestDeps, device: DeviceId) {
        t.deps.channels.get_all_channels(device).unwrap();
    }

    #[test]
    fn channel_job_starts_and_stops() {
        let t = test_deps(fast_config());
        with_cache(&t, 0);
        let dir = tempfile::tempdir().unwrap();
        let mut job = ChannelJob::new(&t.deps);
        job.init(config_for(JobKind::MemCtrl, 0, mem_ctrl_params(), dir.path()))
            .unwrap();
        job.process().unwrap();
        // second process is a silent no-op
        job.process().unwrap();
        assert_eq!(t.hal.count(&HalCall::Start(0, channel::DDR)), 1);
        assert!(t.deps.poller.has_reader(0, channel::DDR));

        let params = t.hal.started_params.lock().unwrap()[&(0, channel::DDR)].clone();
        assert_eq!(params.sample_period, 100);
        assert_eq!(params.events, vec!["read".to_string(), "write".to_string()]);

        job.uninit().unwrap();
        job.uninit().unwrap();
        assert_eq!(t.hal.count(&HalCall::Stop(0, channel::DDR)), 1);
        assert!(!t.deps.poller.has_reader(0, channel::DDR));
    }

    #[test]
    fn channel_job_init_rejections() {
        let t = test_deps(fast_config());
        with_cache(&t, 0);
        let dir = tempfile::tempdir().unwrap();

        let mut job = ChannelJob::new(&t.deps);
        assert!(matches!(
            job.init(config_for(JobKind::Hbm, 0, mem_ctrl_params(), dir.path())),
            Err(ProfError::Disabled(_))
        ));
        // init failed: process refused, uninit harmless
        assert!(job.process().is_err());
        job.uninit().unwrap();

        let params = SessionParams {
            ai_core_sampling: true,
            ai_core_sampling_interval: 10,
            ..SessionParams::default()
        };
        let mut job = ChannelJob::new(&t.deps);
        assert!(matches!(
            job.init(config_for(JobKind::AiCoreSample, 0, params, dir.path())),
            Err(ProfError::Disabled(_))
        ));

        let mut job = ChannelJob::new(&t.deps);
        assert!(job
            .init(config_for(
                JobKind::MemCtrl,
                crate::kind::HOST_DEVICE_ID,
                mem_ctrl_params(),
                dir.path()
            ))
            .is_err());

        t.hal.unsupported.lock().unwrap().insert(channel::DDR);
        let mut job = ChannelJob::new(&t.deps);
        assert!(matches!(
            job.init(config_for(JobKind::MemCtrl, 0, mem_ctrl_params(), dir.path())),
            Err(ProfError::CapabilityUnsupported(_))
        ));
        assert!(t.hal.calls().iter().all(|c| !matches!(c, HalCall::Start(..))));
    }

    #[test]
    fn missing_channel_is_silently_skipped() {
        let t = test_deps(fast_config());
        *t.hal.channel_list.lock().unwrap() = Some(Ok(vec![channel::HBM]));
        with_cache(&t, 0);
        let dir = tempfile::tempdir().unwrap();
        let mut job = ChannelJob::new(&t.deps);
        job.init(config_for(JobKind::MemCtrl, 0, mem_ctrl_params(), dir.path()))
            .unwrap();
        job.process().unwrap();
        job.uninit().unwrap();
        assert!(t
            .hal
            .calls()
            .iter()
            .all(|c| !matches!(c, HalCall::Start(..) | HalCall::Stop(..))));
    }

    #[test]
    fn failed_start_is_retryable_and_cleans_up() {
        let t = test_deps(fast_config());
        with_cache(&t, 0);
        let dir = tempfile::tempdir().unwrap();
        *t.hal.start_result.lock().unwrap() = Err(DrvStatus(3));
        let mut job = ChannelJob::new(&t.deps);
        job.init(config_for(JobKind::MemCtrl, 0, mem_ctrl_params(), dir.path()))
            .unwrap();
        assert!(matches!(
            job.process(),
            Err(ProfError::HalFailure { code: 3, .. })
        ));
        assert!(!t.deps.poller.has_reader(0, channel::DDR));

        *t.hal.start_result.lock().unwrap() = Ok(());
        job.process().unwrap();
        assert_eq!(t.hal.count(&HalCall::Start(0, channel::DDR)), 2);

        *t.hal.stop_result.lock().unwrap() = Err(DrvStatus(4));
        assert!(job.uninit().is_err());
        // reader released even though stop failed
        assert!(!t.deps.poller.has_reader(0, channel::DDR));
    }

    #[test]
    fn already_stopped_channel_is_not_an_error() {
        let t = test_deps(fast_config());
        with_cache(&t, 1);
        let dir = tempfile::tempdir().unwrap();
        *t.hal.stop_result.lock().unwrap() = Err(DrvStatus::CHANNEL_STOPPED);
        let mut job = ChannelJob::new(&t.deps);
        job.init(config_for(JobKind::MemCtrl, 1, mem_ctrl_params(), dir.path()))
            .unwrap();
        job.process().unwrap();
        job.uninit().unwrap();
    }

    fn ai_cpu_params() -> SessionParams {
        SessionParams {
            job_id: "7".into(),
            ai_cpu_profiling: true,
            ..SessionParams::default()
        }
    }

    #[test]
    fn ai_cpu_starts_when_companion_attaches() {
        let t = test_deps(fast_config());
        *t.hal.channel_list.lock().unwrap() = Some(Ok(vec![channel::HBM]));
        with_cache(&t, 0);
        let dir = tempfile::tempdir().unwrap();

        let mut job = EventChannelJob::new(&t.deps);
        job.init(config_for(JobKind::AiCpu, 0, ai_cpu_params(), dir.path()))
            .unwrap();
        // not exposed yet
        job.process().unwrap();
        assert_eq!(t.hal.count(&HalCall::Start(0, channel::AI_CPU)), 0);

        *t.hal.channel_list.lock().unwrap() = Some(Ok(vec![channel::HBM, channel::AI_CPU]));
        t.hal.push_event(Ok(DrvEvent::PeerAttached { pid: 31 }));
        assert!(wait_until(|| t.hal.count(&HalCall::Start(0, channel::AI_CPU)) == 1));
        let params = t.hal.started_params.lock().unwrap()[&(0, channel::AI_CPU)].clone();
        assert_eq!(params.target_pid, Some(31));

        job.uninit().unwrap();
        assert_eq!(t.hal.count(&HalCall::Stop(0, channel::AI_CPU)), 1);
        assert!(t.hal.calls().iter().any(|c| matches!(c, HalCall::Detach(0, _))));
    }

    #[test]
    fn ai_cpu_valid_channel_starts_on_process() {
        let t = test_deps(fast_config());
        with_cache(&t, 2);
        let dir = tempfile::tempdir().unwrap();
        let mut job = EventChannelJob::new(&t.deps);
        job.init(config_for(JobKind::AiCpu, 2, ai_cpu_params(), dir.path()))
            .unwrap();
        job.process().unwrap();
        assert_eq!(t.hal.count(&HalCall::Start(2, channel::AI_CPU)), 1);
        job.uninit().unwrap();
        assert_eq!(t.hal.count(&HalCall::Stop(2, channel::AI_CPU)), 1);
    }

    #[test]
    fn ai_cpu_failed_subscription_fails_init() {
        let t = test_deps(fast_config());
        *t.hal.attach_result.lock().unwrap() = Err(DrvStatus(8));
        let dir = tempfile::tempdir().unwrap();
        let mut job = EventChannelJob::new(&t.deps);
        assert!(job
            .init(config_for(JobKind::AiCpu, 0, ai_cpu_params(), dir.path()))
            .is_err());
        job.uninit().unwrap();
        assert!(t.hal.calls().iter().all(|c| !matches!(c, HalCall::Stop(..))));
    }
}
