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

//! Worker threads blocking on device event groups.
//!
//! A subscribing job owns an [`EventSubscriptionState`]; the worker thread only
//! reads and flips its atomic flags. Shutdown is cooperative: set `is_exit` and
//! join. Every wait is bounded by `event_wait_timeout`, so the flag is observed
//! within one timeout period.

use crate::channels::ChannelValidityCache;
use crate::config::Config;
use crate::error::{ProfError, ProfResult};
use crate::hal::{channel, ChannelId, DriverHal, DrvEvent, DrvStatus, EventGroupId};
use crate::kind::{DeviceId, JobKind};

use log::{debug, error, info, warn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Injected sleep, so bounded retry loops are testable without wall-clock
/// delay.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, dur: Duration);
}

#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, dur: Duration) {
        thread::sleep(dur);
    }
}

/// Called on the worker thread for every delivered event, after the flags of
/// the state were updated.
pub type EventCallback = Arc<dyn Fn(&EventSubscriptionState, DrvEvent) + Send + Sync>;

/// Cross-thread state shared by a subscribing job and its worker.
#[derive(Debug)]
pub struct EventSubscriptionState {
    pub device: DeviceId,
    pub channel: ChannelId,
    pub kind: JobKind,
    is_channel_valid: AtomicBool,
    is_process_run: AtomicBool,
    is_exit: AtomicBool,
    is_thread_start: AtomicBool,
    /// Companion pid, 0 until discovered.
    peer_pid: AtomicU32,
    worker: Mutex<Option<JoinHandle<ProfResult<()>>>>,
}

impl EventSubscriptionState {
    pub fn new(device: DeviceId, channel: ChannelId, kind: JobKind) -> Self {
        Self {
            device,
            channel,
            kind,
            is_channel_valid: AtomicBool::new(false),
            is_process_run: AtomicBool::new(false),
            is_exit: AtomicBool::new(false),
            is_thread_start: AtomicBool::new(false),
            peer_pid: AtomicU32::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn is_channel_valid(&self) -> bool {
        self.is_channel_valid.load(Ordering::Acquire)
    }

    pub fn set_channel_valid(&self, v: bool) {
        self.is_channel_valid.store(v, Ordering::Release);
    }

    pub fn is_process_run(&self) -> bool {
        self.is_process_run.load(Ordering::Acquire)
    }

    pub fn set_process_run(&self, v: bool) {
        self.is_process_run.store(v, Ordering::Release);
    }

    pub fn is_exit(&self) -> bool {
        self.is_exit.load(Ordering::Acquire)
    }

    pub fn request_exit(&self) {
        self.is_exit.store(true, Ordering::Release);
    }

    pub fn is_thread_start(&self) -> bool {
        self.is_thread_start.load(Ordering::Acquire)
    }

    pub fn peer_pid(&self) -> Option<u32> {
        match self.peer_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_peer_pid(&self, pid: u32) {
        self.peer_pid.store(pid, Ordering::Release);
    }
}

/// Event subscription front end shared by all subscribing jobs.
pub struct ProfDrvEvent {
    hal: Arc<dyn DriverHal>,
    channels: Arc<ChannelValidityCache>,
    sleeper: Arc<dyn Sleeper>,
    wait_timeout: Duration,
    pid_query_retries: usize,
    pid_query_interval: Duration,
    groups: Mutex<HashMap<(DeviceId, String), EventGroupId>>,
}

impl ProfDrvEvent {
    pub fn new(
        hal: Arc<dyn DriverHal>,
        channels: Arc<ChannelValidityCache>,
        sleeper: Arc<dyn Sleeper>,
        config: &Config,
    ) -> Self {
        Self {
            hal,
            channels,
            sleeper,
            wait_timeout: config.event_wait_timeout,
            pid_query_retries: config.pid_query_retries,
            pid_query_interval: config.pid_query_interval,
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn attach(&self, device: DeviceId, group_name: &str) -> ProfResult<EventGroupId> {
        let hal = &self.hal;
        let group = hal
            .create_event_group(device, group_name)
            .map_err(|e| ProfError::from_drv("create_event_group", e))?;
        hal.attach_event_group(device, group)
            .map_err(|e| ProfError::from_drv("attach_event_group", e))?;
        if let Err(e) = hal.subscribe_event(device, group) {
            let _ = hal.detach_event_group(device, group);
            return Err(ProfError::from_drv("subscribe_event", e));
        }
        Ok(group)
    }

    /// Attach to the device event group and spawn the worker thread. On
    /// failure nothing stays attached and no thread is left behind.
    pub fn subscribe_event_thread_init(
        self: &Arc<Self>,
        device: DeviceId,
        state: Arc<EventSubscriptionState>,
        group_name: &str,
        on_event: Option<EventCallback>,
    ) -> ProfResult<()> {
        let group = self.attach(device, group_name).map_err(|e| {
            error!(
                "Failed to attach event group {} on device {}: {}",
                group_name, device, e
            );
            e
        })?;
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((device, group_name.to_string()), group);

        let this = self.clone();
        let thread_state = state.clone();
        let spawned = thread::Builder::new()
            .name(format!("prof-event-{}-{}", device, state.channel))
            .spawn(move || this.event_thread_loop(&thread_state, group, on_event));
        match spawned {
            Ok(handle) => {
                *state.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                info!(
                    "Event worker started for device {} channel {}",
                    device, state.channel
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn event worker for device {}: {}", device, e);
                self.subscribe_event_thread_uninit(device, group_name);
                Err(ProfError::Io(e))
            }
        }
    }

    /// Detach from the event group. Safe if never attached.
    pub fn subscribe_event_thread_uninit(&self, device: DeviceId, group_name: &str) {
        let group = self
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(device, group_name.to_string()));
        if let Some(group) = group {
            if let Err(e) = self.hal.detach_event_group(device, group) {
                warn!(
                    "Failed to detach event group {} on device {}, code {}",
                    group_name, device, e.0
                );
            }
        }
    }

    /// Request exit and join the worker. Returns the worker's own result.
    pub fn stop_event_thread(&self, state: &EventSubscriptionState) -> ProfResult<()> {
        state.request_exit();
        let handle = state.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(h) => h
                .join()
                .unwrap_or_else(|_| Err(ProfError::InvalidState("event worker panicked".into()))),
            None => Ok(()),
        }
    }

    /// Wait for the companion process behind `state.channel` to show up.
    /// Only the AI-CPU channel has one; any other channel succeeds at once.
    pub fn query_dev_pid(&self, state: &EventSubscriptionState) -> ProfResult<()> {
        if state.channel != channel::AI_CPU {
            return Ok(());
        }
        for attempt in 0..self.pid_query_retries {
            if state.is_exit() {
                return Ok(());
            }
            match self.hal.query_device_pid(state.device, state.channel) {
                Ok(Some(pid)) => {
                    debug!(
                        "Device {} companion pid {} found after {} attempts",
                        state.device,
                        pid,
                        attempt + 1
                    );
                    state.set_peer_pid(pid);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => debug!("query_device_pid on device {}: code {}", state.device, e.0),
            }
            self.sleeper.sleep(self.pid_query_interval);
        }
        Err(ProfError::RetryBudgetExhausted {
            what: format!("companion pid on device {}", state.device),
            attempts: self.pid_query_retries as u32,
        })
    }

    fn event_thread_loop(
        &self,
        state: &EventSubscriptionState,
        group: EventGroupId,
        on_event: Option<EventCallback>,
    ) -> ProfResult<()> {
        state.is_thread_start.store(true, Ordering::Release);
        if let Err(e) = self.query_dev_pid(state) {
            error!("Channel {} permanently invalid: {}", state.channel, e);
            state.set_channel_valid(false);
            return Err(e);
        }

        let mut refreshed = false;
        while !state.is_exit() {
            match self.hal.wait_event(state.device, group, self.wait_timeout) {
                Ok(event) => {
                    self.handle_event(state, event, &mut refreshed);
                    if let Some(cb) = on_event.as_ref() {
                        cb(state, event);
                    }
                }
                Err(DrvStatus::WAIT_TIMEOUT) => {}
                Err(e) => {
                    debug!("wait_event on device {} failed, code {}", state.device, e.0);
                    // failures may return immediately; keep the loop bounded
                    self.sleeper.sleep(self.wait_timeout.min(self.pid_query_interval));
                }
            }
        }
        debug!("Event worker of device {} exits", state.device);
        Ok(())
    }

    fn handle_event(&self, state: &EventSubscriptionState, event: DrvEvent, refreshed: &mut bool) {
        match event {
            DrvEvent::PeerAttached { pid } => {
                if !*refreshed {
                    *refreshed = true;
                    if let Err(e) = self.channels.get_all_channels(state.device) {
                        warn!("Channel refresh of device {} failed: {}", state.device, e);
                    }
                }
                let valid = self.channels.channel_is_valid(state.device, state.channel);
                state.set_channel_valid(valid);
                state.set_peer_pid(pid);
                state.set_process_run(valid);
            }
            DrvEvent::PeerExited { .. } => {
                state.set_process_run(false);
            }
            DrvEvent::Other(code) => debug!("Ignoring event {} on device {}", code, state.device),
        }
    }
}
