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

//! Recording test doubles for the external collaborators.

use crate::channel_poll::ChannelPoller;
use crate::channels::ChannelValidityCache;
use crate::config::Config;
use crate::drv_event::{ProfDrvEvent, ThreadSleeper};
use crate::error::{ProfError, ProfResult};
use crate::hal::*;
use crate::job::JobDeps;
use crate::kind::DeviceId;
use crate::params::JobContext;
use crate::process::{Pid, ProcessRunner};
use crate::registry::CollectionRegistry;
use crate::timer::TimerManager;
use crate::uploader::{FileChunkDesc, Uploader};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalCall {
    Start(DeviceId, ChannelId),
    Stop(DeviceId, ChannelId),
    GetChannelList(DeviceId),
    CreateGroup(DeviceId, String),
    Attach(DeviceId, EventGroupId),
    Subscribe(DeviceId, EventGroupId),
    Detach(DeviceId, EventGroupId),
    QueryPid(DeviceId, ChannelId),
}

pub const ALL_CHANNELS: &[ChannelId] = &[
    channel::HBM,
    channel::PCIE,
    channel::NIC,
    channel::DVPP,
    channel::DDR,
    channel::LLC,
    channel::HCCS,
    channel::TS_CPU,
    channel::ROCE,
    channel::CTRL_CPU,
    channel::AI_CORE_SAMPLE,
    channel::TS_TRACK,
    channel::HWTS_LOG,
    channel::AI_CORE_TASK,
    channel::AI_CPU,
];

/// Driver double that succeeds unless told otherwise and records every call.
#[derive(Debug)]
pub struct MockHal {
    pub calls: Mutex<Vec<HalCall>>,
    pub channel_list: Mutex<Option<DrvResult<Vec<ChannelId>>>>,
    pub start_result: Mutex<DrvResult<()>>,
    pub stop_result: Mutex<DrvResult<()>>,
    pub attach_result: Mutex<DrvResult<()>>,
    pub unsupported: Mutex<HashSet<ChannelId>>,
    pub events: Mutex<VecDeque<DrvResult<DrvEvent>>>,
    pub pid_answers: Mutex<VecDeque<DrvResult<Option<u32>>>>,
    pub default_pid: Mutex<Option<u32>>,
    pub data: Mutex<HashMap<(DeviceId, ChannelId), VecDeque<DrvResult<Vec<u8>>>>>,
    pub started_params: Mutex<HashMap<(DeviceId, ChannelId), ChannelStartParams>>,
    next_group: Mutex<EventGroupId>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            channel_list: Mutex::new(None),
            start_result: Mutex::new(Ok(())),
            stop_result: Mutex::new(Ok(())),
            attach_result: Mutex::new(Ok(())),
            unsupported: Mutex::new(HashSet::new()),
            events: Mutex::new(VecDeque::new()),
            pid_answers: Mutex::new(VecDeque::new()),
            default_pid: Mutex::new(Some(4242)),
            data: Mutex::new(HashMap::new()),
            started_params: Mutex::new(HashMap::new()),
            next_group: Mutex::new(1),
        }
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: HalCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<HalCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &HalCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn push_data(&self, device: DeviceId, channel: ChannelId, chunk: DrvResult<Vec<u8>>) {
        self.data
            .lock()
            .unwrap()
            .entry((device, channel))
            .or_default()
            .push_back(chunk);
    }

    pub fn push_event(&self, event: DrvResult<DrvEvent>) {
        self.events.lock().unwrap().push_back(event);
    }
}

impl DriverHal for MockHal {
    fn start_channel(
        &self,
        device: DeviceId,
        channel: ChannelId,
        params: &ChannelStartParams,
    ) -> DrvResult<()> {
        self.record(HalCall::Start(device, channel));
        self.started_params
            .lock()
            .unwrap()
            .insert((device, channel), params.clone());
        *self.start_result.lock().unwrap()
    }

    fn stop_channel(&self, device: DeviceId, channel: ChannelId) -> DrvResult<()> {
        self.record(HalCall::Stop(device, channel));
        *self.stop_result.lock().unwrap()
    }

    fn read_channel(
        &self,
        device: DeviceId,
        channel: ChannelId,
        buf: &mut [u8],
    ) -> DrvResult<usize> {
        let mut data = self.data.lock().unwrap();
        match data.get_mut(&(device, channel)).and_then(|q| q.pop_front()) {
            Some(Ok(chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    fn poll_channels(
        &self,
        poll_set: &[ChannelPollEntry],
        max: usize,
        timeout: Duration,
    ) -> DrvResult<Vec<ChannelPollEntry>> {
        let ready: Vec<ChannelPollEntry> = {
            let data = self.data.lock().unwrap();
            poll_set
                .iter()
                .filter(|e| {
                    data.get(&(e.device, e.channel))
                        .is_some_and(|q| !q.is_empty())
                })
                .take(max)
                .copied()
                .collect()
        };
        if ready.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(ready)
    }

    fn get_channel_list(&self, device: DeviceId) -> DrvResult<Vec<ChannelId>> {
        self.record(HalCall::GetChannelList(device));
        self.channel_list
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(ALL_CHANNELS.to_vec()))
    }

    fn channel_supported(&self, _device: DeviceId, channel: ChannelId) -> DrvResult<()> {
        if self.unsupported.lock().unwrap().contains(&channel) {
            Err(DrvStatus::NOT_SUPPORT)
        } else {
            Ok(())
        }
    }

    fn device_ids(&self) -> DrvResult<Vec<DeviceId>> {
        Ok(vec![0, 1])
    }

    fn create_event_group(&self, device: DeviceId, name: &str) -> DrvResult<EventGroupId> {
        self.record(HalCall::CreateGroup(device, name.to_string()));
        let mut g = self.next_group.lock().unwrap();
        *g += 1;
        Ok(*g)
    }

    fn attach_event_group(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()> {
        self.record(HalCall::Attach(device, group));
        *self.attach_result.lock().unwrap()
    }

    fn subscribe_event(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()> {
        self.record(HalCall::Subscribe(device, group));
        Ok(())
    }

    fn detach_event_group(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()> {
        self.record(HalCall::Detach(device, group));
        Ok(())
    }

    fn wait_event(
        &self,
        _device: DeviceId,
        _group: EventGroupId,
        _timeout: Duration,
    ) -> DrvResult<DrvEvent> {
        let next = self.events.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Err(DrvStatus::WAIT_TIMEOUT)
            }
        }
    }

    fn query_device_pid(&self, device: DeviceId, channel: ChannelId) -> DrvResult<Option<u32>> {
        self.record(HalCall::QueryPid(device, channel));
        let next = self.pid_answers.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(*self.default_pid.lock().unwrap()))
    }
}

#[derive(Debug, Default)]
pub struct MockUploader {
    pub chunks: Mutex<Vec<(String, Vec<u8>, FileChunkDesc)>>,
    pub fail: Mutex<bool>,
    pub closed: Mutex<Vec<PathBuf>>,
}

impl MockUploader {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p, _)| p.clone())
            .collect()
    }
}

impl Uploader for MockUploader {
    fn upload_file_data(
        &self,
        job_id: &str,
        payload: &[u8],
        file: &FileChunkDesc,
        _ctx: &JobContext,
    ) -> ProfResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(ProfError::InvalidState("uploader down".into()));
        }
        self.chunks
            .lock()
            .unwrap()
            .push((job_id.to_string(), payload.to_vec(), file.clone()));
        Ok(())
    }

    fn close_dir(&self, dir: &Path) {
        self.closed.lock().unwrap().push(dir.to_path_buf());
    }
}

#[derive(Debug, Default)]
pub struct MockRunner {
    pub spawned: Mutex<Vec<(String, Vec<String>)>>,
    pub alive: Mutex<HashSet<Pid>>,
    pub killed: Mutex<Vec<Pid>>,
    pub terminated: Mutex<Vec<Pid>>,
    pub spawn_fails: Mutex<bool>,
    // SIGINT is recorded but the process keeps running
    pub ignore_interrupt: Mutex<bool>,
}

impl ProcessRunner for MockRunner {
    fn spawn(&self, cmd: &str, args: &[String]) -> ProfResult<Pid> {
        if *self.spawn_fails.lock().unwrap() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        let mut spawned = self.spawned.lock().unwrap();
        spawned.push((cmd.to_string(), args.to_vec()));
        let pid = 1000 + spawned.len() as Pid;
        self.alive.lock().unwrap().insert(pid);
        Ok(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn wait(&self, pid: Pid) -> ProfResult<Option<i32>> {
        self.alive.lock().unwrap().remove(&pid);
        Ok(Some(0))
    }

    fn kill(&self, pid: Pid) -> ProfResult<()> {
        self.killed.lock().unwrap().push(pid);
        if !*self.ignore_interrupt.lock().unwrap() {
            self.alive.lock().unwrap().remove(&pid);
        }
        Ok(())
    }

    fn terminate(&self, pid: Pid) -> ProfResult<()> {
        self.terminated.lock().unwrap().push(pid);
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }
}

/// Config with every wait shortened for tests.
pub fn fast_config() -> Config {
    Config {
        timer_interval: Duration::from_millis(1),
        event_wait_timeout: Duration::from_millis(5),
        pid_query_retries: 3,
        pid_query_interval: Duration::from_millis(1),
        channel_poll_timeout: Duration::from_millis(2),
        channel_read_buf_size: 64,
        flush_max_reads: 8,
        tool_stop_timeout: Duration::from_millis(20),
        ..Config::default()
    }
}

/// Job collaborators wired to the doubles above.
pub struct TestDeps {
    pub deps: JobDeps,
    pub hal: Arc<MockHal>,
    pub uploader: Arc<MockUploader>,
    pub runner: Arc<MockRunner>,
}

pub fn test_deps(config: Config) -> TestDeps {
    let hal = Arc::new(MockHal::new());
    let uploader = Arc::new(MockUploader::default());
    let runner = Arc::new(MockRunner::default());
    let channels = Arc::new(ChannelValidityCache::new(hal.clone()));
    let poller = Arc::new(ChannelPoller::new(hal.clone(), uploader.clone(), &config));
    let drv_event = Arc::new(ProfDrvEvent::new(
        hal.clone(),
        channels.clone(),
        Arc::new(ThreadSleeper),
        &config,
    ));
    let deps = JobDeps {
        timer: Arc::new(TimerManager::new(config.timer_interval)),
        config: Arc::new(config),
        hal: hal.clone(),
        uploader: uploader.clone(),
        runner: runner.clone(),
        registry: Arc::new(CollectionRegistry::new()),
        channels,
        poller,
        drv_event,
    };
    TestDeps {
        deps,
        hal,
        uploader,
        runner,
    }
}

pub fn wait_until<F: Fn() -> bool>(f: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
