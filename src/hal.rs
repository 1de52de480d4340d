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

//! Boundary to the accelerator driver.
//!
//! The collection core never touches registers or device files directly; every
//! hardware interaction goes through [`DriverHal`]. Calls return a raw
//! [`DrvStatus`] on failure, which callers turn into
//! [`crate::error::ProfError`] with [`crate::error::ProfError::from_drv`].

use crate::kind::DeviceId;

use std::time::Duration;

pub type ChannelId = u32;

/// Highest channel id the driver may report.
pub const MAX_CHANNEL_ID: ChannelId = 160;

pub mod channel {
    use super::ChannelId;

    pub const HBM: ChannelId = 1;
    pub const PCIE: ChannelId = 3;
    pub const NIC: ChannelId = 4;
    pub const DVPP: ChannelId = 6;
    pub const DDR: ChannelId = 7;
    pub const LLC: ChannelId = 8;
    pub const HCCS: ChannelId = 9;
    pub const TS_CPU: ChannelId = 10;
    pub const ROCE: ChannelId = 14;
    pub const CTRL_CPU: ChannelId = 41;
    pub const AI_CORE_SAMPLE: ChannelId = 43;
    pub const TS_TRACK: ChannelId = 44;
    pub const HWTS_LOG: ChannelId = 45;
    pub const AI_CORE_TASK: ChannelId = 85;
    pub const AI_CPU: ChannelId = 143;
}

/// Raw driver status code of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrvStatus(pub i32);

impl DrvStatus {
    pub const ERROR: DrvStatus = DrvStatus(-1);
    pub const NOT_SUPPORT: DrvStatus = DrvStatus(0xfffe);
    pub const CHANNEL_STOPPED: DrvStatus = DrvStatus(87);
    pub const WAIT_TIMEOUT: DrvStatus = DrvStatus(33);
    pub const INVALID_HANDLE: DrvStatus = DrvStatus(12);
}

pub type DrvResult<T> = Result<T, DrvStatus>;

/// Sampling configuration handed to the driver when a channel starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStartParams {
    /// Sampling period; its unit is channel specific (ms for peripherals,
    /// us for PMU sampling).
    pub sample_period: u32,
    pub events: Vec<String>,
    pub cores: Vec<u32>,
    /// Companion process the channel collects for, when known.
    pub target_pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPollEntry {
    pub device: DeviceId,
    pub channel: ChannelId,
}

pub type EventGroupId = u32;

/// Event delivered on a device event group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrvEvent {
    /// The companion process on the device side attached.
    PeerAttached { pid: u32 },
    /// The companion process exited.
    PeerExited { pid: u32 },
    Other(u32),
}

pub trait DriverHal: Send + Sync {
    fn start_channel(
        &self,
        device: DeviceId,
        channel: ChannelId,
        params: &ChannelStartParams,
    ) -> DrvResult<()>;

    fn stop_channel(&self, device: DeviceId, channel: ChannelId) -> DrvResult<()>;

    /// Read at most `buf.len()` bytes; `Ok(0)` when nothing is pending.
    fn read_channel(&self, device: DeviceId, channel: ChannelId, buf: &mut [u8])
        -> DrvResult<usize>;

    /// Wait up to `timeout` for any of `poll_set` to become readable and return
    /// at most `max` ready entries.
    fn poll_channels(
        &self,
        poll_set: &[ChannelPollEntry],
        max: usize,
        timeout: Duration,
    ) -> DrvResult<Vec<ChannelPollEntry>>;

    fn get_channel_list(&self, device: DeviceId) -> DrvResult<Vec<ChannelId>>;

    /// Capability probe for one channel on one device.
    fn channel_supported(&self, _device: DeviceId, _channel: ChannelId) -> DrvResult<()> {
        Ok(())
    }

    fn device_ids(&self) -> DrvResult<Vec<DeviceId>>;

    fn create_event_group(&self, device: DeviceId, name: &str) -> DrvResult<EventGroupId>;

    fn attach_event_group(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()>;

    fn subscribe_event(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()>;

    fn detach_event_group(&self, device: DeviceId, group: EventGroupId) -> DrvResult<()>;

    /// Bounded wait; [`DrvStatus::WAIT_TIMEOUT`] when nothing arrives in time.
    fn wait_event(
        &self,
        device: DeviceId,
        group: EventGroupId,
        timeout: Duration,
    ) -> DrvResult<DrvEvent>;

    /// Pid of the device-side companion process for `channel`, if it exists yet.
    fn query_device_pid(&self, device: DeviceId, channel: ChannelId) -> DrvResult<Option<u32>>;
}
