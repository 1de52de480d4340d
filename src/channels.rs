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

use crate::error::{ProfError, ProfResult};
use crate::hal::{ChannelId, DriverHal, MAX_CHANNEL_ID};
use crate::kind::DeviceId;

use log::{error, warn};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-device list of channels the driver exposes.
///
/// Refreshed once per session; a channel missing here means the jobs reading
/// it silently do nothing.
pub struct ChannelValidityCache {
    hal: Arc<dyn DriverHal>,
    channels: Mutex<HashMap<DeviceId, Vec<ChannelId>>>,
}

impl std::fmt::Debug for ChannelValidityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelValidityCache")
            .field("channels", &self.channels)
            .finish()
    }
}

impl ChannelValidityCache {
    pub fn new(hal: Arc<dyn DriverHal>) -> Self {
        Self {
            hal,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Query the driver and replace the cached list of `device`. Returns the
    /// number of valid channels kept.
    pub fn get_all_channels(&self, device: DeviceId) -> ProfResult<usize> {
        let raw = self.hal.get_channel_list(device).map_err(|e| {
            error!("Failed to get channel list of device {}, code {}", device, e.0);
            ProfError::from_drv("get_channel_list", e)
        })?;
        if raw.is_empty() || raw.len() > MAX_CHANNEL_ID as usize {
            error!(
                "Device {} reported {} channels, expected 1..={}",
                device,
                raw.len(),
                MAX_CHANNEL_ID
            );
            return Err(ProfError::InvalidChannelList(raw.len()));
        }

        let mut valid = Vec::with_capacity(raw.len());
        for c in raw {
            if c == 0 || c > MAX_CHANNEL_ID {
                warn!("Skip invalid channel id {} on device {}", c, device);
                continue;
            }
            valid.push(c);
        }
        let n = valid.len();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device, valid);
        Ok(n)
    }

    pub fn channel_is_valid(&self, device: DeviceId, channel: ChannelId) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device)
            .is_some_and(|list| list.iter().any(|c| *c == channel))
    }

    pub fn channel_count(&self, device: DeviceId) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device)
            .map_or(0, Vec::len)
    }

    pub fn clear_device(&self, device: DeviceId) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&device);
    }
}
