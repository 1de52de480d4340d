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

//! Collection core of an accelerator profiling agent.
//!
//! A [`ProfAgent`] owns one [`JobDeviceSoc`] session per device. Each session
//! builds one [`CollectionJob`] per enabled [`JobKind`] and runs it through
//! the shared [`CollectionRegistry`], which keeps at most one job per
//! (device, kind) and one global job per kind across all devices.

pub mod agent;
pub mod channel_job;
pub mod channel_poll;
pub mod channels;
pub mod config;
pub mod drv_event;
pub mod error;
pub mod hal;
pub mod host_job;
pub mod job;
pub mod kind;
pub mod params;
pub mod process;
pub mod registry;
pub mod session;
pub mod timer;
pub mod uploader;

#[cfg(test)]
mod mock_hal;

pub use agent::ProfAgent;
pub use config::Config;
pub use error::{ProfError, ProfResult};
pub use hal::{DriverHal, DrvStatus};
pub use job::{CollectionJob, CollectionJobConfig};
pub use kind::{DeviceId, JobKind, HOST_DEVICE_ID};
pub use params::SessionParams;
pub use process::{ProcessRunner, SystemProcessRunner};
pub use registry::CollectionRegistry;
pub use session::{JobDeviceSoc, SessionReport};
pub use timer::{TimerHandler, TimerManager};
pub use uploader::{FileUploader, Uploader};
