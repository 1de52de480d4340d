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

use crate::error::ProfError;
use crate::hal::channel;
use crate::hal::ChannelId;

/// Accelerator index. Negative values are never valid.
pub type DeviceId = i32;

/// Reserved device id for host-side collection.
pub const HOST_DEVICE_ID: DeviceId = 64;

pub fn is_valid_device(device: DeviceId) -> bool {
    device >= 0
}

/// Sampling source of a collection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum JobKind {
    MemCtrl,
    Hbm,
    Llc,
    Pcie,
    Hccs,
    Nic,
    Roce,
    Dvpp,
    AiCoreSample,
    AiCoreTask,
    CtrlCpu,
    TsCpu,
    HwtsLog,
    TsTrack,
    AiCpu,
    HostCpu,
    HostMem,
    HostNetwork,
    HostSysCall,
}

impl JobKind {
    /// Every kind, in session start order.
    pub const ALL: [JobKind; 19] = [
        JobKind::MemCtrl,
        JobKind::Hbm,
        JobKind::Llc,
        JobKind::Pcie,
        JobKind::Hccs,
        JobKind::Nic,
        JobKind::Roce,
        JobKind::Dvpp,
        JobKind::AiCoreSample,
        JobKind::AiCoreTask,
        JobKind::CtrlCpu,
        JobKind::TsCpu,
        JobKind::HwtsLog,
        JobKind::TsTrack,
        JobKind::AiCpu,
        JobKind::HostCpu,
        JobKind::HostMem,
        JobKind::HostNetwork,
        JobKind::HostSysCall,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Kinds collected on the host rather than on an accelerator.
    pub fn is_host_kind(self) -> bool {
        matches!(
            self,
            JobKind::HostCpu | JobKind::HostMem | JobKind::HostNetwork | JobKind::HostSysCall
        )
    }

    /// Driver channel carrying the data of a device-side kind.
    pub fn channel(self) -> Option<ChannelId> {
        let c = match self {
            JobKind::MemCtrl => channel::DDR,
            JobKind::Hbm => channel::HBM,
            JobKind::Llc => channel::LLC,
            JobKind::Pcie => channel::PCIE,
            JobKind::Hccs => channel::HCCS,
            JobKind::Nic => channel::NIC,
            JobKind::Roce => channel::ROCE,
            JobKind::Dvpp => channel::DVPP,
            JobKind::AiCoreSample => channel::AI_CORE_SAMPLE,
            JobKind::AiCoreTask => channel::AI_CORE_TASK,
            JobKind::CtrlCpu => channel::CTRL_CPU,
            JobKind::TsCpu => channel::TS_CPU,
            JobKind::HwtsLog => channel::HWTS_LOG,
            JobKind::TsTrack => channel::TS_TRACK,
            JobKind::AiCpu => channel::AI_CPU,
            _ => return None,
        };
        Some(c)
    }

    /// Short name used in data file names.
    pub fn file_tag(self) -> &'static str {
        match self {
            JobKind::MemCtrl => "ddr",
            JobKind::Hbm => "hbm",
            JobKind::Llc => "llc",
            JobKind::Pcie => "pcie",
            JobKind::Hccs => "hccs",
            JobKind::Nic => "nic",
            JobKind::Roce => "roce",
            JobKind::Dvpp => "dvpp",
            JobKind::AiCoreSample => "aicore.sample",
            JobKind::AiCoreTask => "aicore.task",
            JobKind::CtrlCpu => "ctrlcpu",
            JobKind::TsCpu => "tscpu",
            JobKind::HwtsLog => "hwts",
            JobKind::TsTrack => "ts_track",
            JobKind::AiCpu => "aicpu",
            JobKind::HostCpu => "host_cpu",
            JobKind::HostMem => "host_mem",
            JobKind::HostNetwork => "host_network",
            JobKind::HostSysCall => "host_syscall",
        }
    }
}

impl TryFrom<u32> for JobKind {
    type Error = ProfError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        JobKind::ALL
            .get(raw as usize)
            .copied()
            .ok_or_else(|| ProfError::InvalidArgument(format!("job kind {} out of range", raw)))
    }
}

/// Key of a periodic handler on the polling scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerHandlerTag {
    HostCpu,
    HostMem,
    HostNetwork,
}

impl TimerHandlerTag {
    pub fn for_kind(kind: JobKind) -> Option<Self> {
        match kind {
            JobKind::HostCpu => Some(TimerHandlerTag::HostCpu),
            JobKind::HostMem => Some(TimerHandlerTag::HostMem),
            JobKind::HostNetwork => Some(TimerHandlerTag::HostNetwork),
            _ => None,
        }
    }
}
