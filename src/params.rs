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
use crate::kind::{DeviceId, JobKind};

use serde::Deserialize;

use std::path::PathBuf;

/// Session-wide switches and sampling intervals, parsed upstream.
///
/// Event lists are comma separated strings as the operator typed them; see
/// [`split_events`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    pub job_id: String,
    pub result_dir: PathBuf,

    // Peripherals, intervals in ms
    pub mem_ctrl_profiling: bool,
    pub mem_ctrl_interval: u32,
    pub mem_ctrl_events: Option<String>,
    pub hbm_profiling: bool,
    pub hbm_interval: u32,
    pub hbm_events: Option<String>,
    pub llc_profiling: bool,
    pub llc_interval: u32,
    pub llc_events: Option<String>,
    pub pcie_profiling: bool,
    pub pcie_interval: u32,
    pub hccs_profiling: bool,
    pub hccs_interval: u32,
    pub nic_profiling: bool,
    pub nic_interval: u32,
    pub roce_profiling: bool,
    pub roce_interval: u32,
    pub dvpp_profiling: bool,
    pub dvpp_interval: u32,

    // PMU sampling, intervals in us
    pub ai_core_sampling: bool,
    pub ai_core_sampling_interval: u32,
    pub ai_core_task: bool,
    pub ai_core_events: Option<String>,
    pub ai_core_cores: Option<Vec<u32>>,
    pub ctrl_cpu_profiling: bool,
    pub ctrl_cpu_interval: u32,
    pub ctrl_cpu_events: Option<String>,
    pub ts_cpu_profiling: bool,
    pub ts_cpu_interval: u32,
    pub ts_cpu_events: Option<String>,

    // Logs
    pub hwts_log: bool,
    pub ts_track: bool,
    pub ai_cpu_profiling: bool,

    // Host, intervals in ms
    pub host_cpu_profiling: bool,
    pub host_cpu_interval: u32,
    pub host_mem_profiling: bool,
    pub host_mem_interval: u32,
    pub host_network_profiling: bool,
    pub host_network_interval: u32,
    pub host_sys_call_profiling: bool,
}

impl SessionParams {
    pub fn from_json(s: &str) -> ProfResult<Self> {
        serde_json::from_str(s)
            .map_err(|e| ProfError::InvalidArgument(format!("session params: {}", e)))
    }

    /// Whether `kind` is switched on for this session.
    pub fn enabled(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::MemCtrl => self.mem_ctrl_profiling,
            JobKind::Hbm => self.hbm_profiling,
            JobKind::Llc => self.llc_profiling,
            JobKind::Pcie => self.pcie_profiling,
            JobKind::Hccs => self.hccs_profiling,
            JobKind::Nic => self.nic_profiling,
            JobKind::Roce => self.roce_profiling,
            JobKind::Dvpp => self.dvpp_profiling,
            JobKind::AiCoreSample => self.ai_core_sampling,
            JobKind::AiCoreTask => self.ai_core_task,
            JobKind::CtrlCpu => self.ctrl_cpu_profiling,
            JobKind::TsCpu => self.ts_cpu_profiling,
            JobKind::HwtsLog => self.hwts_log,
            JobKind::TsTrack => self.ts_track,
            JobKind::AiCpu => self.ai_cpu_profiling,
            JobKind::HostCpu => self.host_cpu_profiling,
            JobKind::HostMem => self.host_mem_profiling,
            JobKind::HostNetwork => self.host_network_profiling,
            JobKind::HostSysCall => self.host_sys_call_profiling,
        }
    }

    /// Sampling interval of `kind`, zero when the kind has none.
    pub fn interval(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::MemCtrl => self.mem_ctrl_interval,
            JobKind::Hbm => self.hbm_interval,
            JobKind::Llc => self.llc_interval,
            JobKind::Pcie => self.pcie_interval,
            JobKind::Hccs => self.hccs_interval,
            JobKind::Nic => self.nic_interval,
            JobKind::Roce => self.roce_interval,
            JobKind::Dvpp => self.dvpp_interval,
            JobKind::AiCoreSample => self.ai_core_sampling_interval,
            JobKind::CtrlCpu => self.ctrl_cpu_interval,
            JobKind::TsCpu => self.ts_cpu_interval,
            JobKind::HostCpu => self.host_cpu_interval,
            JobKind::HostMem => self.host_mem_interval,
            JobKind::HostNetwork => self.host_network_interval,
            _ => 0,
        }
    }

    /// Raw event list configured for `kind`.
    pub fn events(&self, kind: JobKind) -> Option<&str> {
        match kind {
            JobKind::MemCtrl => self.mem_ctrl_events.as_deref(),
            JobKind::Hbm => self.hbm_events.as_deref(),
            JobKind::Llc => self.llc_events.as_deref(),
            JobKind::AiCoreSample | JobKind::AiCoreTask => self.ai_core_events.as_deref(),
            JobKind::CtrlCpu => self.ctrl_cpu_events.as_deref(),
            JobKind::TsCpu => self.ts_cpu_events.as_deref(),
            _ => None,
        }
    }

    /// Kinds that cannot run without an event list.
    pub fn requires_events(kind: JobKind) -> bool {
        matches!(
            kind,
            JobKind::AiCoreSample | JobKind::AiCoreTask | JobKind::CtrlCpu | JobKind::TsCpu
        )
    }

    pub fn validate(&self) -> ProfResult<()> {
        if self.job_id.is_empty() {
            return Err(ProfError::InvalidArgument("empty job id".into()));
        }
        if self.result_dir.as_os_str().is_empty() {
            return Err(ProfError::InvalidArgument("empty result dir".into()));
        }
        for kind in JobKind::ALL {
            let timed = !matches!(
                kind,
                JobKind::AiCoreTask
                    | JobKind::HwtsLog
                    | JobKind::TsTrack
                    | JobKind::AiCpu
                    | JobKind::HostSysCall
            );
            if self.enabled(kind) && timed && self.interval(kind) == 0 {
                return Err(ProfError::InvalidArgument(format!(
                    "{:?} enabled with zero interval",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Split a comma separated event list, dropping empty items.
pub fn split_events(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}

/// Identifiers attached to every uploaded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub device: DeviceId,
    pub session_start_ns: u64,
}

impl JobContext {
    pub fn new(job_id: &str, device: DeviceId) -> Self {
        let session_start_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self {
            job_id: job_id.to_string(),
            device,
            session_start_ns,
        }
    }
}
