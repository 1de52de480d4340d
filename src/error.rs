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

use crate::hal::DrvStatus;
use crate::kind::{DeviceId, JobKind};

pub type ProfResult<T> = Result<T, ProfError>;

/// Error kinds surfaced by the collection core.
#[derive(Debug, thiserror::Error)]
pub enum ProfError {
    /// Malformed device id, out-of-range job kind and the like. Always
    /// reported before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Registration blocked by an existing per-device or global entry.
    #[error("{kind:?} cannot run on device {device}: already running on device {holder}")]
    NotEligible {
        device: DeviceId,
        kind: JobKind,
        holder: DeviceId,
    },

    #[error("{kind:?} is not registered on device {device}")]
    NotRegistered { device: DeviceId, kind: JobKind },

    /// The job kind is switched off or lacks the configuration it needs.
    #[error("job disabled: {0}")]
    Disabled(String),

    /// The driver reports the feature does not exist on this platform.
    #[error("capability unsupported: {0}")]
    CapabilityUnsupported(String),

    #[error("driver call {op} failed with code {code}")]
    HalFailure { op: &'static str, code: i32 },

    #[error("channel stopped already")]
    AlreadyStopped,

    #[error("{what}: gave up after {attempts} attempts")]
    RetryBudgetExhausted { what: String, attempts: u32 },

    #[error("driver returned {0} channels")]
    InvalidChannelList(usize),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfError {
    /// Translate a non-success driver status into the error taxonomy.
    pub fn from_drv(op: &'static str, status: DrvStatus) -> Self {
        match status {
            DrvStatus::NOT_SUPPORT => ProfError::CapabilityUnsupported(op.to_string()),
            DrvStatus::CHANNEL_STOPPED => ProfError::AlreadyStopped,
            DrvStatus(code) => ProfError::HalFailure { op, code },
        }
    }

    /// Whether the failure is an expected outcome that should not be logged
    /// as an error.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProfError::NotEligible { .. }
                | ProfError::Disabled(_)
                | ProfError::CapabilityUnsupported(_)
                | ProfError::AlreadyStopped
        )
    }
}

/// Keep the first failure of a best-effort sequence of cleanup steps.
pub(crate) fn keep_first(acc: &mut ProfResult<()>, step: ProfResult<()>) {
    if let Err(e) = step {
        if acc.is_ok() {
            *acc = Err(e);
        }
    }
}
