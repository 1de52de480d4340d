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

use log::debug;

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

pub type Pid = u32;

/// Spawns and supervises external sampling tools.
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, cmd: &str, args: &[String]) -> ProfResult<Pid>;
    fn is_alive(&self, pid: Pid) -> bool;
    /// Reap `pid`; returns its exit code, `None` if it died from a signal.
    fn wait(&self, pid: Pid) -> ProfResult<Option<i32>>;
    /// Ask `pid` to stop. Tools flush their output on SIGINT.
    fn kill(&self, pid: Pid) -> ProfResult<()>;
    /// Kill `pid` outright (SIGKILL), for tools that ignore [`Self::kill`].
    fn terminate(&self, pid: Pid) -> ProfResult<()>;
}

/// `pid` as a signal target. 0 and values past `pid_t` would address a
/// process group instead of one process.
fn signal_target(pid: Pid) -> ProfResult<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ProfError::InvalidArgument(format!("pid {}", pid))),
    }
}

fn send_signal(pid: Pid, sig: libc::c_int) -> ProfResult<()> {
    let target = signal_target(pid)?;
    // SAFETY: plain syscall, no memory is shared
    let r = unsafe { libc::kill(target, sig) };
    if r != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SystemProcessRunner {
    children: Mutex<HashMap<Pid, Child>>,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn spawn(&self, cmd: &str, args: &[String]) -> ProfResult<Pid> {
        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        debug!("spawned {} as pid {}", cmd, pid);
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        match children.get_mut(&pid) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => send_signal(pid, 0).is_ok(),
        }
    }

    fn wait(&self, pid: Pid) -> ProfResult<Option<i32>> {
        let child = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
        match child {
            Some(mut child) => Ok(child.wait()?.code()),
            None => Err(ProfError::InvalidArgument(format!("pid {} not spawned here", pid))),
        }
    }

    fn kill(&self, pid: Pid) -> ProfResult<()> {
        send_signal(pid, libc::SIGINT)
    }

    fn terminate(&self, pid: Pid) -> ProfResult<()> {
        send_signal(pid, libc::SIGKILL)
    }
}
