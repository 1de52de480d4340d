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

//! Host-side jobs. Both variants are global: one instance serves every
//! device session.

use crate::error::{keep_first, ProfError, ProfResult};
use crate::job::{
    check_device_side, data_file_name, CollectionJob, CollectionJobConfig, JobDeps, JobLifecycle,
};
use crate::kind::{JobKind, TimerHandlerTag};
use crate::params::JobContext;
use crate::process::{Pid, ProcessRunner};
use crate::timer::TimerHandler;
use crate::uploader::{FileChunkDesc, Uploader};

use log::{debug, error, info, warn};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Proc file sampled for a host kind, relative to the proc root.
fn proc_source(kind: JobKind) -> Option<&'static str> {
    match kind {
        JobKind::HostCpu => Some("stat"),
        JobKind::HostMem => Some("meminfo"),
        JobKind::HostNetwork => Some("net/dev"),
        _ => None,
    }
}

fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos())
}

/// Timer handler snapshotting one proc file every `interval`.
struct ProcSampler {
    path: PathBuf,
    interval: Duration,
    last: Mutex<Option<Instant>>,
    uploader: Arc<dyn Uploader>,
    file: FileChunkDesc,
    ctx: Arc<JobContext>,
}

impl ProcSampler {
    fn due(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(t) if t.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    fn sample(&self) -> ProfResult<()> {
        let data = std::fs::read(&self.path)?;
        let mut payload = format!("time {}\n", now_ns()).into_bytes();
        payload.extend_from_slice(&data);
        self.uploader
            .upload_file_data(&self.ctx.job_id, &payload, &self.file, &self.ctx)
    }
}

impl TimerHandler for ProcSampler {
    fn execute(&self) {
        if !self.due() {
            return;
        }
        if let Err(e) = self.sample() {
            error!("Failed to sample {:?}: {}", self.path, e);
        }
    }
}

/// Host CPU, memory and network usage, read from proc files on the shared
/// polling timer.
pub struct HostSampleJob {
    deps: JobDeps,
    kind: JobKind,
    lifecycle: JobLifecycle,
    sampler: Option<(TimerHandlerTag, Arc<ProcSampler>)>,
    timer_started: bool,
}

impl HostSampleJob {
    pub fn new(deps: &JobDeps, kind: JobKind) -> Self {
        Self {
            deps: deps.clone(),
            kind,
            lifecycle: JobLifecycle::default(),
            sampler: None,
            timer_started: false,
        }
    }

    pub fn boxed(deps: &JobDeps, kind: JobKind) -> Box<dyn CollectionJob> {
        Box::new(Self::new(deps, kind))
    }

    fn build_sampler(
        deps: &JobDeps,
        cfg: &CollectionJobConfig,
    ) -> ProfResult<(TimerHandlerTag, Arc<ProcSampler>)> {
        let kind = cfg.kind;
        check_device_side(kind, cfg.device)?;
        if !cfg.params.enabled(kind) {
            return Err(ProfError::Disabled(format!("{:?} switched off", kind)));
        }
        let (Some(tag), Some(source)) = (TimerHandlerTag::for_kind(kind), proc_source(kind)) else {
            return Err(ProfError::InvalidArgument(format!("{:?} is not sampled on a timer", kind)));
        };
        let interval = cfg.params.interval(kind);
        if interval == 0 {
            return Err(ProfError::InvalidArgument(format!("{:?} with zero interval", kind)));
        }
        let path = Path::new(&deps.config.proc_root).join(source);
        if !path.is_file() {
            warn!("{:?} not available, {:?} is missing", kind, path);
            return Err(ProfError::CapabilityUnsupported(path.display().to_string()));
        }
        let sampler = ProcSampler {
            path,
            interval: Duration::from_millis(interval.into()),
            last: Mutex::new(None),
            uploader: deps.uploader.clone(),
            file: cfg.file_desc(&format!("{}.data.slice_0", kind.file_tag())),
            ctx: cfg.ctx.clone(),
        };
        Ok((tag, Arc::new(sampler)))
    }
}

impl CollectionJob for HostSampleJob {
    fn init(&mut self, cfg: Arc<CollectionJobConfig>) -> ProfResult<()> {
        if cfg.kind != self.kind {
            return Err(ProfError::InvalidArgument(format!(
                "{:?} config for a {:?} job",
                cfg.kind, self.kind
            )));
        }
        let deps = &self.deps;
        self.sampler = Some(self.lifecycle.init(|| Self::build_sampler(deps, &cfg))?);
        Ok(())
    }

    fn process(&mut self) -> ProfResult<()> {
        let timer = &self.deps.timer;
        let sampler = &self.sampler;
        let timer_started = &mut self.timer_started;
        self.lifecycle.process(|| {
            let Some((tag, sampler)) = sampler else {
                return Err(ProfError::InvalidState("no sampler".into()));
            };
            timer.register_timer_handler(*tag, sampler.clone());
            if !*timer_started {
                timer.start_prof_timer()?;
                *timer_started = true;
            }
            Ok(())
        })
    }

    fn uninit(&mut self) -> ProfResult<()> {
        let sampler = self.sampler.take();
        let started = std::mem::replace(&mut self.timer_started, false);
        let timer = self.deps.timer.clone();
        self.lifecycle.uninit(|_| {
            if let Some((tag, _)) = sampler {
                timer.remove_timer_handler(tag);
            }
            if started {
                timer.stop_prof_timer();
            }
            Ok(())
        })
    }

    fn is_global_job_level(&self) -> bool {
        true
    }
}

/// System call trace of the whole host, recorded by an external tracing
/// tool for the lifetime of the job.
pub struct PerfScriptJob {
    deps: JobDeps,
    lifecycle: JobLifecycle,
    output: Option<PathBuf>,
    file: Option<FileChunkDesc>,
    ctx: Option<Arc<JobContext>>,
    runs: AtomicU32,
    pid: Option<Pid>,
}

impl PerfScriptJob {
    pub fn new(deps: &JobDeps) -> Self {
        Self {
            deps: deps.clone(),
            lifecycle: JobLifecycle::default(),
            output: None,
            file: None,
            ctx: None,
            runs: AtomicU32::new(0),
            pid: None,
        }
    }

    pub fn boxed(deps: &JobDeps, _kind: JobKind) -> Box<dyn CollectionJob> {
        Box::new(Self::new(deps))
    }

    fn tool_args(output: &Path) -> Vec<String> {
        vec![
            "trace".into(),
            "-a".into(),
            "-s".into(),
            "-T".into(),
            "-o".into(),
            output.display().to_string(),
        ]
    }
}

fn upload_output(
    uploader: &dyn Uploader,
    output: &Path,
    file: &FileChunkDesc,
    ctx: &JobContext,
) -> ProfResult<()> {
    if !output.exists() {
        warn!("Trace tool left no output at {:?}", output);
        return Ok(());
    }
    let data = std::fs::read(output)?;
    info!("Uploading {} bytes of syscall trace", data.len());
    uploader.upload_file_data(&ctx.job_id, &data, file, ctx)
}

/// SIGINT `pid` so it flushes its output, give it `grace` to exit, then
/// SIGKILL it. Reaps the process either way.
fn stop_tool(runner: &dyn ProcessRunner, pid: Pid, grace: Duration) -> ProfResult<()> {
    let mut result = Ok(());
    if runner.is_alive(pid) {
        keep_first(&mut result, runner.kill(pid));
        let deadline = Instant::now() + grace;
        while runner.is_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10).min(grace));
        }
        if runner.is_alive(pid) {
            warn!("Trace tool {} ignored SIGINT for {:?}, killing it", pid, grace);
            keep_first(&mut result, runner.terminate(pid));
        }
    }
    match runner.wait(pid) {
        Ok(code) => debug!("Trace tool {} exited with {:?}", pid, code),
        Err(e) => keep_first(&mut result, Err(e)),
    }
    result
}

impl CollectionJob for PerfScriptJob {
    fn init(&mut self, cfg: Arc<CollectionJobConfig>) -> ProfResult<()> {
        self.lifecycle.init(|| {
            check_device_side(cfg.kind, cfg.device)?;
            if !cfg.params.enabled(cfg.kind) {
                return Err(ProfError::Disabled(format!("{:?} switched off", cfg.kind)));
            }
            Ok(())
        })?;
        self.output = Some(
            cfg.data_dir
                .join(data_file_name("host_syscall.perf.%p", cfg.device)),
        );
        self.file = Some(cfg.file_desc("host_syscall.data.slice_0"));
        self.ctx = Some(cfg.ctx.clone());
        Ok(())
    }

    fn process(&mut self) -> ProfResult<()> {
        let runs = &self.runs;
        let pid = &mut self.pid;
        let output = &self.output;
        let runner = &self.deps.runner;
        let tool = &self.deps.config.perf_tool;
        self.lifecycle.process(|| {
            if runs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Syscall trace already running");
                return Ok(());
            }
            let Some(output) = output else {
                runs.store(0, Ordering::Release);
                return Err(ProfError::InvalidState("no output path".into()));
            };
            match runner.spawn(tool, &Self::tool_args(output)) {
                Ok(p) => {
                    info!("Started {} as pid {}", tool, p);
                    *pid = Some(p);
                    Ok(())
                }
                Err(e) => {
                    runs.store(0, Ordering::Release);
                    error!("Failed to start {}: {}", tool, e);
                    Err(e)
                }
            }
        })
    }

    fn uninit(&mut self) -> ProfResult<()> {
        let pid = self.pid.take();
        let runner = self.deps.runner.clone();
        let uploader = self.deps.uploader.clone();
        let output = self.output.clone();
        let file = self.file.clone();
        let ctx = self.ctx.clone();
        let grace = self.deps.config.tool_stop_timeout;
        self.lifecycle.uninit(|_| {
            let Some(pid) = pid else {
                return Ok(());
            };
            let mut result = stop_tool(runner.as_ref(), pid, grace);
            if let (Some(output), Some(file), Some(ctx)) = (output, file, ctx) {
                keep_first(&mut result, upload_output(uploader.as_ref(), &output, &file, &ctx));
            }
            result
        })
    }

    fn is_global_job_level(&self) -> bool {
        true
    }
}
