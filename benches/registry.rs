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

use accel_prof_agent::registry::shared_job;
use accel_prof_agent::{CollectionJob, CollectionJobConfig, CollectionRegistry, JobKind, ProfResult};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

struct NopJob(bool);

impl CollectionJob for NopJob {
    fn init(&mut self, _cfg: Arc<CollectionJobConfig>) -> ProfResult<()> {
        Ok(())
    }

    fn process(&mut self) -> ProfResult<()> {
        Ok(())
    }

    fn uninit(&mut self) -> ProfResult<()> {
        Ok(())
    }

    fn is_global_job_level(&self) -> bool {
        self.0
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let registry = CollectionRegistry::new();
    c.bench_function("register and unregister", |b| {
        b.iter(|| {
            registry
                .register_and_run(0, JobKind::Llc, shared_job(Box::new(NopJob(false))))
                .unwrap();
            registry.unregister_and_stop(0, JobKind::Llc).unwrap();
        })
    });

    // eligibility scans every device
    let loaded = CollectionRegistry::new();
    for device in 0..16 {
        for kind in JobKind::ALL {
            let global = kind.is_host_kind();
            if global && device > 0 {
                continue;
            }
            loaded
                .register_and_run(device, kind, shared_job(Box::new(NopJob(global))))
                .unwrap();
        }
    }
    c.bench_function("eligibility check, 16 devices", |b| {
        b.iter(|| loaded.check_collection_job_is_no_register(7, JobKind::HostCpu))
    });

    c.bench_function("rejected registration", |b| {
        b.iter(|| {
            let _ = loaded.register_and_run(3, JobKind::Hbm, shared_job(Box::new(NopJob(false))));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
