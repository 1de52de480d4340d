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

use crate::error::ProfResult;
use crate::params::JobContext;

use log::error;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Where a sampled chunk belongs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileChunkDesc {
    /// Directory the data file lives in.
    pub dir: PathBuf,
    /// File name, already templated.
    pub file_name: String,
}

impl FileChunkDesc {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

/// Sink of sampled bytes.
///
/// Called exactly once per chunk, on the thread that produced it.
pub trait Uploader: Send + Sync {
    fn upload_file_data(
        &self,
        job_id: &str,
        payload: &[u8],
        file: &FileChunkDesc,
        ctx: &JobContext,
    ) -> ProfResult<()>;

    /// The session writing under `dir` is over; release whatever is held for
    /// files below it.
    fn close_dir(&self, _dir: &Path) {}
}

/// Appends every chunk to its data file on local disk.
#[derive(Debug, Default)]
pub struct FileUploader {
    files: Mutex<HashMap<PathBuf, File>>,
}

fn open_data_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl FileUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every open data file.
    pub fn flush_all(&self) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        for (path, f) in files.iter_mut() {
            flush_file(path, f);
        }
        files.clear();
    }

    pub fn open_files(&self) -> usize {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn flush_file(path: &Path, f: &mut File) {
    if let Err(e) = f.flush() {
        error!("Failed to flush {:?}: {}", path, e);
    }
}

impl Uploader for FileUploader {
    fn upload_file_data(
        &self,
        _job_id: &str,
        payload: &[u8],
        file: &FileChunkDesc,
        _ctx: &JobContext,
    ) -> ProfResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let path = file.path();
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        use std::collections::hash_map::Entry;
        let f = match files.entry(path) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let f = open_data_file(e.key())?;
                e.insert(f)
            }
        };
        f.write_all(payload)?;
        Ok(())
    }

    fn close_dir(&self, dir: &Path) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.retain(|path, f| {
            if path.starts_with(dir) {
                flush_file(path, f);
                false
            } else {
                true
            }
        });
    }
}
