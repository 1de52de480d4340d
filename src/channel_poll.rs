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

//! Fan-in of every started channel onto one poll thread.

use crate::config::Config;
use crate::error::{ProfError, ProfResult};
use crate::hal::{ChannelId, ChannelPollEntry, DriverHal, DrvStatus};
use crate::kind::DeviceId;
use crate::params::JobContext;
use crate::uploader::{FileChunkDesc, Uploader};

use log::{debug, error, warn};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Identity of a channel reader: which job, which stream, which data file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelReaderKey {
    pub job_id: String,
    pub device: DeviceId,
    pub channel: ChannelId,
    pub file: FileChunkDesc,
}

#[derive(Debug, Clone)]
struct ChannelReader {
    key: ChannelReaderKey,
    ctx: Arc<JobContext>,
}

struct PollerInner {
    hal: Arc<dyn DriverHal>,
    uploader: Arc<dyn Uploader>,
    readers: Mutex<BTreeMap<ChannelPollEntry, ChannelReader>>,
    // Also serializes reads between the poll thread and flushes.
    buf: Mutex<Vec<u8>>,
    poll_timeout: Duration,
    poll_max: usize,
    flush_max_reads: usize,
    stop: AtomicBool,
}

impl PollerInner {
    fn poll_set(&self) -> Vec<ChannelPollEntry> {
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Read one chunk of `entry` and upload it. Returns the chunk size; a
    /// stopped channel reads as empty.
    fn dispatch_channel(&self, entry: ChannelPollEntry) -> ProfResult<usize> {
        // buf first: a reader removed while we wait is not looked up
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let reader = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entry)
            .cloned();
        let Some(reader) = reader else {
            return Ok(0);
        };
        self.read_chunk(entry, &reader, &mut buf)
    }

    fn read_chunk(
        &self,
        entry: ChannelPollEntry,
        reader: &ChannelReader,
        buf: &mut [u8],
    ) -> ProfResult<usize> {
        match self.hal.read_channel(entry.device, entry.channel, buf) {
            Ok(0) | Err(DrvStatus::CHANNEL_STOPPED) => Ok(0),
            Ok(n) => {
                let n = n.min(buf.len());
                self.uploader.upload_file_data(
                    &reader.key.job_id,
                    &buf[..n],
                    &reader.key.file,
                    &reader.ctx,
                )?;
                Ok(n)
            }
            Err(e) => Err(ProfError::from_drv("read_channel", e)),
        }
    }

    fn flush_channel(&self, entry: ChannelPollEntry, reader: &ChannelReader) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..self.flush_max_reads {
            match self.read_chunk(entry, reader, &mut buf) {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Flush of channel {} on device {} stopped: {}",
                        entry.channel, entry.device, e
                    );
                    return;
                }
            }
        }
        warn!(
            "Channel {} on device {} still has data after {} reads",
            entry.channel, entry.device, self.flush_max_reads
        );
    }

    fn poll_loop(&self) {
        while !self.stop.load(Ordering::Acquire) {
            let set = self.poll_set();
            if set.is_empty() {
                thread::park_timeout(self.poll_timeout);
                continue;
            }
            match self.hal.poll_channels(&set, self.poll_max, self.poll_timeout) {
                Ok(ready) => {
                    for entry in ready {
                        if let Err(e) = self.dispatch_channel(entry) {
                            error!(
                                "Failed to dispatch channel {} of device {}: {}",
                                entry.channel, entry.device, e
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!("poll_channels failed, code {}", e.0);
                    thread::park_timeout(self.poll_timeout);
                }
            }
        }
    }
}

pub struct ChannelPoller {
    inner: Arc<PollerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelPoller {
    pub fn new(hal: Arc<dyn DriverHal>, uploader: Arc<dyn Uploader>, config: &Config) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                hal,
                uploader,
                readers: Mutex::new(BTreeMap::new()),
                buf: Mutex::new(vec![0; config.channel_read_buf_size]),
                poll_timeout: config.channel_poll_timeout,
                poll_max: config.channel_poll_max,
                flush_max_reads: config.flush_max_reads,
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn register_reader(&self, key: ChannelReaderKey, ctx: Arc<JobContext>) {
        let entry = ChannelPollEntry {
            device: key.device,
            channel: key.channel,
        };
        let mut readers = self.inner.readers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = readers.insert(entry, ChannelReader { key, ctx }) {
            warn!("Replaced reader of job {} on {:?}", old.key.job_id, entry);
        }
    }

    /// Forget the reader of the channel, then drain what is left on it.
    /// Nothing of that channel is uploaded after this returns.
    pub fn remove_reader(&self, device: DeviceId, channel: ChannelId) -> bool {
        let entry = ChannelPollEntry { device, channel };
        let removed = self
            .inner
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entry);
        match removed {
            Some(reader) => {
                self.inner.flush_channel(entry, &reader);
                true
            }
            None => false,
        }
    }

    pub fn remove_device(&self, device: DeviceId) {
        let entries: Vec<ChannelPollEntry> = self
            .inner
            .poll_set()
            .into_iter()
            .filter(|e| e.device == device)
            .collect();
        for e in entries {
            warn!("Dropping leftover reader of channel {} on device {}", e.channel, device);
            self.remove_reader(e.device, e.channel);
        }
    }

    pub fn has_reader(&self, device: DeviceId, channel: ChannelId) -> bool {
        self.inner
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&ChannelPollEntry { device, channel })
    }

    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn start(&self) -> ProfResult<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        self.inner.stop.store(false, Ordering::Release);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("prof-channel-poll".into())
            .spawn(move || inner.poll_loop())?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.inner.stop.store(true, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Channel poll thread panicked");
            }
        }
    }
}

impl std::ops::Drop for ChannelPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_hal::{MockHal, MockUploader};

    use std::path::PathBuf;
    use std::time::Instant;

    fn key(device: DeviceId, channel: ChannelId) -> ChannelReaderKey {
        ChannelReaderKey {
            job_id: "5".into(),
            device,
            channel,
            file: FileChunkDesc {
                dir: PathBuf::from("/tmp"),
                file_name: format!("data.{}.{}", channel, device),
            },
        }
    }

    fn setup() -> (Arc<MockHal>, Arc<MockUploader>, ChannelPoller) {
        let hal = Arc::new(MockHal::new());
        let up = Arc::new(MockUploader::default());
        let config = Config {
            channel_poll_timeout: Duration::from_millis(2),
            channel_read_buf_size: 8,
            flush_max_reads: 4,
            ..Config::default()
        };
        let poller = ChannelPoller::new(hal.clone(), up.clone(), &config);
        (hal, up, poller)
    }

    #[test]
    fn poll_thread_uploads_ready_chunks() {
        let (hal, up, poller) = setup();
        poller.register_reader(key(0, 7), Arc::new(JobContext::new("5", 0)));
        hal.push_data(0, 7, Ok(b"abc".to_vec()));
        hal.push_data(0, 7, Ok(b"de".to_vec()));
        // not registered, never read
        hal.push_data(1, 7, Ok(b"zz".to_vec()));
        poller.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while up.payloads().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        poller.stop();
        assert_eq!(up.payloads(), vec![b"abc".to_vec(), b"de".to_vec()]);
        assert_eq!(hal.data.lock().unwrap()[&(1, 7)].len(), 1);
    }

    #[test]
    fn stopped_channel_reads_as_empty() {
        let (hal, up, poller) = setup();
        poller.register_reader(key(0, 7), Arc::new(JobContext::new("5", 0)));
        hal.push_data(0, 7, Err(DrvStatus::CHANNEL_STOPPED));
        let entry = ChannelPollEntry { device: 0, channel: 7 };
        assert_eq!(poller.inner.dispatch_channel(entry).unwrap(), 0);
        hal.push_data(0, 7, Err(DrvStatus(3)));
        assert!(poller.inner.dispatch_channel(entry).is_err());
        assert!(up.payloads().is_empty());
    }

    #[test]
    fn remove_flushes_remaining_data() {
        let (hal, up, poller) = setup();
        poller.register_reader(key(2, 9), Arc::new(JobContext::new("5", 2)));
        for i in 0..3u8 {
            hal.push_data(2, 9, Ok(vec![i; 4]));
        }
        assert!(poller.remove_reader(2, 9));
        assert_eq!(up.payloads().len(), 3);
        assert!(!poller.has_reader(2, 9));
        assert!(!poller.remove_reader(2, 9));
    }

    #[test]
    fn nothing_is_uploaded_after_remove_returns() {
        let (hal, up, poller) = setup();
        poller.register_reader(key(0, 4), Arc::new(JobContext::new("5", 0)));
        poller.start().unwrap();
        hal.push_data(0, 4, Ok(b"one".to_vec()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while up.payloads().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(poller.remove_reader(0, 4));
        let uploaded = up.payloads().len();
        hal.push_data(0, 4, Ok(b"late".to_vec()));
        thread::sleep(Duration::from_millis(20));
        poller.stop();
        assert_eq!(up.payloads().len(), uploaded);
    }

    #[test]
    fn flush_is_bounded() {
        let (hal, up, poller) = setup();
        poller.register_reader(key(0, 1), Arc::new(JobContext::new("5", 0)));
        for _ in 0..10 {
            hal.push_data(0, 1, Ok(vec![1; 4]));
        }
        poller.remove_reader(0, 1);
        assert_eq!(up.payloads().len(), 4);
    }

    #[test]
    fn remove_device_drops_only_that_device() {
        let (_, _, poller) = setup();
        poller.register_reader(key(0, 1), Arc::new(JobContext::new("5", 0)));
        poller.register_reader(key(0, 3), Arc::new(JobContext::new("5", 0)));
        poller.register_reader(key(1, 1), Arc::new(JobContext::new("5", 1)));
        poller.remove_device(0);
        assert_eq!(poller.reader_count(), 1);
        assert!(poller.has_reader(1, 1));
    }

    #[test]
    fn start_stop_idempotent() {
        let (_, _, poller) = setup();
        poller.start().unwrap();
        poller.start().unwrap();
        poller.stop();
        poller.stop();
        poller.start().unwrap();
        poller.stop();
    }
}
