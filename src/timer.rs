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

//! Polling scheduler: one thread driving every periodic sampling handler.
//!
//! Handlers run sequentially on the timer thread in registration order. A slow
//! handler delays the rest of its tick but never the thread itself. Once
//! [`ProfTimer::remove_timer_handler`] returns, the removed handler does not
//! run again.

use crate::error::{ProfError, ProfResult};
use crate::kind::TimerHandlerTag;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub trait TimerHandler: Send + Sync {
    fn execute(&self);
}

type HandlerList = Vec<(TimerHandlerTag, Arc<dyn TimerHandler>)>;

thread_local! {
    static ON_TIMER_THREAD: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
struct TimerWorker {
    stop_signal: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

pub struct ProfTimer {
    interval: Duration,
    handlers: Arc<Mutex<HandlerList>>,
    // held by the timer thread for the length of a tick
    tick: Arc<Mutex<()>>,
    worker: Mutex<TimerWorker>,
}

fn still_registered(handlers: &Mutex<HandlerList>, h: &Arc<dyn TimerHandler>) -> bool {
    handlers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .any(|(_, r)| Arc::ptr_eq(r, h))
}

impl ProfTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_micros(1)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            tick: Arc::new(Mutex::new(())),
            worker: Mutex::new(TimerWorker::default()),
        }
    }

    /// Register `handler` under `tag`, replacing whatever held the tag.
    pub fn register_timer_handler(&self, tag: TimerHandlerTag, handler: Arc<dyn TimerHandler>) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match handlers.iter_mut().find(|(t, _)| *t == tag) {
            Some(slot) => {
                debug!("Replacing timer handler {:?}", tag);
                slot.1 = handler;
            }
            None => handlers.push((tag, handler)),
        }
    }

    /// Drop the handler under `tag`. If a tick is in flight on another thread
    /// this waits for it, so the handler is never executed after return.
    pub fn remove_timer_handler(&self, tag: TimerHandlerTag) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(t, _)| *t != tag);
        // a handler removing itself already holds the tick
        if !ON_TIMER_THREAD.with(Cell::get) {
            drop(self.tick.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .worker
            .is_some()
    }

    pub fn start(&self) -> ProfResult<()> {
        let mut w = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if w.worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded::<()>(1);
        let handlers = self.handlers.clone();
        let tick = self.tick.clone();
        let interval = self.interval;
        let worker = thread::Builder::new()
            .name("prof-timer".into())
            .spawn(move || {
                ON_TIMER_THREAD.with(|t| t.set(true));
                while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                    let _tick = tick.lock().unwrap_or_else(|e| e.into_inner());
                    // snapshot so handlers may (de)register from execute()
                    let snapshot: Vec<Arc<dyn TimerHandler>> = handlers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .iter()
                        .map(|(_, h)| h.clone())
                        .collect();
                    for h in snapshot {
                        if still_registered(&handlers, &h) {
                            h.execute();
                        }
                    }
                }
            })
            .map_err(ProfError::Io)?;
        w.stop_signal = Some(tx);
        w.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&self) {
        let (stop_signal, worker) = {
            let mut w = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            (w.stop_signal.take(), w.worker.take())
        };
        drop(stop_signal);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

impl std::ops::Drop for ProfTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reference-counted owner of the shared [`ProfTimer`].
///
/// The thread starts on the first [`TimerManager::start_prof_timer`] and is
/// joined by the matching last [`TimerManager::stop_prof_timer`].
pub struct TimerManager {
    timer: ProfTimer,
    users: Mutex<usize>,
}

impl TimerManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            timer: ProfTimer::new(interval),
            users: Mutex::new(0),
        }
    }

    pub fn start_prof_timer(&self) -> ProfResult<()> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if *users == 0 {
            self.timer.start()?;
        }
        *users += 1;
        Ok(())
    }

    pub fn stop_prof_timer(&self) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        match *users {
            0 => warn!("Timer stopped more times than started"),
            1 => {
                *users = 0;
                self.timer.stop();
            }
            _ => *users -= 1,
        }
    }

    pub fn register_timer_handler(&self, tag: TimerHandlerTag, handler: Arc<dyn TimerHandler>) {
        self.timer.register_timer_handler(tag, handler);
    }

    pub fn remove_timer_handler(&self, tag: TimerHandlerTag) {
        self.timer.remove_timer_handler(tag);
    }

    pub fn handler_count(&self) -> usize {
        self.timer.handler_count()
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn user_count(&self) -> usize {
        *self.users.lock().unwrap_or_else(|e| e.into_inner())
    }
}
