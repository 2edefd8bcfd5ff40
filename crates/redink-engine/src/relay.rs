use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use redink_contracts::events::{GenerationEvent, PageErrorKind};

use crate::stop::StopFlag;

enum RelayMessage {
    Event(GenerationEvent),
    Done,
    Failed(String),
}

/// Runs an event producer on a worker thread and hands its events to a
/// consumer, filling idle windows with heartbeats.
///
/// Dropping the relay sets the stop flag; the worker notices between pages.
pub struct EventRelay {
    rx: mpsc::Receiver<RelayMessage>,
    stop: StopFlag,
    heartbeat: Duration,
    handle: Option<thread::JoinHandle<()>>,
    finished: bool,
}

impl EventRelay {
    pub fn spawn<F, I>(heartbeat: Duration, stop: StopFlag, produce: F) -> Result<Self>
    where
        F: FnOnce(StopFlag) -> Result<I> + Send + 'static,
        I: IntoIterator<Item = GenerationEvent>,
    {
        let (tx, rx) = mpsc::channel();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("redink-relay".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                    for event in produce(worker_stop.clone())? {
                        if tx.send(RelayMessage::Event(event)).is_err() {
                            worker_stop.stop();
                            break;
                        }
                    }
                    Ok(())
                }));
                let last = match outcome {
                    Ok(Ok(())) => RelayMessage::Done,
                    Ok(Err(err)) => RelayMessage::Failed(format!("{err:#}")),
                    Err(payload) => RelayMessage::Failed(panic_message(payload.as_ref())),
                };
                let _ = tx.send(last);
            })
            .context("failed to spawn relay worker")?;

        Ok(Self {
            rx,
            stop,
            heartbeat,
            handle: Some(handle),
            finished: false,
        })
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Stop the worker and wait for it to reach a page boundary.
    pub fn close(mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("relay worker panicked during shutdown");
            }
        }
    }
}

impl Iterator for EventRelay {
    type Item = GenerationEvent;

    fn next(&mut self) -> Option<GenerationEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv_timeout(self.heartbeat) {
            Ok(RelayMessage::Event(event)) => Some(event),
            Ok(RelayMessage::Done) => {
                self.finished = true;
                None
            }
            Ok(RelayMessage::Failed(message)) => {
                self.finished = true;
                tracing::error!(error = %message, "generation worker failed");
                Some(GenerationEvent::task_error(
                    PageErrorKind::WorkerCrash,
                    format!("generation worker failed: {message}"),
                ))
            }
            Err(RecvTimeoutError::Timeout) => Some(GenerationEvent::Heartbeat),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Some(GenerationEvent::task_error(
                    PageErrorKind::WorkerCrash,
                    "generation worker exited unexpectedly",
                ))
            }
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!("event consumer went away; stopping generation worker");
        }
        self.stop.stop();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "worker panicked".to_string()
}
