//! Acquisition threads.
//!
//! Each [`SensorReader`] runs on its own named OS thread, repeating
//! [`SensorReader::process_read`] until asked to stop or until its channel
//! fails. Stopping is cooperative: a flag checked between physical reads,
//! plus the channel's [`ChannelInterrupt`] (when it has one) to unblock a
//! read that is waiting on a quiet device.
//!
//! ```rust,no_run
//! # use daq_io::{AcquisitionThread, SensorReader};
//! # fn run(reader: SensorReader) -> daq_core::AppResult<()> {
//! let thread = AcquisitionThread::spawn(reader)?;
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! let exit = thread.stop_and_join()?;
//! println!("{} bytes", exit.stats.bytes);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use daq_core::channel::{Channel, ChannelInterrupt};
use daq_core::error::{AppResult, DaqError};
use daq_core::limits::SHUTDOWN_TIMEOUT;
use tracing::{debug, error, info, warn};

use crate::reader::{ReaderStats, ReaderStatsSnapshot, SensorReader};

/// What a finished acquisition thread reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderExit {
    /// Final reader counters.
    pub stats: ReaderStatsSnapshot,
    /// Read calls made, including empty ones.
    pub iterations: u64,
}

/// Handle to a running reader thread.
pub struct AcquisitionThread {
    name: String,
    running: Arc<AtomicBool>,
    interrupter: Option<Box<dyn ChannelInterrupt>>,
    stats: Arc<ReaderStats>,
    handle: Option<JoinHandle<AppResult<ReaderExit>>>,
}

impl std::fmt::Debug for AcquisitionThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AcquisitionThread {
    /// Start `reader` on a thread named after it.
    pub fn spawn<C: Channel + 'static>(mut reader: SensorReader<C>) -> AppResult<Self> {
        let name = reader.name().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let interrupter = reader.interrupter();
        let stats = reader.stats();

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(format!("daq-{name}"))
            .spawn(move || run(&mut reader, &flag))
            .map_err(|e| DaqError::Thread {
                name: name.clone(),
                message: e.to_string(),
            })?;

        info!(sensor = %name, "Acquisition thread started");
        Ok(Self {
            name,
            running,
            interrupter,
            stats,
            handle: Some(handle),
        })
    }

    /// Sensor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once stop was requested or the thread has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Live counters of the reader.
    #[must_use]
    pub fn stats(&self) -> ReaderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the thread to stop and unblock its channel.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(sensor = %self.name, "Stop requested");
        if let Some(interrupter) = &self.interrupter {
            if let Err(e) = interrupter.interrupt() {
                warn!(sensor = %self.name, error = %e, "Channel interrupt failed");
            }
        }
    }

    /// Wait for the thread, giving up after the shutdown timeout.
    ///
    /// Returns the reader's fatal error, if it ended on one.
    pub fn join(mut self) -> AppResult<ReaderExit> {
        let Some(handle) = self.handle.take() else {
            return Err(self.thread_error("already joined"));
        };

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !handle.is_finished() {
            if !self.running.load(Ordering::SeqCst) && Instant::now() >= deadline {
                error!(sensor = %self.name, "Acquisition thread did not stop in time");
                return Err(self.thread_error("did not stop within the shutdown timeout"));
            }
            thread::sleep(Duration::from_millis(5));
        }

        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(self.thread_error("panicked")),
        }
    }

    /// [`stop`](Self::stop) followed by [`join`](Self::join).
    pub fn stop_and_join(self) -> AppResult<ReaderExit> {
        self.stop();
        self.join()
    }

    fn thread_error(&self, message: &str) -> DaqError {
        DaqError::Thread {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }
}

impl Drop for AcquisitionThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run<C: Channel>(reader: &mut SensorReader<C>, running: &AtomicBool) -> AppResult<ReaderExit> {
    let idle = reader.idle_sleep();
    let mut iterations = 0u64;

    let outcome = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(());
        }
        iterations += 1;
        match reader.process_read() {
            Ok(read) if read.bytes == 0 && !idle.is_zero() => thread::sleep(idle),
            Ok(_) => {}
            // A read unblocked by `stop` fails; that is not a channel fault.
            Err(_) if !running.load(Ordering::SeqCst) => break Ok(()),
            Err(e) => {
                error!(sensor = %reader.name(), error = %e, "Channel failed, reader exiting");
                break Err(e);
            }
        }
    };
    running.store(false, Ordering::SeqCst);

    if let Err(e) = reader.close() {
        debug!(sensor = %reader.name(), error = %e, "Close after stop failed");
    }
    let stats = reader.stats().snapshot();
    info!(
        sensor = %reader.name(),
        bytes = stats.bytes,
        samples = stats.samples,
        dropped = stats.dropped(),
        "Acquisition thread finished"
    );
    outcome.map(|()| ReaderExit { stats, iterations })
}
