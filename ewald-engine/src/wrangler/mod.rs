//! Live ingest of detector frames into a sphere.
//!
//! A [`Wrangler`] owns one worker thread. The caller drives it through a
//! bounded command queue and reads progress from a bounded signal queue:
//!
//! - `Signal::Update(idx)` once arch `idx` and the aggregates are stored
//! - `Signal::Message(text)` for timeouts, completion and fatal errors
//! - `Signal::Terminate` exactly once, as the worker's last signal

mod config;
mod source;
mod worker;

pub use config::{SourceConfig, WranglerConfig};
pub use source::{trailing_index, DirectoryWatch, Frame, FrameSource, Poll, ScanPlan};

use crate::error::{Error, Result};
use crate::sphere::EwaldSphere;
use crate::state::WorkerState;
use ewald_core::Poni;
use parking_lot::Mutex;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker::Worker;

/// Commands accepted by the worker between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Finish the current frame, then exit.
    Stop,
    /// Idle until `Continue`.
    Pause,
    Continue,
    /// Exit at the next check.
    Terminate,
}

/// Progress reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Update(i64),
    Message(String),
    Terminate,
}

/// Handle to a running ingest worker.
pub struct Wrangler {
    commands: Option<SyncSender<Command>>,
    signals: Receiver<Signal>,
    state: Arc<Mutex<WorkerState>>,
    handle: Option<JoinHandle<()>>,
}

impl Wrangler {
    /// Starts ingesting the frames described by `config` into `sphere`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the calibration or
    /// detector file cannot be read, or the thread cannot be spawned.
    pub fn spawn(config: &WranglerConfig, sphere: Arc<EwaldSphere>) -> Result<Self> {
        config.validate()?;
        let source = source::from_config(&config.source)?;
        Self::spawn_with_source(config, sphere, source)
    }

    /// Like [`spawn`](Self::spawn) with a caller-supplied frame source;
    /// `config.source` is ignored.
    ///
    /// # Errors
    /// See [`spawn`](Self::spawn).
    pub fn spawn_with_source(
        config: &WranglerConfig,
        sphere: Arc<EwaldSphere>,
        source: Box<dyn FrameSource>,
    ) -> Result<Self> {
        let base_poni = Poni::from_file(&config.poni_file)?;
        let detector = config.resolved_detector()?;
        if let Some(th_mtr) = &config.th_mtr {
            sphere.set_th_mtr(th_mtr.clone());
        }

        let (command_tx, command_rx) = sync_channel(config.queue_capacity);
        let (signal_tx, signal_rx) = sync_channel(config.queue_capacity);
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let worker = Worker {
            source,
            sphere,
            base_poni,
            poni_file: config.poni_file.clone(),
            detector,
            motors: config.rotation_motors.clone(),
            metadata: config.metadata,
            timeout: config.timeout(),
            poll: config.poll_interval(),
            commands: command_rx,
            signals: signal_tx,
            state: Arc::clone(&state),
        };
        let handle = thread::Builder::new()
            .name("ewald-wrangler".to_string())
            .spawn(move || worker.run())?;
        log::info!("wrangler started, timeout {:?}", config.timeout());
        Ok(Self {
            commands: Some(command_tx),
            signals: signal_rx,
            state,
            handle: Some(handle),
        })
    }

    /// Queues `command` for the worker.
    ///
    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or(Error::Disconnected)?
            .send(command)
            .map_err(|_| Error::Disconnected)
    }

    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Continue)
    }

    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn terminate(&self) -> Result<()> {
        self.send(Command::Terminate)
    }

    /// Next signal, if one is queued.
    #[must_use]
    pub fn try_signal(&self) -> Option<Signal> {
        self.signals.try_recv().ok()
    }

    /// Waits up to `timeout` for the next signal.
    ///
    /// # Errors
    /// Returns [`Error::Disconnected`] once the worker has exited and every
    /// signal has been read.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Signal>> {
        match self.signals.recv_timeout(timeout) {
            Ok(signal) => Ok(Some(signal)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Current phase of the worker.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// True once the worker thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the worker to exit on its own, returning every signal it
    /// emitted that had not been read yet.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the worker panicked.
    pub fn join(mut self) -> Result<Vec<Signal>> {
        let mut drained = Vec::new();
        while let Ok(signal) = self.signals.recv() {
            drained.push(signal);
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::InvalidState("wrangler worker panicked".to_string()))?;
        }
        Ok(drained)
    }
}

impl Drop for Wrangler {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Disconnecting the command queue terminates the worker; draining
        // the signals unblocks it if the queue is full.
        self.commands = None;
        while self.signals.recv().is_ok() {}
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ewald_core::Detector;
    use tempfile::tempdir;

    struct Never;

    impl FrameSource for Never {
        fn next_frame(&mut self) -> Result<Poll> {
            Ok(Poll::Pending)
        }
    }

    fn setup(dir: &std::path::Path) -> (WranglerConfig, Arc<EwaldSphere>) {
        let poni = Poni {
            dist: 0.2,
            detector: Detector::pilatus_100k(),
            ..Poni::default()
        };
        let poni_file = dir.join("cal.poni");
        std::fs::write(&poni_file, poni.to_file_string()).unwrap();
        let config = WranglerConfig::default()
            .with_poni_file(poni_file)
            .with_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(10));
        let sphere = EwaldSphere::new("scan", dir.join("scan.h5")).create().unwrap();
        (config, Arc::new(sphere))
    }

    #[test]
    fn test_pause_resume_terminate() {
        let dir = tempdir().unwrap();
        let (config, sphere) = setup(dir.path());
        let wrangler = Wrangler::spawn_with_source(&config, sphere, Box::new(Never)).unwrap();
        wrangler.pause().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while wrangler.state() != WorkerState::Paused && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(wrangler.state(), WorkerState::Paused);
        wrangler.resume().unwrap();
        wrangler.terminate().unwrap();
        let signals = wrangler.join().unwrap();
        assert_eq!(signals, vec![Signal::Terminate]);
    }

    #[test]
    fn test_drop_stops_worker() {
        let dir = tempdir().unwrap();
        let (config, sphere) = setup(dir.path());
        let wrangler = Wrangler::spawn_with_source(&config, sphere, Box::new(Never)).unwrap();
        drop(wrangler);
    }

    #[test]
    fn test_missing_calibration() {
        let dir = tempdir().unwrap();
        let (config, sphere) = setup(dir.path());
        let config = config.with_poni_file(dir.path().join("absent.poni"));
        assert!(Wrangler::spawn(&config, sphere).is_err());
    }
}
