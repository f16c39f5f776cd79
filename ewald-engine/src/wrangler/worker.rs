//! Background ingest loop.

use super::source::{Frame, FrameSource, Poll};
use super::{Command, Signal};
use crate::arch::EwaldArch;
use crate::error::{Error, Result};
use crate::sphere::{AddArchOptions, EwaldSphere};
use crate::state::WorkerState;
use ewald_core::{Poni, RotationMotors};
use ewald_formats::{read_metadata, DetectorConfig, MetadataKind};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const TIMEOUT_MESSAGE: &str = "Timeout occurred";
pub(crate) const COMPLETE_MESSAGE: &str = "Scan complete";

/// Why the loop ended.
#[derive(Debug)]
enum Exit {
    Stopped,
    Terminated,
    Finished,
    TimedOut,
    Failed(Error),
}

pub(crate) struct Worker {
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) sphere: Arc<EwaldSphere>,
    pub(crate) base_poni: Poni,
    pub(crate) poni_file: PathBuf,
    pub(crate) detector: DetectorConfig,
    pub(crate) motors: RotationMotors,
    pub(crate) metadata: MetadataKind,
    pub(crate) timeout: Duration,
    pub(crate) poll: Duration,
    pub(crate) commands: Receiver<Command>,
    pub(crate) signals: SyncSender<Signal>,
    pub(crate) state: Arc<Mutex<WorkerState>>,
}

impl Worker {
    /// Runs until the source is exhausted, the timeout expires, a command
    /// ends the run or a frame fails with an unrecoverable error. Always
    /// finishes with a [`Signal::Terminate`].
    pub(crate) fn run(mut self) {
        let exit = self.run_loop();
        self.set_state(WorkerState::Terminating);
        match exit {
            Exit::Finished => self.emit(Signal::Message(COMPLETE_MESSAGE.to_string())),
            Exit::TimedOut => {
                log::warn!("wrangler: no frame within {:?}", self.timeout);
                self.emit(Signal::Message(TIMEOUT_MESSAGE.to_string()));
            }
            Exit::Failed(e) => {
                log::error!("wrangler: {e}");
                self.emit(Signal::Message(e.to_string()));
            }
            Exit::Stopped | Exit::Terminated => {}
        }
        self.emit(Signal::Terminate);
        while self.commands.try_recv().is_ok() {}
        log::debug!("wrangler: worker exited ({exit:?})");
    }

    fn run_loop(&mut self) -> Exit {
        let mut pending: Option<Frame> = None;
        let mut clock = Instant::now();
        let mut paused = false;
        let mut idle = false;
        loop {
            let command = if idle || paused {
                match self.commands.recv_timeout(self.poll) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return Exit::Terminated,
                }
            } else {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => return Exit::Terminated,
                }
            };
            match command {
                Some(Command::Terminate) => return Exit::Terminated,
                Some(Command::Stop) => return Exit::Stopped,
                Some(Command::Pause) => {
                    paused = true;
                    self.set_state(WorkerState::Paused);
                }
                Some(Command::Continue) => paused = false,
                None => {}
            }
            if paused {
                // Time spent paused does not count towards the timeout.
                clock = Instant::now();
                continue;
            }

            if pending.is_none() {
                self.set_state(WorkerState::Waiting);
                match self.source.next_frame() {
                    Ok(Poll::Ready(frame)) => pending = Some(frame),
                    Ok(Poll::Pending) => {}
                    Ok(Poll::Finished) => return Exit::Finished,
                    Err(e) => return Exit::Failed(e),
                }
            }

            idle = true;
            if let Some(frame) = pending.take() {
                match self.process(&frame) {
                    Ok(()) => {
                        self.emit(Signal::Update(frame.idx));
                        clock = Instant::now();
                        idle = false;
                    }
                    Err(e) if e.is_recoverable() => {
                        log::debug!("wrangler: frame {} not ready: {e}", frame.idx);
                        pending = Some(frame);
                    }
                    Err(e) => return Exit::Failed(e),
                }
            }
            if idle && clock.elapsed() >= self.timeout {
                return Exit::TimedOut;
            }
        }
    }

    fn process(&mut self, frame: &Frame) -> Result<()> {
        log::debug!("wrangler: frame {} from {}", frame.idx, frame.image_path.display());
        self.set_state(WorkerState::Reading);
        let image = self.detector.read_frame(&frame.image_path)?;
        let scan_info = read_metadata(&frame.image_path, self.metadata)?;
        let poni = self.base_poni.with_rotation_offsets(&self.motors, &scan_info)?;
        let mut arch = EwaldArch::new(frame.idx, image, poni)
            .with_scan_info(scan_info)
            .with_poni_file(Some(self.poni_file.clone()))
            .with_geometry(self.sphere.is_static(), self.sphere.is_gi())
            .with_th_mtr(self.sphere.th_mtr());

        // Integration runs outside the sphere lock so readers are not
        // blocked while a frame is binned. add_arch redoes it if the
        // sphere's arguments changed in the meantime.
        self.set_state(WorkerState::Integrating);
        let mask = self.sphere.global_mask();
        arch.integrate_1d(&self.sphere.bai_1d_args(), mask.as_deref())?;
        arch.integrate_2d(&self.sphere.bai_2d_args(), mask.as_deref())?;

        self.set_state(WorkerState::Persisting);
        self.sphere
            .add_arch(arch, AddArchOptions::default().with_calculate(false))?;
        log::debug!("wrangler: frame {} stored", frame.idx);
        Ok(())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn emit(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }
}
