//! Collaborators telling the sink where to display and whether to display at
//! all, and the thread polling them.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use crate::device::DisplayDevice;
use crate::Rect;

use super::SinkController;

/// Source of the area of the display frames should be shown into, e.g. the
/// window a video is embedded in.
pub trait GeometryProvider {
    /// Returns the current target rectangle, or `None` if it is not known yet.
    fn target_rect(&mut self) -> anyhow::Result<Option<Rect>>;
}

/// Tells whether the display is currently unavailable.
pub trait SuspendSignal {
    fn is_suspended(&mut self) -> anyhow::Result<bool>;
}

/// Reads the display mode from a policy file: a mode of 0 means the display
/// is available, any other value suspends the sink.
pub struct PolicyFileSignal {
    path: PathBuf,
}

impl PolicyFileSignal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PolicyFileSignal {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the mode currently written in the policy file.
    pub fn mode(&self) -> anyhow::Result<i32> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read policy file {}", self.path.display()))?;
        let mode = content.trim();
        mode.parse()
            .with_context(|| format!("invalid mode {:?} in {}", mode, self.path.display()))
    }
}

impl SuspendSignal for PolicyFileSignal {
    fn is_suspended(&mut self) -> anyhow::Result<bool> {
        Ok(self.mode()? != 0)
    }
}

/// Thread periodically polling a [`SuspendSignal`] and the geometry provider
/// of a sink, suspending and resuming it accordingly.
///
/// The thread is stopped and joined when the monitor is dropped.
pub struct Monitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn spawn<D, S>(
        sink: SinkController<D>,
        mut signal: S,
        interval: Duration,
    ) -> io::Result<Self>
    where
        D: DisplayDevice,
        S: SuspendSignal + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("V4L2 Sink Monitor".into())
            .spawn(move || {
                debug!("Monitor thread started");
                while thread_running.load(Ordering::Acquire) {
                    match signal.is_suspended() {
                        Ok(true) if !sink.is_suspended() => {
                            sink.suspend();
                        }
                        Ok(false) if sink.is_suspended() => sink.resume(),
                        Ok(_) => (),
                        Err(e) => warn!("Cannot poll suspend signal: {:#}", e),
                    }
                    sink.refresh_geometry();
                    thread::sleep(interval);
                }
                debug!("Monitor thread exiting");
            })?;

        Ok(Monitor {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the monitor thread and wait for it to finish.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Monitor thread panicked");
            } else {
                info!("Monitor stopped");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.join();
    }
}
