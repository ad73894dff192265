// Presentation strategies
//
// Everything that hands a rendered buffer to the display lives behind
// `PresentationStrategy`:
// - `legacy`: one blocking modeset, then page flips with a completion event
// - `atomic`: property transactions, optionally fenced and non-blocking
// - `offscreen`: no display at all, every frame retires immediately
//
// All of them keep at most one presentation pending per CRTC (`PresentState`).

pub mod atomic;
pub mod events;
pub mod legacy;
pub mod offscreen;

use std::{
    os::fd::OwnedFd,
    time::{Duration, Instant},
};

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Mode},
};
use tracing::{debug, trace, warn};

use crate::{buffer::BufferId, error::PresentError};

pub use events::DisplayEvents;

/// Which presentation strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Legacy,
    Atomic,
}

/// A rendered buffer on its way to the display.
#[derive(Debug)]
pub struct Submission {
    pub buffer: BufferId,
    pub frame: u64,
    /// Scan-out handle, absent for buffers that never reach a display.
    pub framebuffer: Option<framebuffer::Handle>,
    /// Signalled when the GPU finished drawing into `buffer`.
    pub fence: Option<OwnedFd>,
}

impl Submission {
    pub(crate) fn framebuffer(&self) -> Result<framebuffer::Handle, PresentError> {
        self.framebuffer.ok_or_else(|| {
            PresentError::rejected(format!("buffer {} has no scan-out framebuffer", self.buffer))
        })
    }
}

/// The one presentation that was submitted but has not retired yet.
#[derive(Debug, Clone)]
pub struct PendingPresentation {
    pub buffer: BufferId,
    pub frame: u64,
    pub submitted_at: Instant,
    /// Completion is tracked through a KMS out-fence instead of an event.
    pub fenced: bool,
}

/// A presentation reached the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retired {
    pub frame: u64,
    /// Buffer now being scanned out.
    pub buffer: BufferId,
    /// Buffer the display stopped reading, safe to draw into again.
    pub released: Option<BufferId>,
    pub latency: Duration,
}

/// Contract shared by every presentation strategy.
pub trait PresentationStrategy {
    fn name(&self) -> &'static str;

    /// One-time display setup, showing `primer` as the first image.
    fn initialize(&mut self, primer: &mut Submission) -> Result<(), PresentError>;

    /// Queues `submission` for the next vblank. Returns `Busy` while a
    /// previous presentation is pending. The fence is only taken on success.
    fn submit(&mut self, submission: &mut Submission) -> Result<(), PresentError>;

    /// Waits up to `timeout` (forever for `None`) for the pending
    /// presentation to retire.
    fn poll_retired(&mut self, timeout: Option<Duration>) -> Result<Option<Retired>, PresentError>;

    fn pending(&self) -> Option<&PendingPresentation>;

    /// Returns every buffer the strategy still holds, pending or on screen.
    fn drain(&mut self) -> Vec<BufferId>;

    fn is_nonblocking(&self) -> bool;

    /// Time between two vblanks of the output.
    fn frame_budget(&self) -> Duration;

    /// Whether the user asked to stop since the last call.
    fn take_interrupt(&mut self) -> bool {
        false
    }

    fn submit_and_wait(
        &mut self,
        submission: &mut Submission,
        timeout: Duration,
    ) -> Result<Retired, PresentError> {
        self.submit(submission)?;
        self.poll_retired(Some(timeout))?
            .ok_or(PresentError::Timeout(timeout))
    }
}

/// Pending/front bookkeeping shared by the strategies.
#[derive(Debug, Default)]
pub struct PresentState {
    pending: Option<PendingPresentation>,
    front: Option<(BufferId, u64)>,
}

impl PresentState {
    pub fn pending(&self) -> Option<&PendingPresentation> {
        self.pending.as_ref()
    }

    pub fn front(&self) -> Option<BufferId> {
        self.front.map(|(id, _)| id)
    }

    pub fn ensure_idle(&self) -> Result<(), PresentError> {
        match &self.pending {
            Some(pending) => {
                trace!(frame = pending.frame, "presentation still pending");
                Err(PresentError::Busy)
            }
            None => Ok(()),
        }
    }

    /// Records the image shown by the initial modeset.
    pub fn set_front(&mut self, buffer: BufferId, frame: u64) {
        self.front = Some((buffer, frame));
    }

    pub fn queue(&mut self, buffer: BufferId, frame: u64, fenced: bool) {
        debug_assert!(self.pending.is_none(), "second presentation queued");
        self.pending = Some(PendingPresentation {
            buffer,
            frame,
            submitted_at: Instant::now(),
            fenced,
        });
    }

    /// The pending presentation became the front buffer.
    pub fn complete(&mut self) -> Option<Retired> {
        let pending = self.pending.take()?;
        let released = self
            .front
            .replace((pending.buffer, pending.frame))
            .map(|(id, _)| id);
        Some(Retired {
            frame: pending.frame,
            buffer: pending.buffer,
            released,
            latency: pending.submitted_at.elapsed(),
        })
    }

    pub fn drain(&mut self) -> Vec<BufferId> {
        let mut held = Vec::with_capacity(2);
        if let Some(pending) = self.pending.take() {
            held.push(pending.buffer);
        }
        if let Some((front, _)) = self.front.take() {
            held.push(front);
        }
        held
    }
}

/// CRTC state found before we took over, put back on teardown.
#[derive(Debug, Clone)]
pub struct SavedCrtc {
    crtc: crtc::Handle,
    connector: connector::Handle,
    framebuffer: Option<framebuffer::Handle>,
    mode: Option<Mode>,
    position: (u32, u32),
}

impl SavedCrtc {
    pub fn capture(fd: &DrmDeviceFd, crtc: crtc::Handle, connector: connector::Handle) -> Option<Self> {
        match fd.get_crtc(crtc) {
            Ok(info) => Some(Self {
                crtc,
                connector,
                framebuffer: info.framebuffer(),
                mode: info.mode(),
                position: info.position(),
            }),
            Err(err) => {
                warn!("failed to read CRTC {crtc:?} state: {err}");
                None
            }
        }
    }

    pub fn restore(&self, fd: &DrmDeviceFd) {
        if self.framebuffer.is_none() || self.mode.is_none() {
            debug!("CRTC {:?} was idle before, leaving it as is", self.crtc);
            return;
        }
        match fd.set_crtc(
            self.crtc,
            self.framebuffer,
            self.position,
            &[self.connector],
            self.mode,
        ) {
            Ok(()) => debug!("restored CRTC {:?}", self.crtc),
            Err(err) => warn!("failed to restore CRTC {:?}: {err}", self.crtc),
        }
    }
}

/// Blocks until `fence` signals, for strategies that cannot hand it to the kernel.
pub(crate) fn wait_fence(
    events: &mut DisplayEvents,
    fence: OwnedFd,
    timeout: Duration,
) -> Result<(), PresentError> {
    events
        .watch_fence(fence)
        .map_err(|err| PresentError::Rejected {
            reason: "failed to watch render fence".into(),
            source: Some(err),
        })?;
    let signaled = events
        .wait_until(Some(timeout), |state| state.fence_signaled())
        .map_err(|err| PresentError::Rejected {
            reason: "failed to wait for render fence".into(),
            source: Some(err),
        })?;
    if signaled {
        events.clear_fence();
        Ok(())
    } else {
        Err(PresentError::Timeout(timeout))
    }
}
