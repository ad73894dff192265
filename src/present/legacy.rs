// Legacy KMS presentation: SETCRTC once, then PAGE_FLIP with an event per frame.

use std::time::Duration;

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::control::{Device as ControlDevice, Mode, PageFlipFlags},
};
use tracing::{debug, info, trace, warn};

use super::{
    wait_fence, DisplayEvents, PendingPresentation, PresentState, PresentationStrategy, Retired,
    SavedCrtc, Submission,
};
use crate::{
    buffer::BufferId,
    display::{DisplayConfig, Routing},
    error::{ConfigurationError, PresentError},
};

#[derive(Debug)]
pub struct LegacyPresenter {
    fd: DrmDeviceFd,
    routing: Routing,
    mode: Mode,
    budget: Duration,
    fence_timeout: Duration,
    events: DisplayEvents,
    state: PresentState,
    saved: Option<SavedCrtc>,
}

impl LegacyPresenter {
    pub fn new(
        fd: DrmDeviceFd,
        config: &DisplayConfig,
        mut events: DisplayEvents,
        nonblocking: bool,
        fence_timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        let routing = config
            .routing
            .clone()
            .ok_or(ConfigurationError::Unsupported("legacy presentation without an output"))?;
        let mode = config.mode.raw().ok_or(ConfigurationError::MissingMode)?;
        if nonblocking {
            warn!("non-blocking presentation needs atomic modesetting, ignoring");
        }
        events
            .watch_drm(&fd)
            .map_err(ConfigurationError::device("DRM events"))?;

        Ok(Self {
            fd,
            routing,
            mode,
            budget: config.frame_budget(),
            fence_timeout,
            events,
            state: PresentState::default(),
            saved: None,
        })
    }

    fn wait_render(&mut self, submission: &mut Submission) -> Result<(), PresentError> {
        // flips rely on implicit sync; an explicit fence is simply waited for
        if let Some(fence) = submission.fence.take() {
            wait_fence(&mut self.events, fence, self.fence_timeout)?;
        }
        Ok(())
    }
}

impl PresentationStrategy for LegacyPresenter {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn initialize(&mut self, primer: &mut Submission) -> Result<(), PresentError> {
        let fb = primer.framebuffer()?;
        self.wait_render(primer)?;

        self.saved = SavedCrtc::capture(&self.fd, self.routing.crtc, self.routing.connector);
        self.fd
            .set_crtc(
                self.routing.crtc,
                Some(fb),
                (0, 0),
                &[self.routing.connector],
                Some(self.mode),
            )
            .map_err(|err| PresentError::from_commit("failed to set mode", err))?;

        info!(
            connector = %self.routing.connector_name,
            crtc = ?self.routing.crtc,
            "mode set"
        );
        self.state.set_front(primer.buffer, primer.frame);
        Ok(())
    }

    fn submit(&mut self, submission: &mut Submission) -> Result<(), PresentError> {
        self.state.ensure_idle()?;
        let fb = submission.framebuffer()?;
        self.wait_render(submission)?;

        self.fd
            .page_flip(self.routing.crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(|err| PresentError::from_commit("failed to queue page flip", err))?;
        debug!(frame = submission.frame, buffer = %submission.buffer, "page flip queued");
        self.state.queue(submission.buffer, submission.frame, false);
        Ok(())
    }

    fn poll_retired(&mut self, timeout: Option<Duration>) -> Result<Option<Retired>, PresentError> {
        if self.state.pending().is_none() {
            return Ok(None);
        }
        let crtc = self.routing.crtc;
        let flipped = self
            .events
            .wait_until(timeout, |state| state.has_flip(crtc))
            .map_err(|err| PresentError::Rejected {
                reason: "failed to read DRM events".into(),
                source: Some(err),
            })?;
        if !flipped {
            return Ok(None);
        }
        if let Some(flip) = self.events.take_flip(crtc) {
            trace!(sequence = flip.sequence, time = ?flip.time, "page flip completed");
        }
        Ok(self.state.complete())
    }

    fn pending(&self) -> Option<&PendingPresentation> {
        self.state.pending()
    }

    fn drain(&mut self) -> Vec<BufferId> {
        self.state.drain()
    }

    fn is_nonblocking(&self) -> bool {
        false
    }

    fn frame_budget(&self) -> Duration {
        self.budget
    }

    fn take_interrupt(&mut self) -> bool {
        self.events.take_interrupt()
    }
}

impl Drop for LegacyPresenter {
    fn drop(&mut self) {
        // a flip still in flight keeps scanning out our framebuffer
        if self.state.pending().is_some() {
            let crtc = self.routing.crtc;
            let _ = self
                .events
                .wait_until(Some(self.budget * 2), |state| state.has_flip(crtc));
        }
        if let Some(saved) = self.saved.take() {
            saved.restore(&self.fd);
        }
    }
}
