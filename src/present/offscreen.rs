// Offscreen presentation: no display, a submitted frame retires on the next poll.

use std::time::Duration;

use tracing::debug;

use super::{
    DisplayEvents, PendingPresentation, PresentState, PresentationStrategy, Retired, Submission,
};
use crate::{buffer::BufferId, error::PresentError};

#[derive(Debug)]
pub struct OffscreenPresenter {
    budget: Duration,
    nonblocking: bool,
    events: Option<DisplayEvents>,
    state: PresentState,
}

impl OffscreenPresenter {
    pub fn new(budget: Duration, nonblocking: bool, events: Option<DisplayEvents>) -> Self {
        Self {
            budget,
            nonblocking,
            events,
            state: PresentState::default(),
        }
    }
}

impl PresentationStrategy for OffscreenPresenter {
    fn name(&self) -> &'static str {
        "offscreen"
    }

    fn initialize(&mut self, primer: &mut Submission) -> Result<(), PresentError> {
        // the renderer already waited for the GPU
        primer.fence.take();
        self.state.set_front(primer.buffer, primer.frame);
        Ok(())
    }

    fn submit(&mut self, submission: &mut Submission) -> Result<(), PresentError> {
        self.state.ensure_idle()?;
        submission.fence.take();
        debug!(frame = submission.frame, buffer = %submission.buffer, "offscreen frame done");
        self.state.queue(submission.buffer, submission.frame, false);
        Ok(())
    }

    fn poll_retired(&mut self, _timeout: Option<Duration>) -> Result<Option<Retired>, PresentError> {
        if let Some(events) = self.events.as_mut() {
            events.poll().map_err(|err| PresentError::Rejected {
                reason: "failed to read input".into(),
                source: Some(err),
            })?;
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
        self.nonblocking
    }

    fn frame_budget(&self) -> Duration {
        self.budget
    }

    fn take_interrupt(&mut self) -> bool {
        self.events
            .as_mut()
            .is_some_and(|events| events.take_interrupt())
    }
}
