// Display event pump
//
// A small calloop loop multiplexing the DRM fd (page flip completions),
// the out-fence of the in-flight commit and, optionally, stdin as a stop
// request. Strategies block on it through `wait_until`.

use std::{
    collections::VecDeque,
    io::{self, IsTerminal},
    os::fd::OwnedFd,
    time::{Duration, Instant},
};

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::{
        calloop::{generic::Generic, EventLoop, Interest, Mode, PostAction, RegistrationToken},
        drm::control::{crtc, Device as ControlDevice, Event as DrmEvent},
    },
};
use tracing::{debug, trace, warn};

/// A page flip completion reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: crtc::Handle,
    pub sequence: u32,
    pub time: Duration,
}

#[derive(Debug, Default)]
pub struct EventState {
    flips: VecDeque<FlipEvent>,
    fence_generation: u64,
    fence_signaled: bool,
    interrupted: bool,
}

impl EventState {
    pub fn has_flip(&self, crtc: crtc::Handle) -> bool {
        self.flips.iter().any(|flip| flip.crtc == crtc)
    }

    pub fn fence_signaled(&self) -> bool {
        self.fence_signaled
    }
}

pub struct DisplayEvents {
    event_loop: EventLoop<'static, EventState>,
    state: EventState,
    fence: Option<RegistrationToken>,
}

impl std::fmt::Debug for DisplayEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayEvents")
            .field("state", &self.state)
            .field("fence", &self.fence)
            .finish()
    }
}

fn loop_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(err.to_string())
}

impl DisplayEvents {
    pub fn new() -> io::Result<Self> {
        let event_loop = EventLoop::try_new().map_err(loop_error)?;
        Ok(Self {
            event_loop,
            state: EventState::default(),
            fence: None,
        })
    }

    /// Collects page flip events from `fd`.
    pub fn watch_drm(&mut self, fd: &DrmDeviceFd) -> io::Result<()> {
        let drm = fd.clone();
        self.event_loop
            .handle()
            .insert_source(
                Generic::new(fd.clone(), Interest::READ, Mode::Level),
                move |_, _, state: &mut EventState| {
                    for event in drm.receive_events()? {
                        match event {
                            DrmEvent::PageFlip(flip) => {
                                trace!(crtc = ?flip.crtc, frame = flip.frame, "page flip");
                                state.flips.push_back(FlipEvent {
                                    crtc: flip.crtc,
                                    sequence: flip.frame,
                                    time: flip.duration,
                                });
                            }
                            DrmEvent::Vblank(_) => {}
                            DrmEvent::Unknown(_) => debug!("unknown DRM event"),
                        }
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| loop_error(err.error))?;
        Ok(())
    }

    /// Treats any input on a terminal stdin as a stop request.
    /// Returns false when stdin is not a terminal.
    pub fn watch_input(&mut self) -> io::Result<bool> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a terminal, not watching for input");
            return Ok(false);
        }
        self.event_loop
            .handle()
            .insert_source(
                Generic::new(stdin, Interest::READ, Mode::Level),
                |_, _, state: &mut EventState| {
                    debug!("input on stdin, stopping");
                    state.interrupted = true;
                    Ok(PostAction::Remove)
                },
            )
            .map_err(|err| loop_error(err.error))?;
        Ok(true)
    }

    /// Starts waiting on `fence`, replacing any fence watched before.
    pub fn watch_fence(&mut self, fence: OwnedFd) -> io::Result<()> {
        self.clear_fence();
        self.state.fence_generation += 1;
        let generation = self.state.fence_generation;
        let token = self
            .event_loop
            .handle()
            .insert_source(
                Generic::new(fence, Interest::READ, Mode::OneShot),
                move |_, _, state: &mut EventState| {
                    if state.fence_generation == generation {
                        state.fence_signaled = true;
                    }
                    Ok(PostAction::Remove)
                },
            )
            .map_err(|err| loop_error(err.error))?;
        self.fence = Some(token);
        Ok(())
    }

    /// Forgets the watched fence. A signalled one already removed itself.
    pub fn clear_fence(&mut self) {
        if let Some(token) = self.fence.take() {
            if !self.state.fence_signaled {
                self.event_loop.handle().remove(token);
            }
        }
        self.state.fence_signaled = false;
    }

    pub fn take_flip(&mut self, crtc: crtc::Handle) -> Option<FlipEvent> {
        let index = self.state.flips.iter().position(|flip| flip.crtc == crtc)?;
        self.state.flips.remove(index)
    }

    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.state.interrupted)
    }

    /// Dispatches events until `done` holds, the user interrupts, or
    /// `timeout` expires. `None` waits without limit.
    pub fn wait_until(
        &mut self,
        timeout: Option<Duration>,
        mut done: impl FnMut(&EventState) -> bool,
    ) -> io::Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if done(&self.state) {
                return Ok(true);
            }
            if self.state.interrupted {
                return Ok(false);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.event_loop
                .dispatch(remaining, &mut self.state)
                .map_err(loop_error)?;
            if done(&self.state) {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
        }
    }

    /// Handles whatever is ready without blocking.
    pub fn poll(&mut self) -> io::Result<()> {
        if let Err(err) = self.event_loop.dispatch(Some(Duration::ZERO), &mut self.state) {
            warn!("event dispatch failed: {err}");
            return Err(loop_error(err));
        }
        Ok(())
    }
}
