// Frame scheduler
//
// Single-threaded run loop driving Init -> {Rendering -> Presenting -> Retiring}* -> Done.
//
// - frame 0 is rendered and shown by the strategy's `initialize`
// - a buffer goes Free -> Rendering -> Ready -> Presenting and only returns
//   to Free once the display reports it stopped scanning it out
// - `Busy` from the strategy never escapes: it is answered with a bounded
//   wait for retirement, and too many in a row end the run with
//   `RetirementTimeout`
// - on failure every buffer is reclaimed before returning

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use fps_ticker::Fps;
use tracing::{debug, info, trace, warn};

use crate::{
    buffer::{BufferId, BufferProvider},
    error::{PipelineError, PresentError},
    present::{PresentationStrategy, Retired, Submission},
    render::RenderBackend,
};

pub const DEFAULT_RETIRE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_BUSY_RETRY_LIMIT: u32 = 240;
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLimit {
    #[default]
    Unbounded,
    Frames(u64),
}

impl FrameLimit {
    pub fn reached(self, rendered: u64) -> bool {
        match self {
            FrameLimit::Unbounded => false,
            FrameLimit::Frames(limit) => rendered >= limit,
        }
    }
}

impl From<Option<u64>> for FrameLimit {
    fn from(frames: Option<u64>) -> Self {
        frames.map_or(FrameLimit::Unbounded, FrameLimit::Frames)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub limit: FrameLimit,
    /// Longest blocking wait for one retirement.
    pub retire_timeout: Duration,
    /// Consecutive `Busy` answers tolerated without a retirement.
    pub busy_retry_limit: u32,
    pub report_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            limit: FrameLimit::Unbounded,
            retire_timeout: DEFAULT_RETIRE_TIMEOUT,
            busy_retry_limit: DEFAULT_BUSY_RETRY_LIMIT,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// Asks a running scheduler to stop after the frame in progress.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub rendered: u64,
    /// Frames handed to the display, including the initial modeset.
    pub presented: u64,
    pub retired: u64,
    pub busy_retries: u64,
    /// Longest delay between a submission and its retirement.
    pub max_latency: Duration,
    pub elapsed: Duration,
    /// Longest gap between two retirements among the recent frames.
    pub max_frametime: Duration,
    /// Average over the recent retirements, 0 when too short to tell.
    pub fps: f64,
    pub interrupted: bool,
}

/// Frame rate of the retirements, with a fixed window for the periodic report.
struct FrameRate {
    ticker: Fps,
    interval: Duration,
    window_start: Option<Instant>,
    window_frames: u64,
}

impl FrameRate {
    fn new(interval: Duration) -> Self {
        Self {
            ticker: Fps::default(),
            interval,
            window_start: None,
            window_frames: 0,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<(u64, f64)> {
        self.ticker.tick();
        self.window(now)
    }

    /// Counts a retirement at `now`. Returns `(frames, secs)` when a window closed.
    fn window(&mut self, now: Instant) -> Option<(u64, f64)> {
        let Some(window_start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        self.window_frames += 1;

        let elapsed = now.duration_since(window_start);
        if elapsed < self.interval {
            return None;
        }
        let report = (self.window_frames, elapsed.as_secs_f64());
        self.window_start = Some(now);
        self.window_frames = 0;
        Some(report)
    }
}

pub struct FrameScheduler<'a, P, R: ?Sized, S: ?Sized> {
    ring: &'a mut P,
    renderer: &'a mut R,
    presenter: &'a mut S,
    options: SchedulerOptions,
    stop: StopHandle,
    stopped: bool,
    frame: u64,
    busy_streak: u32,
    stats: FrameStats,
    rate: FrameRate,
}

impl<'a, P, R, S> FrameScheduler<'a, P, R, S>
where
    P: BufferProvider,
    R: RenderBackend<P::Buffer> + ?Sized,
    S: PresentationStrategy + ?Sized,
{
    pub fn new(
        ring: &'a mut P,
        renderer: &'a mut R,
        presenter: &'a mut S,
        options: SchedulerOptions,
    ) -> Self {
        let rate = FrameRate::new(options.report_interval);
        Self {
            ring,
            renderer,
            presenter,
            options,
            stop: StopHandle::default(),
            stopped: false,
            frame: 0,
            busy_streak: 0,
            stats: FrameStats::default(),
            rate,
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Runs until the frame limit, a stop request or the first fatal error.
    pub fn run(mut self) -> Result<FrameStats, PipelineError> {
        let start = Instant::now();
        let result = self.run_frames();
        self.stats.elapsed = start.elapsed();
        // the ticker needs two retirements for an interval
        if self.stats.retired > 1 {
            self.stats.fps = self.rate.ticker.avg();
            self.stats.max_frametime = self.rate.ticker.max_frametime();
        }

        match result {
            Ok(()) => {
                self.finish();
                info!(
                    frames = self.stats.rendered,
                    retired = self.stats.retired,
                    busy = self.stats.busy_retries,
                    "done after {:.2?}, {:.3} FPS",
                    self.stats.elapsed,
                    self.stats.fps
                );
                Ok(self.stats)
            }
            Err(err) => {
                warn!(frame = self.frame, "frame loop failed: {err}");
                self.presenter.drain();
                self.ring.reclaim_all();
                Err(err)
            }
        }
    }

    fn nonblocking(&self) -> bool {
        self.presenter.is_nonblocking()
    }

    fn stop_requested(&mut self) -> bool {
        if !self.stopped && (self.stop.is_stopped() || self.presenter.take_interrupt()) {
            info!(frame = self.frame, "stop requested");
            self.stopped = true;
            self.stats.interrupted = true;
        }
        self.stopped
    }

    /// How long one retirement wait may take.
    fn wait_slice(&self) -> Duration {
        if self.nonblocking() {
            self.presenter.frame_budget() / 4
        } else {
            self.options.retire_timeout
        }
    }

    fn run_frames(&mut self) -> Result<(), PipelineError> {
        if self.options.limit.reached(0) || self.stop_requested() {
            debug!("nothing to render");
            return Ok(());
        }

        // Init
        let Some(mut primer) = self.render_next()? else {
            return Ok(());
        };
        {
            profiling::scope!("initialize");
            self.presenter
                .initialize(&mut primer)
                .map_err(|source| PipelineError::PresentationRejected {
                    frame: primer.frame,
                    source,
                })?;
        }
        // the modeset puts the primer on screen before returning
        self.stats.presented += 1;
        self.count_retirement();
        info!(strategy = self.presenter.name(), "display initialized");

        loop {
            if self.options.limit.reached(self.frame) || self.stop_requested() {
                return Ok(());
            }

            // Rendering
            let Some(mut submission) = self.render_next()? else {
                return Ok(());
            };

            // Presenting
            if !self.present(&mut submission)? {
                self.ring.release(submission.buffer);
                return Ok(());
            }

            // Retiring
            if !self.nonblocking() {
                self.wait_retirement(submission.frame)?;
            }
        }
    }

    /// Acquires a buffer and draws the next frame into it.
    fn render_next(&mut self) -> Result<Option<Submission>, PipelineError> {
        let frame = self.frame;
        let Some(id) = self.acquire(frame)? else {
            return Ok(None);
        };

        let outcome = {
            profiling::scope!("render");
            self.renderer.draw_frame(self.ring.buffer_mut(id), frame)?
        };
        self.ring.finish_rendering(id)?;
        let framebuffer = self.ring.resolve_scanout_handle(id)?;
        self.ring.mark_presenting(id)?;

        trace!(frame, buffer = %id, "frame rendered");
        self.frame += 1;
        self.stats.rendered += 1;
        Ok(Some(Submission {
            buffer: id,
            frame,
            framebuffer,
            fence: outcome.fence,
        }))
    }

    /// A free buffer, waiting for retirements while the ring is empty.
    fn acquire(&mut self, frame: u64) -> Result<Option<BufferId>, PipelineError> {
        let start = Instant::now();
        let mut attempts = 0;
        loop {
            if let Some(id) = self.ring.acquire_writable() {
                return Ok(Some(id));
            }
            if self.presenter.pending().is_none() {
                return Err(PipelineError::ResourceExhaustion {
                    ring: self.ring.len(),
                });
            }

            attempts += 1;
            trace!(frame, attempts, "no free buffer, waiting for retirement");
            if self.retire(Some(self.wait_slice()))? {
                continue;
            }
            if self.stop_requested() {
                return Ok(None);
            }
            if !self.nonblocking() || attempts >= self.options.busy_retry_limit {
                return Err(PipelineError::RetirementTimeout {
                    frame,
                    attempts,
                    waited: start.elapsed(),
                });
            }
        }
    }

    /// Submits `submission`, absorbing `Busy`. Returns false if stopped first.
    fn present(&mut self, submission: &mut Submission) -> Result<bool, PipelineError> {
        profiling::scope!("present");
        let start = Instant::now();
        loop {
            match self.presenter.submit(submission) {
                Ok(()) => {
                    self.stats.presented += 1;
                    debug_assert!(self.presenter.pending().is_some());
                    return Ok(true);
                }
                Err(PresentError::Busy) => {
                    self.busy_streak += 1;
                    self.stats.busy_retries += 1;
                    if self.busy_streak >= self.options.busy_retry_limit {
                        return Err(PipelineError::RetirementTimeout {
                            frame: submission.frame,
                            attempts: self.busy_streak,
                            waited: start.elapsed(),
                        });
                    }

                    let slice = self.wait_slice();
                    if self.presenter.pending().is_some() {
                        if !self.retire(Some(slice))? && !self.nonblocking() {
                            if self.stop_requested() {
                                return Ok(false);
                            }
                            return Err(PipelineError::RetirementTimeout {
                                frame: submission.frame,
                                attempts: self.busy_streak,
                                waited: start.elapsed(),
                            });
                        }
                    } else {
                        // the kernel is busy with something we do not track
                        std::thread::sleep(slice.min(self.presenter.frame_budget()));
                        self.retire(Some(Duration::ZERO))?;
                    }

                    if self.stop_requested() {
                        return Ok(false);
                    }
                }
                Err(source) => {
                    return Err(PipelineError::PresentationRejected {
                        frame: submission.frame,
                        source,
                    })
                }
            }
        }
    }

    /// Blocks for the retirement of `frame`.
    fn wait_retirement(&mut self, frame: u64) -> Result<(), PipelineError> {
        let start = Instant::now();
        if self.retire(Some(self.options.retire_timeout))? || self.stop_requested() {
            return Ok(());
        }
        Err(PipelineError::RetirementTimeout {
            frame,
            attempts: 1,
            waited: start.elapsed(),
        })
    }

    /// Polls the strategy once, recycling whatever buffer it let go of.
    fn retire(&mut self, timeout: Option<Duration>) -> Result<bool, PipelineError> {
        let pending_frame = self.presenter.pending().map(|p| p.frame);
        let retired = {
            profiling::scope!("retire");
            self.presenter.poll_retired(timeout)
        };
        match retired {
            Ok(Some(retired)) => {
                self.on_retired(&retired);
                Ok(true)
            }
            Ok(None) | Err(PresentError::Timeout(_)) | Err(PresentError::Busy) => Ok(false),
            Err(source) => Err(PipelineError::PresentationRejected {
                frame: pending_frame.unwrap_or(self.frame),
                source,
            }),
        }
    }

    fn on_retired(&mut self, retired: &Retired) {
        if let Some(released) = retired.released {
            self.ring.release(released);
        }
        self.stats.max_latency = self.stats.max_latency.max(retired.latency);
        trace!(frame = retired.frame, latency = ?retired.latency, "frame retired");
        self.count_retirement();
    }

    fn count_retirement(&mut self) {
        self.busy_streak = 0;
        self.stats.retired += 1;
        if let Some((frames, secs)) = self.rate.tick(Instant::now()) {
            info!("rendered {frames} frames in {secs:.2} sec ({:.3} fps)", frames as f64 / secs);
        }
    }

    /// Waits out the last presentation and hands every buffer back.
    fn finish(&mut self) {
        let deadline = Instant::now() + self.options.retire_timeout;
        while self.presenter.pending().is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.retire(Some(remaining)) {
                Ok(true) => break,
                Ok(false) if remaining.is_zero() => {
                    warn!("last presentation did not retire in time");
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("last presentation failed: {err}");
                    break;
                }
            }
        }
        for id in self.presenter.drain() {
            self.ring.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        buffer::{
            tests::{ring, CountingImporter},
            BufferRing, BufferState, RingKind,
        },
        error::{ErrorKind, RenderError},
        present::{PendingPresentation, PresentState},
        render::RenderOutcome,
    };

    type Log = Rc<RefCell<Vec<String>>>;
    /// Buffers the display still scans out or has queued.
    type Held = Rc<RefCell<Vec<BufferId>>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behavior {
        Normal,
        AlwaysBusy,
        NeverRetire,
        RejectInit,
        RejectFrame(u64),
        /// First submit answers `Busy` with nothing queued.
        BusyWhileIdle { lost: bool },
    }

    struct MockPresenter {
        behavior: Behavior,
        nonblocking: bool,
        /// Polls answered with "not yet" before each retirement.
        retire_delay: u32,
        delay_left: u32,
        interrupt_after: Option<u64>,
        state: PresentState,
        held: Held,
        idle_busy_sent: bool,
        log: Log,
        submitted: Vec<u64>,
        retired: Vec<u64>,
        initialized: bool,
    }

    impl MockPresenter {
        fn new(behavior: Behavior, log: &Log) -> Self {
            Self {
                behavior,
                nonblocking: false,
                retire_delay: 0,
                delay_left: 0,
                interrupt_after: None,
                state: PresentState::default(),
                held: Held::default(),
                idle_busy_sent: false,
                log: log.clone(),
                submitted: Vec::new(),
                retired: Vec::new(),
                initialized: false,
            }
        }

        fn sync_held(&self) {
            let mut held = self.held.borrow_mut();
            held.clear();
            held.extend(self.state.front());
            held.extend(self.state.pending().map(|p| p.buffer));
        }

        fn nonblocking(mut self, retire_delay: u32) -> Self {
            self.nonblocking = true;
            self.retire_delay = retire_delay;
            self
        }
    }

    impl PresentationStrategy for MockPresenter {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn initialize(&mut self, primer: &mut Submission) -> Result<(), PresentError> {
            if self.behavior == Behavior::RejectInit {
                return Err(PresentError::rejected("no modeset for you"));
            }
            assert!(primer.framebuffer.is_some());
            self.initialized = true;
            self.state.set_front(primer.buffer, primer.frame);
            self.sync_held();
            Ok(())
        }

        fn submit(&mut self, submission: &mut Submission) -> Result<(), PresentError> {
            match self.behavior {
                Behavior::AlwaysBusy => return Err(PresentError::Busy),
                Behavior::RejectFrame(frame) if frame == submission.frame => {
                    return Err(PresentError::rejected("bad framebuffer"))
                }
                Behavior::BusyWhileIdle { .. } if !self.idle_busy_sent => {
                    self.idle_busy_sent = true;
                    return Err(PresentError::Busy);
                }
                _ => {}
            }
            self.state.ensure_idle()?;
            self.state.queue(submission.buffer, submission.frame, false);
            self.delay_left = self.retire_delay;
            self.submitted.push(submission.frame);
            self.log.borrow_mut().push(format!("submit {}", submission.frame));
            self.sync_held();
            Ok(())
        }

        fn poll_retired(
            &mut self,
            _timeout: Option<Duration>,
        ) -> Result<Option<Retired>, PresentError> {
            if self.behavior == (Behavior::BusyWhileIdle { lost: true })
                && self.state.pending().is_none()
            {
                return Err(PresentError::rejected("device lost"));
            }
            if self.behavior == Behavior::NeverRetire || self.state.pending().is_none() {
                return Ok(None);
            }
            if self.delay_left > 0 {
                self.delay_left -= 1;
                return Ok(None);
            }
            let retired = self.state.complete();
            if let Some(retired) = &retired {
                self.retired.push(retired.frame);
                self.log.borrow_mut().push(format!("retire {}", retired.frame));
            }
            self.sync_held();
            Ok(retired)
        }

        fn pending(&self) -> Option<&PendingPresentation> {
            self.state.pending()
        }

        fn drain(&mut self) -> Vec<BufferId> {
            let drained = self.state.drain();
            self.sync_held();
            drained
        }

        fn is_nonblocking(&self) -> bool {
            self.nonblocking
        }

        fn frame_budget(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn take_interrupt(&mut self) -> bool {
            self.interrupt_after
                .is_some_and(|n| self.submitted.len() as u64 >= n)
        }
    }

    struct MockRenderer {
        log: Log,
        held: Held,
        fail_at: Option<u64>,
    }

    impl RenderBackend<u32> for MockRenderer {
        fn draw_frame(&mut self, buffer: &mut u32, frame: u64) -> Result<RenderOutcome, RenderError> {
            let id = BufferId(*buffer as usize);
            assert!(
                !self.held.borrow().contains(&id),
                "frame {frame} drawn into {id} while the display holds it"
            );
            if self.fail_at == Some(frame) {
                return Err(RenderError::Draw {
                    frame,
                    reason: "shader exploded".into(),
                });
            }
            self.log
                .borrow_mut()
                .push(format!("draw {frame} into {buffer}"));
            Ok(RenderOutcome::default())
        }
    }

    fn options(limit: FrameLimit) -> SchedulerOptions {
        SchedulerOptions {
            limit,
            retire_timeout: Duration::from_millis(20),
            busy_retry_limit: 8,
            report_interval: Duration::from_secs(2),
        }
    }

    fn renderer(log: &Log, presenter: &MockPresenter) -> MockRenderer {
        MockRenderer {
            log: log.clone(),
            held: presenter.held.clone(),
            fail_at: None,
        }
    }

    #[test]
    fn zero_frame_limit_does_nothing() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        let mut renderer = renderer(&log, &presenter);

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(0)),
        )
        .run()
        .unwrap();

        assert_eq!(stats.rendered, 0);
        assert!(!presenter.initialized);
        assert!(log.borrow().is_empty());
        assert!(importer.imports.borrow().is_empty());
    }

    #[test]
    fn blocking_run_presents_and_retires_in_order() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        let mut renderer = renderer(&log, &presenter);

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(6)),
        )
        .run()
        .unwrap();

        assert_eq!(stats.rendered, 6);
        // the primer counts as presented and retired once the modeset is done
        assert_eq!(stats.presented, 6);
        assert_eq!(stats.retired, 6);
        assert_eq!(stats.busy_retries, 0);
        assert!(stats.fps > 0.0);
        assert!(presenter.initialized);
        assert_eq!(presenter.submitted, vec![1, 2, 3, 4, 5]);
        assert_eq!(presenter.retired, presenter.submitted);

        // every submit is retired before the next draw
        let log = log.borrow();
        for frame in 1..5u64 {
            let retire = log.iter().position(|e| *e == format!("retire {frame}"));
            let next = log
                .iter()
                .position(|e| e.starts_with(&format!("draw {} ", frame + 1)));
            assert!(retire < next, "frame {frame}: {log:?}");
        }

        // one import per buffer, all buffers back in the pool
        assert_eq!(importer.imports.borrow().len(), 3);
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn nonblocking_run_overlaps_rendering_with_presentation() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log).nonblocking(2);
        let mut renderer = renderer(&log, &presenter);

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(8)),
        )
        .run()
        .unwrap();

        assert_eq!(stats.rendered, 8);
        assert_eq!(stats.presented, 8);
        assert_eq!(stats.retired, 8);
        assert_eq!(presenter.submitted, (1..8).collect::<Vec<_>>());
        assert_eq!(presenter.retired, presenter.submitted);
        assert!(stats.busy_retries > 0);

        // frame 2 is drawn while frame 1 is still on its way
        let log = log.borrow();
        let draw_2 = log.iter().position(|e| e.starts_with("draw 2 "));
        let retire_1 = log.iter().position(|e| e == "retire 1");
        assert!(draw_2 < retire_1, "{log:?}");
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn always_busy_nonblocking_gives_up() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::AlwaysBusy, &log).nonblocking(0);
        let mut renderer = renderer(&log, &presenter);

        let start = Instant::now();
        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .run()
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetirementTimeout);
        match err {
            PipelineError::RetirementTimeout { frame, attempts, .. } => {
                assert_eq!(frame, 1);
                assert_eq!(attempts, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn rejected_modeset_leaves_no_buffer_checked_out() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::RejectInit, &log);
        let mut renderer = renderer(&log, &presenter);

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(10)),
        )
        .run()
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::PresentationRejected { frame: 0, .. }
        ));
        assert_eq!(ring.checked_out(), 0);
        for id in 0..3 {
            assert_eq!(ring.state(BufferId(id)), BufferState::Free);
        }
    }

    #[test]
    fn rejected_frame_stops_the_run() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::RejectFrame(3), &log);
        let mut renderer = renderer(&log, &presenter);

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .run()
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::PresentationRejected { frame: 3, .. }
        ));
        assert_eq!(presenter.submitted, vec![1, 2]);
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn blocking_wait_times_out() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::NeverRetire, &log);
        let mut renderer = renderer(&log, &presenter);

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .run()
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::RetirementTimeout { frame: 1, attempts: 1, .. }
        ));
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn single_buffer_ring_is_exhausted() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = BufferRing::new(RingKind::Surface, vec![0u32], Some(Box::new(importer)));
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        let mut renderer = renderer(&log, &presenter);

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(3)),
        )
        .run()
        .unwrap_err();

        assert!(matches!(err, PipelineError::ResourceExhaustion { ring: 1 }));
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn render_failure_is_fatal() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        let mut renderer = MockRenderer {
            log: log.clone(),
            held: presenter.held.clone(),
            fail_at: Some(2),
        };

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .run()
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Render);
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn user_interrupt_ends_run_cleanly() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        presenter.interrupt_after = Some(3);
        let mut renderer = renderer(&log, &presenter);

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .run()
        .unwrap();

        assert!(stats.interrupted);
        // the primer plus three flips were drawn
        assert_eq!(stats.rendered, 4);
        assert_eq!(presenter.submitted, vec![1, 2, 3]);
        assert_eq!(presenter.retired, vec![1, 2, 3]);
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn stop_handle_before_start() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(2, &importer);
        let mut presenter = MockPresenter::new(Behavior::Normal, &log);
        let mut renderer = renderer(&log, &presenter);
        let stop = StopHandle::default();
        stop.stop();

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Unbounded),
        )
        .with_stop_handle(stop)
        .run()
        .unwrap();

        assert!(stats.interrupted);
        assert_eq!(stats.rendered, 0);
        assert!(!presenter.initialized);
    }

    #[test]
    fn fps_windows_start_after_first_retirement() {
        let mut rate = FrameRate::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert_eq!(rate.window(t0), None);

        let mut report = None;
        for i in 1..=120u64 {
            let now = t0 + Duration::from_millis(i * 1000 / 60);
            if let Some(r) = rate.window(now) {
                report = Some(r);
            }
        }
        let (frames, secs) = report.unwrap();
        assert_eq!(frames, 120);
        assert!((secs - 2.0).abs() < 0.01);
    }

    #[test]
    fn busy_while_idle_recovers() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::BusyWhileIdle { lost: false }, &log);
        let mut renderer = renderer(&log, &presenter);

        let stats = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(4)),
        )
        .run()
        .unwrap();

        assert_eq!(stats.busy_retries, 1);
        assert_eq!(presenter.submitted, vec![1, 2, 3]);
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn busy_while_idle_surfaces_poll_failure() {
        let log = Log::default();
        let importer = CountingImporter::default();
        let mut ring = ring(3, &importer);
        let mut presenter = MockPresenter::new(Behavior::BusyWhileIdle { lost: true }, &log);
        let mut renderer = renderer(&log, &presenter);

        let err = FrameScheduler::new(
            &mut ring,
            &mut renderer,
            &mut presenter,
            options(FrameLimit::Frames(4)),
        )
        .run()
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PresentationRejected);
        assert!(presenter.submitted.is_empty());
        assert_eq!(ring.checked_out(), 0);
    }

    #[test]
    fn frame_limit_from_count() {
        assert_eq!(FrameLimit::from(None), FrameLimit::Unbounded);
        assert!(FrameLimit::from(Some(3)).reached(3));
        assert!(!FrameLimit::Unbounded.reached(u64::MAX));
    }
}
