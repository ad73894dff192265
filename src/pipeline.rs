// Pipeline assembly
//
// Builds the run context in dependency order: display resources, buffer
// ring, renderer, presentation strategy. `Pipeline` declares its fields in
// the reverse order so they are dropped presenter first (CRTC restored while
// our framebuffers still exist) and device last.

use std::path::{Path, PathBuf};

use smithay::backend::{
    allocator::{gbm::GbmDevice, Fourcc, Modifier},
    drm::DrmDeviceFd,
};
use tracing::{info, warn};

use crate::{
    buffer::{
        gbm::{allocate_ring, GpuBuffer, RingTarget},
        BufferRing,
    },
    config::Config,
    display::{
        self,
        device::{self as drm_device, DrmHandle},
        parse_fourcc, parse_mode_size, DisplayConfig, DisplayRequest,
    },
    error::{ConfigurationError, PipelineError},
    present::{
        atomic::{AtomicOptions, AtomicPresenter},
        legacy::LegacyPresenter,
        offscreen::OffscreenPresenter,
        DisplayEvents, PresentationStrategy, StrategyKind,
    },
    render::{gles::GlesBackend, Technique},
    scheduler::{FrameScheduler, FrameStats, SchedulerOptions, StopHandle},
};

/// Everything needed to set up and run the pipeline, validated up front.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub device: Option<PathBuf>,
    pub request: DisplayRequest,
    pub format: Fourcc,
    pub modifier: Modifier,
    pub ring: RingTarget,
    pub offscreen: bool,
    pub strategy: StrategyKind,
    pub nonblocking: bool,
    pub fencing: bool,
    pub watch_input: bool,
    pub technique: Technique,
    pub samples: u32,
    pub scheduler: SchedulerOptions,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let format = parse_fourcc(&config.buffers.format)?;
        let modifier = config.modifier()?;

        let request = DisplayRequest {
            mode: config.display.mode.clone(),
            refresh: config.display.refresh,
            connector: config.display.connector,
        };
        if config.offscreen {
            let mode = request.mode.as_deref().ok_or(ConfigurationError::MissingMode)?;
            parse_mode_size(mode)?;
        } else {
            request.mode_filter()?;
        }

        let ring = if config.offscreen {
            RingTarget::Offscreen
        } else if config.buffers.surfaceless {
            RingTarget::Surfaceless
        } else {
            RingTarget::Surface(config.buffers.ring_size)
        };

        Ok(Self {
            device: config.display.device.clone(),
            request,
            format,
            modifier,
            ring,
            offscreen: config.offscreen,
            strategy: config.presentation.strategy,
            nonblocking: config.presentation.nonblocking,
            fencing: config.presentation.fencing,
            watch_input: config.presentation.watch_input,
            technique: config.render.technique,
            samples: config.render.samples,
            scheduler: SchedulerOptions {
                limit: config.frames.into(),
                retire_timeout: config.retire_timeout(),
                busy_retry_limit: config.presentation.busy_retry_limit.max(1),
                report_interval: config.report_interval(),
            },
        })
    }

    /// Whether the renderer should hand its fence to the presenter.
    fn export_fences(&self) -> bool {
        !self.offscreen && self.strategy == StrategyKind::Atomic && self.fencing
    }
}

pub struct Pipeline {
    presenter: Box<dyn PresentationStrategy>,
    renderer: GlesBackend,
    ring: BufferRing<GpuBuffer>,
    _gbm: GbmDevice<DrmDeviceFd>,
    device: DrmHandle,
    display: DisplayConfig,
    scheduler: SchedulerOptions,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("presenter", &self.presenter.name())
            .field("renderer", &self.renderer)
            .field("ring", &self.ring)
            .field("device", &self.device.path)
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(options: &RunOptions) -> Result<Self, PipelineError> {
        let (device, display) = open_display(options)?;

        let gbm = GbmDevice::new(device.fd.clone()).map_err(PipelineError::device(format!(
            "failed to create GBM device on {}",
            device.path.display()
        )))?;
        let scanout_fd = (!options.offscreen).then_some(&device.fd);
        let ring = allocate_ring(&gbm, scanout_fd, &display, options.ring)?;

        let renderer = GlesBackend::new(
            &gbm,
            options.technique,
            options.samples,
            options.export_fences(),
        )?;

        let mut events =
            DisplayEvents::new().map_err(PipelineError::device("failed to create event loop"))?;
        if options.watch_input
            && events
                .watch_input()
                .map_err(PipelineError::device("failed to watch stdin"))?
        {
            info!("press enter to stop");
        }

        let presenter: Box<dyn PresentationStrategy> = if options.offscreen {
            if options.strategy != StrategyKind::Legacy {
                warn!("no display offscreen, ignoring the {:?} strategy", options.strategy);
            }
            Box::new(OffscreenPresenter::new(
                display.frame_budget(),
                options.nonblocking,
                Some(events),
            ))
        } else {
            match options.strategy {
                StrategyKind::Legacy => Box::new(LegacyPresenter::new(
                    device.fd.clone(),
                    &display,
                    events,
                    options.nonblocking,
                    options.scheduler.retire_timeout,
                )?),
                StrategyKind::Atomic => Box::new(AtomicPresenter::new(
                    device.fd.clone(),
                    &display,
                    events,
                    AtomicOptions {
                        nonblocking: options.nonblocking,
                        fencing: options.fencing,
                        fence_timeout: options.scheduler.retire_timeout,
                    },
                )?),
            }
        };

        info!(
            device = %device.path.display(),
            mode = %display.mode,
            format = ?display.format,
            strategy = presenter.name(),
            buffers = options.ring.len(),
            "pipeline ready"
        );

        Ok(Self {
            presenter,
            renderer,
            ring,
            _gbm: gbm,
            device,
            display,
            scheduler: options.scheduler.clone(),
        })
    }

    pub fn display(&self) -> &DisplayConfig {
        &self.display
    }

    pub fn run(&mut self, stop: StopHandle) -> Result<FrameStats, PipelineError> {
        FrameScheduler::new(
            &mut self.ring,
            &mut self.renderer,
            self.presenter.as_mut(),
            self.scheduler.clone(),
        )
        .with_stop_handle(stop)
        .run()
    }
}

/// Sets up the pipeline and runs it until the frame limit or a stop.
///
/// A limit of zero frames returns before any device is touched.
pub fn execute(options: &RunOptions, stop: StopHandle) -> Result<FrameStats, PipelineError> {
    if options.scheduler.limit.reached(0) {
        info!("frame limit is zero, nothing to render");
        return Ok(FrameStats::default());
    }
    let mut pipeline = Pipeline::new(options)?;
    let mode = pipeline.display().mode.clone();
    pipeline.run(stop).inspect_err(|err| warn!(%mode, "rendering failed: {err}"))
}

fn open_display(options: &RunOptions) -> Result<(DrmHandle, DisplayConfig), PipelineError> {
    if options.offscreen {
        let mode = options
            .request
            .mode
            .as_deref()
            .ok_or(ConfigurationError::MissingMode)?;
        let mut mode = parse_mode_size(mode)?;
        if mode.refresh == 0 {
            mode.refresh = options.request.refresh;
        }
        let device = drm_device::open_render(options.device.as_deref())?;
        return Ok((
            device,
            DisplayConfig::offscreen(mode, options.format, options.modifier),
        ));
    }

    let device = drm_device::open_primary(options.device.as_deref())?;
    let snapshot = drm_device::snapshot(&device.fd)?;
    let display = display::resolve(&snapshot, &options.request, options.format, options.modifier)?;
    Ok((device, display))
}

/// Connector listing for `--probe`.
pub fn probe(device: Option<&Path>) -> Result<Vec<String>, PipelineError> {
    let device = drm_device::open_primary(device)?;
    let snapshot = drm_device::snapshot(&device.fd)?;
    let mut lines = vec![format!("{}:", device.path.display())];
    lines.extend(drm_device::describe(&snapshot));
    Ok(lines)
}
