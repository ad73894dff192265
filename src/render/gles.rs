// GLES render backend on top of smithay's GlesRenderer.
//
// Each GBM buffer is bound through its exported dmabuf; a frame is a set of
// clears described by the active `Technique`.

use smithay::{
    backend::{
        allocator::gbm::GbmDevice,
        drm::DrmDeviceFd,
        egl::{
            context::{GlAttributes, PixelFormatRequirements},
            EGLContext, EGLDisplay,
        },
        renderer::{gles::GlesRenderer, Bind, Color32F, Frame, Renderer},
    },
    utils::{Point, Rectangle, Size, Transform},
};
use tracing::{debug, info, warn};

use super::{RenderBackend, RenderOutcome, Technique};
use crate::{buffer::gbm::GpuBuffer, error::RenderError};

pub struct GlesBackend {
    renderer: GlesRenderer,
    technique: Technique,
    /// Hand the GPU fence to the presenter instead of waiting for it here.
    export_fences: bool,
}

impl std::fmt::Debug for GlesBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlesBackend")
            .field("technique", &self.technique)
            .field("export_fences", &self.export_fences)
            .finish_non_exhaustive()
    }
}

fn setup_err(err: impl std::fmt::Display) -> RenderError {
    RenderError::Setup(err.to_string())
}

fn create_context(display: &EGLDisplay, samples: u32) -> Result<EGLContext, RenderError> {
    if samples > 1 {
        let attributes = GlAttributes {
            version: (2, 0),
            profile: None,
            debug: false,
            vsync: false,
        };
        let requirements = PixelFormatRequirements {
            multisampling: Some(samples.min(u16::MAX as u32) as u16),
            ..PixelFormatRequirements::_8_bit()
        };
        match EGLContext::new_with_config(display, attributes, requirements) {
            Ok(context) => {
                info!(samples, "using multisampled EGL config");
                return Ok(context);
            }
            Err(err) => warn!("no EGL config with {samples} samples ({err}), continuing without"),
        }
    }
    EGLContext::new(display).map_err(setup_err)
}

impl GlesBackend {
    pub fn new(
        gbm: &GbmDevice<DrmDeviceFd>,
        technique: Technique,
        samples: u32,
        export_fences: bool,
    ) -> Result<Self, RenderError> {
        // SAFETY: the GBM device outlives the renderer, see `pipeline::Pipeline`
        let display = unsafe { EGLDisplay::new(gbm.clone()) }.map_err(setup_err)?;
        let context = create_context(&display, samples)?;
        // SAFETY: the context is fresh and only used by this renderer
        let renderer = unsafe { GlesRenderer::new(context) }.map_err(setup_err)?;
        debug!(%technique, export_fences, "GLES renderer ready");

        Ok(Self {
            renderer,
            technique,
            export_fences,
        })
    }
}

impl RenderBackend<GpuBuffer> for GlesBackend {
    fn draw_frame(
        &mut self,
        buffer: &mut GpuBuffer,
        frame: u64,
    ) -> Result<RenderOutcome, RenderError> {
        profiling::scope!("draw_frame");
        let draw_err = |err: &dyn std::fmt::Display| RenderError::Draw {
            frame,
            reason: err.to_string(),
        };

        let (width, height) = buffer.size();
        let fills = self.technique.paint(frame, (width, height));
        let size = Size::from((width as i32, height as i32));

        let mut target = self
            .renderer
            .bind(&mut buffer.dmabuf)
            .map_err(|err| draw_err(&err))?;
        let mut gl_frame = self
            .renderer
            .render(&mut target, size, Transform::Normal)
            .map_err(|err| draw_err(&err))?;
        for fill in fills {
            let [r, g, b, a] = fill.color;
            let rect = Rectangle::new(
                Point::from((fill.x, fill.y)),
                Size::from((fill.width, fill.height)),
            );
            gl_frame
                .clear(Color32F::new(r, g, b, a), &[rect])
                .map_err(|err| draw_err(&err))?;
        }
        let sync = gl_frame.finish().map_err(|err| draw_err(&err))?;

        let fence = if self.export_fences {
            sync.export()
        } else {
            None
        };
        if fence.is_none() {
            sync.wait().map_err(|err| RenderError::Draw {
                frame,
                reason: format!("interrupted waiting for the GPU: {err:?}"),
            })?;
        }
        Ok(RenderOutcome { fence })
    }
}
