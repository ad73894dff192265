// GBM backed buffers
//
// Allocates the ring with smithay's GBM allocator, exports each buffer as a
// dmabuf once for the renderer, and imports it as a DRM framebuffer for
// scan-out on demand.

use smithay::{
    backend::{
        allocator::{
            dmabuf::{AsDmabuf, Dmabuf},
            format::{get_bpp, get_depth},
            gbm::{GbmAllocator, GbmBuffer, GbmBufferFlags, GbmDevice},
            Allocator, Buffer, Fourcc, Modifier,
        },
        drm::DrmDeviceFd,
    },
    reexports::{
        drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags},
        gbm::BufferObject,
    },
};
use tracing::{debug, info, warn};

use super::{BufferRing, RingKind, ScanoutImporter, DEFAULT_RING_SIZE, SURFACELESS_RING_SIZE};
use crate::{display::DisplayConfig, error::BufferError};

/// A GBM buffer object and the dmabuf the renderer binds.
#[derive(Debug)]
pub struct GpuBuffer {
    pub bo: GbmBuffer,
    pub dmabuf: Dmabuf,
}

impl GpuBuffer {
    pub fn size(&self) -> (u32, u32) {
        (self.bo.width(), self.bo.height())
    }
}

/// Where the ring's buffers end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingTarget {
    /// Display-surface sized ring of `n` scan-out buffers.
    Surface(usize),
    /// Fixed scan-out capable ring, no surface.
    Surfaceless,
    /// Off-screen buffers that are never scanned out.
    Offscreen,
}

impl RingTarget {
    pub fn len(self) -> usize {
        match self {
            RingTarget::Surface(n) => n.max(SURFACELESS_RING_SIZE),
            RingTarget::Surfaceless | RingTarget::Offscreen => SURFACELESS_RING_SIZE,
        }
    }

    fn flags(self) -> GbmBufferFlags {
        match self {
            RingTarget::Offscreen => GbmBufferFlags::RENDERING,
            _ => GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT,
        }
    }

    fn kind(self) -> RingKind {
        match self {
            RingTarget::Surface(_) => RingKind::Surface,
            _ => RingKind::Surfaceless,
        }
    }
}

impl Default for RingTarget {
    fn default() -> Self {
        RingTarget::Surface(DEFAULT_RING_SIZE)
    }
}

/// Allocates a ring sized and flagged for `target`.
pub fn allocate_ring(
    gbm: &GbmDevice<DrmDeviceFd>,
    drm: Option<&DrmDeviceFd>,
    config: &DisplayConfig,
    target: RingTarget,
) -> Result<BufferRing<GpuBuffer>, BufferError> {
    let (width, height) = config.mode.size();
    let mut allocator = GbmAllocator::new(gbm.clone(), target.flags());
    let count = target.len();

    let mut buffers = Vec::with_capacity(count);
    for index in 0..count {
        let bo = allocator
            .create_buffer(width, height, config.format, &[config.modifier])
            .map_err(|source| BufferError::Allocation {
                index,
                width,
                height,
                source,
            })?;
        let dmabuf = bo
            .export()
            .map_err(|err| BufferError::Export(err.to_string()))?;
        debug!(index, format = ?bo.format(), "allocated buffer");
        buffers.push(GpuBuffer { bo, dmabuf });
    }

    info!(
        "allocated {count} {width}x{height} {:?} buffers ({:?})",
        config.format, target
    );

    let importer: Option<Box<dyn ScanoutImporter<GpuBuffer>>> = match (target, drm) {
        (RingTarget::Offscreen, _) | (_, None) => None,
        (_, Some(drm)) => Some(Box::new(DrmImporter::new(drm.clone()))),
    };
    Ok(BufferRing::new(target.kind(), buffers, importer))
}

/// Whether a framebuffer must be created with explicit modifiers.
fn needs_modifiers(modifier: Modifier) -> bool {
    !matches!(modifier, Modifier::Invalid | Modifier::Linear)
}

/// Legacy `(depth, bpp)` pair for single-plane framebuffer creation.
fn legacy_depth_bpp(format: Fourcc) -> Option<(u32, u32)> {
    let depth = get_depth(format)?;
    let bpp = get_bpp(format)?;
    Some((depth as u32, bpp as u32))
}

/// Creates DRM framebuffers for GBM buffers on the display device.
#[derive(Debug)]
pub struct DrmImporter {
    fd: DrmDeviceFd,
}

impl DrmImporter {
    pub fn new(fd: DrmDeviceFd) -> Self {
        Self { fd }
    }
}

impl ScanoutImporter<GpuBuffer> for DrmImporter {
    fn import(&mut self, buffer: &GpuBuffer) -> Result<framebuffer::Handle, BufferError> {
        let bo: &BufferObject<()> = &buffer.bo;
        let format = buffer.bo.format();

        let flags = if needs_modifiers(format.modifier) {
            debug!("using modifier {:#x}", u64::from(format.modifier));
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };

        let planar_err = match self.fd.add_planar_framebuffer(bo, flags) {
            Ok(fb) => return Ok(fb),
            Err(err) => err,
        };
        if !flags.is_empty() {
            warn!("framebuffer with modifiers failed: {planar_err}, retrying without");
        }

        let Some((depth, bpp)) = legacy_depth_bpp(format.code) else {
            return Err(BufferError::Import(planar_err));
        };
        self.fd
            .add_framebuffer(bo, depth, bpp)
            .map_err(BufferError::Import)
    }

    fn destroy(&mut self, framebuffer: framebuffer::Handle) {
        if let Err(err) = self.fd.destroy_framebuffer(framebuffer) {
            warn!("failed to destroy framebuffer {framebuffer:?}: {err}");
        }
    }
}
