// Buffer provider
//
// A fixed ring of GPU buffers. Each buffer is either free, being drawn by the
// render backend, ready for presentation, or owned by the presentation
// strategy (queued or on screen). The scan-out framebuffer of a buffer is
// imported the first time it is presented and reused afterwards.

pub mod gbm;

use std::fmt;

use smithay::reexports::drm::control::framebuffer;
use tracing::{debug, trace, warn};

use crate::error::BufferError;

/// Buffers in the ring when the display surface sizes it.
pub const DEFAULT_RING_SIZE: usize = 3;
/// Fixed buffer count for surfaceless and offscreen rendering.
pub const SURFACELESS_RING_SIZE: usize = 2;

/// Index of a buffer in its ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    /// Checked out to the render backend.
    Rendering,
    /// Drawn, waiting to be handed to the presentation strategy.
    Ready,
    /// Checked out to the presentation strategy.
    Presenting,
}

/// How the ring was sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Scan-out capable buffers standing in for a display surface.
    Surface,
    /// A fixed set of off-screen buffers.
    Surfaceless,
}

/// Turns a GPU buffer into a display scan-out handle.
pub trait ScanoutImporter<B> {
    fn import(&mut self, buffer: &B) -> Result<framebuffer::Handle, BufferError>;
    fn destroy(&mut self, framebuffer: framebuffer::Handle);
}

/// A GPU buffer plus its cached scan-out handle.
#[derive(Debug)]
pub struct SurfaceBuffer<B> {
    pub buffer: B,
    scanout: Option<framebuffer::Handle>,
    state: BufferState,
}

impl<B> SurfaceBuffer<B> {
    fn new(buffer: B) -> Self {
        Self {
            buffer,
            scanout: None,
            state: BufferState::Free,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn in_flight(&self) -> bool {
        self.state == BufferState::Presenting
    }

    pub fn scanout(&self) -> Option<framebuffer::Handle> {
        self.scanout
    }
}

/// The buffer provider contract the frame scheduler works against.
pub trait BufferProvider {
    type Buffer;

    /// Checks out a free buffer for rendering, `None` when every buffer is busy.
    fn acquire_writable(&mut self) -> Option<BufferId>;
    /// Marks a rendered buffer as ready for presentation.
    fn finish_rendering(&mut self, id: BufferId) -> Result<(), BufferError>;
    /// Scan-out handle for `id`, imported on first use. `None` for rings
    /// that never reach a display.
    fn resolve_scanout_handle(
        &mut self,
        id: BufferId,
    ) -> Result<Option<framebuffer::Handle>, BufferError>;
    /// Hands a ready buffer to the presentation strategy.
    fn mark_presenting(&mut self, id: BufferId) -> Result<(), BufferError>;
    /// Returns a buffer to the free pool.
    fn release(&mut self, id: BufferId);
    /// Returns every checked out buffer to the free pool.
    fn reclaim_all(&mut self);

    fn buffer_mut(&mut self, id: BufferId) -> &mut Self::Buffer;
    fn len(&self) -> usize;
    fn free_count(&self) -> usize;
    fn state(&self, id: BufferId) -> BufferState;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checked_out(&self) -> usize {
        self.len() - self.free_count()
    }
}

/// Ring of `B` buffers, with an optional importer for display scan-out.
pub struct BufferRing<B> {
    slots: Vec<SurfaceBuffer<B>>,
    importer: Option<Box<dyn ScanoutImporter<B>>>,
    kind: RingKind,
    /// Free slots, least recently released first.
    free: std::collections::VecDeque<usize>,
}

impl<B> fmt::Debug for BufferRing<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRing")
            .field("kind", &self.kind)
            .field("len", &self.slots.len())
            .field("free", &self.free)
            .field("scanout", &self.importer.is_some())
            .finish()
    }
}

impl<B> BufferRing<B> {
    pub fn new(
        kind: RingKind,
        buffers: Vec<B>,
        importer: Option<Box<dyn ScanoutImporter<B>>>,
    ) -> Self {
        let free = (0..buffers.len()).collect();
        Self {
            slots: buffers.into_iter().map(SurfaceBuffer::new).collect(),
            importer,
            kind,
            free,
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn get(&self, id: BufferId) -> &SurfaceBuffer<B> {
        &self.slots[id.0]
    }

    fn transition(
        &mut self,
        id: BufferId,
        from: BufferState,
        to: BufferState,
        what: &'static str,
    ) -> Result<(), BufferError> {
        let slot = &mut self.slots[id.0];
        if slot.state != from {
            return Err(BufferError::InvalidTransition(id.0, what));
        }
        trace!(buffer = %id, ?from, ?to, "buffer transition");
        slot.state = to;
        Ok(())
    }
}

impl<B> BufferProvider for BufferRing<B> {
    type Buffer = B;

    fn acquire_writable(&mut self) -> Option<BufferId> {
        let index = self.free.pop_front()?;
        self.slots[index].state = BufferState::Rendering;
        Some(BufferId(index))
    }

    fn finish_rendering(&mut self, id: BufferId) -> Result<(), BufferError> {
        self.transition(id, BufferState::Rendering, BufferState::Ready, "finish rendering")
    }

    fn resolve_scanout_handle(
        &mut self,
        id: BufferId,
    ) -> Result<Option<framebuffer::Handle>, BufferError> {
        let Some(importer) = self.importer.as_mut() else {
            return Ok(None);
        };
        let slot = &mut self.slots[id.0];
        if let Some(fb) = slot.scanout {
            return Ok(Some(fb));
        }
        let fb = importer.import(&slot.buffer)?;
        debug!(buffer = %id, ?fb, "imported scan-out framebuffer");
        slot.scanout = Some(fb);
        Ok(Some(fb))
    }

    fn mark_presenting(&mut self, id: BufferId) -> Result<(), BufferError> {
        self.transition(id, BufferState::Ready, BufferState::Presenting, "presentation")
    }

    fn release(&mut self, id: BufferId) {
        let slot = &mut self.slots[id.0];
        if slot.state == BufferState::Free {
            warn!(buffer = %id, "releasing a buffer that is already free");
            return;
        }
        slot.state = BufferState::Free;
        self.free.push_back(id.0);
    }

    fn reclaim_all(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].state != BufferState::Free {
                self.release(BufferId(index));
            }
        }
    }

    fn buffer_mut(&mut self, id: BufferId) -> &mut B {
        &mut self.slots[id.0].buffer
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn state(&self, id: BufferId) -> BufferState {
        self.slots[id.0].state
    }
}

impl<B> Drop for BufferRing<B> {
    fn drop(&mut self) {
        if let Some(importer) = self.importer.as_mut() {
            for slot in &mut self.slots {
                if let Some(fb) = slot.scanout.take() {
                    importer.destroy(fb);
                }
            }
        }
    }
}
