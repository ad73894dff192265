// Atomic KMS presentation
//
// The first commit carries the modeset (connector CRTC_ID, MODE_ID blob,
// ACTIVE). Every later commit only repoints the primary plane's FB_ID and
// is issued non-blocking. With fencing the render fence goes in as the
// plane IN_FENCE_FD and retirement is read from the CRTC OUT_FENCE_PTR,
// otherwise a page flip event is requested.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::Duration,
};

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::{
        control::{
            atomic::AtomicModeReq, crtc, framebuffer, plane, property, AtomicCommitFlags,
            Device as ControlDevice, PlaneType, ResourceHandle,
        },
        ClientCapability, Device as BasicDevice,
    },
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

#[derive(Debug, Clone, Copy)]
pub struct AtomicOptions {
    pub nonblocking: bool,
    pub fencing: bool,
    /// Upper bound for waiting on a render fence we could not hand to the kernel.
    pub fence_timeout: Duration,
}

/// Name, handle and current value of every property of one object.
#[derive(Debug, Default)]
struct PropertyTable(Vec<(String, property::Handle, property::RawValue)>);

impl PropertyTable {
    fn read<H: ResourceHandle>(fd: &DrmDeviceFd, handle: H) -> io::Result<Self> {
        let props = fd.get_properties(handle)?;
        let (ids, values) = props.as_props_and_values();
        let mut table = Vec::with_capacity(ids.len());
        for (&id, &value) in ids.iter().zip(values.iter()) {
            let info = fd.get_property(id)?;
            table.push((info.name().to_string_lossy().into_owned(), id, value));
        }
        Ok(Self(table))
    }

    fn find(&self, name: &str) -> Option<property::Handle> {
        self.0.iter().find(|(n, _, _)| n == name).map(|(_, id, _)| *id)
    }

    fn value(&self, name: &str) -> Option<property::RawValue> {
        self.0.iter().find(|(n, _, _)| n == name).map(|(_, _, v)| *v)
    }

    fn require(
        &self,
        object: &'static str,
        name: &'static str,
    ) -> Result<property::Handle, ConfigurationError> {
        self.find(name)
            .ok_or(ConfigurationError::MissingProperty { object, name })
    }
}

#[derive(Debug, Clone, Copy)]
struct PropertyIds {
    connector_crtc_id: property::Handle,
    crtc_mode_id: property::Handle,
    crtc_active: property::Handle,
    crtc_out_fence_ptr: Option<property::Handle>,
    plane_fb_id: property::Handle,
    plane_crtc_id: property::Handle,
    plane_in_fence_fd: Option<property::Handle>,
    src_x: property::Handle,
    src_y: property::Handle,
    src_w: property::Handle,
    src_h: property::Handle,
    crtc_x: property::Handle,
    crtc_y: property::Handle,
    crtc_w: property::Handle,
    crtc_h: property::Handle,
}

impl PropertyIds {
    fn read(
        fd: &DrmDeviceFd,
        routing: &Routing,
        plane: plane::Handle,
    ) -> Result<Self, ConfigurationError> {
        let connector = PropertyTable::read(fd, routing.connector)
            .map_err(ConfigurationError::device("connector properties"))?;
        let crtc = PropertyTable::read(fd, routing.crtc)
            .map_err(ConfigurationError::device("CRTC properties"))?;
        let planes = PropertyTable::read(fd, plane)
            .map_err(ConfigurationError::device("plane properties"))?;

        Ok(Self {
            connector_crtc_id: connector.require("connector", "CRTC_ID")?,
            crtc_mode_id: crtc.require("CRTC", "MODE_ID")?,
            crtc_active: crtc.require("CRTC", "ACTIVE")?,
            crtc_out_fence_ptr: crtc.find("OUT_FENCE_PTR"),
            plane_fb_id: planes.require("plane", "FB_ID")?,
            plane_crtc_id: planes.require("plane", "CRTC_ID")?,
            plane_in_fence_fd: planes.find("IN_FENCE_FD"),
            src_x: planes.require("plane", "SRC_X")?,
            src_y: planes.require("plane", "SRC_Y")?,
            src_w: planes.require("plane", "SRC_W")?,
            src_h: planes.require("plane", "SRC_H")?,
            crtc_x: planes.require("plane", "CRTC_X")?,
            crtc_y: planes.require("plane", "CRTC_Y")?,
            crtc_w: planes.require("plane", "CRTC_W")?,
            crtc_h: planes.require("plane", "CRTC_H")?,
        })
    }

    fn supports_fencing(&self) -> bool {
        self.crtc_out_fence_ptr.is_some() && self.plane_in_fence_fd.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneCandidate {
    handle: plane::Handle,
    /// The plane can be attached to our CRTC.
    compatible: bool,
    kind: Option<PlaneType>,
}

fn plane_type(raw: property::RawValue) -> Option<PlaneType> {
    match raw {
        0 => Some(PlaneType::Overlay),
        1 => Some(PlaneType::Primary),
        2 => Some(PlaneType::Cursor),
        _ => None,
    }
}

/// Primary plane of the CRTC, else its first non-cursor plane.
fn pick_plane(candidates: &[PlaneCandidate]) -> Option<plane::Handle> {
    let mut usable = candidates.iter().filter(|c| c.compatible);
    usable
        .clone()
        .find(|c| c.kind == Some(PlaneType::Primary))
        .or_else(|| usable.find(|c| c.kind != Some(PlaneType::Cursor)))
        .map(|c| c.handle)
}

fn find_plane(fd: &DrmDeviceFd, crtc: crtc::Handle) -> Result<plane::Handle, ConfigurationError> {
    let resources = fd
        .resource_handles()
        .map_err(ConfigurationError::device("DRM resources"))?;
    let planes = fd
        .plane_handles()
        .map_err(ConfigurationError::device("planes"))?;

    let mut candidates = Vec::with_capacity(planes.len());
    for handle in planes {
        let compatible = match fd.get_plane(handle) {
            Ok(info) => resources
                .filter_crtcs(info.possible_crtcs())
                .contains(&crtc),
            Err(err) => {
                debug!("skipping plane {handle:?}: {err}");
                continue;
            }
        };
        let kind = PropertyTable::read(fd, handle)
            .ok()
            .and_then(|props| props.value("type"))
            .and_then(plane_type);
        candidates.push(PlaneCandidate {
            handle,
            compatible,
            kind,
        });
    }

    pick_plane(&candidates).ok_or(ConfigurationError::Unsupported(
        "no plane can be attached to the selected CRTC",
    ))
}

/// Plane source coordinates are 16.16 fixed point.
fn fixed_16_16(value: u32) -> u64 {
    (value as u64) << 16
}

#[derive(Debug)]
pub struct AtomicPresenter {
    fd: DrmDeviceFd,
    routing: Routing,
    plane: plane::Handle,
    props: PropertyIds,
    mode_blob: u64,
    size: (u32, u32),
    budget: Duration,
    options: AtomicOptions,
    /// Written by the kernel on fenced commits.
    out_fence: Box<i32>,
    events: DisplayEvents,
    state: PresentState,
    saved: Option<SavedCrtc>,
}

impl AtomicPresenter {
    pub fn new(
        fd: DrmDeviceFd,
        config: &DisplayConfig,
        mut events: DisplayEvents,
        mut options: AtomicOptions,
    ) -> Result<Self, ConfigurationError> {
        let routing = config
            .routing
            .clone()
            .ok_or(ConfigurationError::Unsupported("atomic presentation without an output"))?;
        let mode = config.mode.raw().ok_or(ConfigurationError::MissingMode)?;

        fd.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|_| ConfigurationError::Unsupported("universal planes"))?;
        fd.set_client_capability(ClientCapability::Atomic, true)
            .map_err(|_| ConfigurationError::Unsupported("atomic modesetting"))?;

        let plane = find_plane(&fd, routing.crtc)?;
        let props = PropertyIds::read(&fd, &routing, plane)?;
        if options.fencing && !props.supports_fencing() {
            warn!("driver lacks IN_FENCE_FD/OUT_FENCE_PTR, falling back to page flip events");
            options.fencing = false;
        }

        let mode_blob = match fd
            .create_property_blob(&mode)
            .map_err(ConfigurationError::device("mode blob"))?
        {
            property::Value::Blob(id) => id,
            _ => return Err(ConfigurationError::Unsupported("mode property blobs")),
        };

        if !options.fencing {
            events
                .watch_drm(&fd)
                .map_err(ConfigurationError::device("DRM events"))?;
        }

        info!(
            ?plane,
            fencing = options.fencing,
            nonblocking = options.nonblocking,
            "atomic presentation ready"
        );

        Ok(Self {
            fd,
            routing,
            plane,
            props,
            mode_blob,
            size: config.mode.size(),
            budget: config.frame_budget(),
            options,
            out_fence: Box::new(-1),
            events,
            state: PresentState::default(),
            saved: None,
        })
    }

    fn request(
        &self,
        fb: framebuffer::Handle,
        modeset: bool,
        in_fence: Option<i32>,
        out_fence_ptr: Option<u64>,
    ) -> AtomicModeReq {
        let p = &self.props;
        let (crtc, plane) = (self.routing.crtc, self.plane);
        let (width, height) = self.size;
        let mut req = AtomicModeReq::new();

        if modeset {
            req.add_property(
                self.routing.connector,
                p.connector_crtc_id,
                property::Value::CRTC(Some(crtc)),
            );
            req.add_property(crtc, p.crtc_mode_id, property::Value::Blob(self.mode_blob));
            req.add_property(crtc, p.crtc_active, property::Value::Boolean(true));
        }

        req.add_property(plane, p.plane_fb_id, property::Value::Framebuffer(Some(fb)));
        req.add_property(plane, p.plane_crtc_id, property::Value::CRTC(Some(crtc)));
        req.add_property(plane, p.src_x, property::Value::UnsignedRange(0));
        req.add_property(plane, p.src_y, property::Value::UnsignedRange(0));
        req.add_property(plane, p.src_w, property::Value::UnsignedRange(fixed_16_16(width)));
        req.add_property(plane, p.src_h, property::Value::UnsignedRange(fixed_16_16(height)));
        req.add_property(plane, p.crtc_x, property::Value::SignedRange(0));
        req.add_property(plane, p.crtc_y, property::Value::SignedRange(0));
        req.add_property(plane, p.crtc_w, property::Value::UnsignedRange(width as u64));
        req.add_property(plane, p.crtc_h, property::Value::UnsignedRange(height as u64));

        if let (Some(prop), Some(fd)) = (p.plane_in_fence_fd, in_fence) {
            req.add_property(plane, prop, property::Value::SignedRange(fd as i64));
        }
        if let (Some(prop), Some(ptr)) = (p.crtc_out_fence_ptr, out_fence_ptr) {
            req.add_property(crtc, prop, property::Value::UnsignedRange(ptr));
        }
        req
    }

    fn wait_pending(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.options.fencing {
            self.events.wait_until(timeout, |state| state.fence_signaled())
        } else {
            let crtc = self.routing.crtc;
            self.events.wait_until(timeout, |state| state.has_flip(crtc))
        }
    }
}

impl PresentationStrategy for AtomicPresenter {
    fn name(&self) -> &'static str {
        "atomic"
    }

    fn initialize(&mut self, primer: &mut Submission) -> Result<(), PresentError> {
        let fb = primer.framebuffer()?;
        if let Some(fence) = primer.fence.take() {
            wait_fence(&mut self.events, fence, self.options.fence_timeout)?;
        }

        self.saved = SavedCrtc::capture(&self.fd, self.routing.crtc, self.routing.connector);
        let req = self.request(fb, true, None, None);
        self.fd
            .atomic_commit(
                AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::TEST_ONLY,
                req.clone(),
            )
            .map_err(|err| PresentError::Rejected {
                reason: "modeset rejected by test commit".into(),
                source: Some(err),
            })?;
        self.fd
            .atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
            .map_err(|err| PresentError::from_commit("failed to commit modeset", err))?;

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

        let fencing = self.options.fencing;
        if !fencing {
            if let Some(fence) = submission.fence.take() {
                wait_fence(&mut self.events, fence, self.options.fence_timeout)?;
            }
        }

        let in_fence = submission
            .fence
            .as_ref()
            .filter(|_| fencing)
            .map(|fence| fence.as_raw_fd());
        let out_fence_ptr = fencing.then(|| {
            *self.out_fence = -1;
            self.out_fence.as_mut() as *mut i32 as u64
        });

        let mut flags = AtomicCommitFlags::NONBLOCK;
        if !fencing {
            flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        let req = self.request(fb, false, in_fence, out_fence_ptr);
        self.fd
            .atomic_commit(flags, req)
            .map_err(|err| PresentError::from_commit("atomic commit failed", err))?;

        // the kernel holds its own reference to the in-fence now
        submission.fence.take();

        if fencing {
            // SAFETY: the kernel wrote the pointer during the commit ioctl above
            let raw = unsafe { std::ptr::read_volatile(self.out_fence.as_ref()) };
            if raw < 0 {
                return Err(PresentError::rejected("commit accepted without an out-fence"));
            }
            // SAFETY: a fresh fd owned by us, returned through OUT_FENCE_PTR
            let out_fence = unsafe { OwnedFd::from_raw_fd(raw) };
            self.events
                .watch_fence(out_fence)
                .map_err(|err| PresentError::Rejected {
                    reason: "failed to watch out-fence".into(),
                    source: Some(err),
                })?;
        }

        debug!(frame = submission.frame, buffer = %submission.buffer, fenced = fencing, "atomic commit queued");
        self.state.queue(submission.buffer, submission.frame, fencing);
        Ok(())
    }

    fn poll_retired(&mut self, timeout: Option<Duration>) -> Result<Option<Retired>, PresentError> {
        if self.state.pending().is_none() {
            return Ok(None);
        }
        let done = self.wait_pending(timeout).map_err(|err| PresentError::Rejected {
            reason: "failed to wait for presentation".into(),
            source: Some(err),
        })?;
        if !done {
            return Ok(None);
        }
        if self.options.fencing {
            self.events.clear_fence();
        } else if let Some(flip) = self.events.take_flip(self.routing.crtc) {
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
        self.options.nonblocking
    }

    fn frame_budget(&self) -> Duration {
        self.budget
    }

    fn take_interrupt(&mut self) -> bool {
        self.events.take_interrupt()
    }
}

impl Drop for AtomicPresenter {
    fn drop(&mut self) {
        if self.state.pending().is_some() {
            let _ = self.wait_pending(Some(self.budget * 2));
        }
        if let Some(saved) = self.saved.take() {
            saved.restore(&self.fd);
        }
        if let Err(err) = self.fd.destroy_property_blob(self.mode_blob) {
            warn!("failed to destroy mode blob: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tests::handle;

    fn candidate(id: u32, compatible: bool, kind: Option<PlaneType>) -> PlaneCandidate {
        PlaneCandidate {
            handle: handle(id),
            compatible,
            kind,
        }
    }

    #[test]
    fn primary_plane_wins() {
        let planes = [
            candidate(40, true, Some(PlaneType::Overlay)),
            candidate(41, false, Some(PlaneType::Primary)),
            candidate(42, true, Some(PlaneType::Cursor)),
            candidate(43, true, Some(PlaneType::Primary)),
        ];
        assert_eq!(pick_plane(&planes), Some(handle(43)));
    }

    #[test]
    fn falls_back_to_overlay_never_cursor() {
        let planes = [
            candidate(42, true, Some(PlaneType::Cursor)),
            candidate(44, true, Some(PlaneType::Overlay)),
        ];
        assert_eq!(pick_plane(&planes), Some(handle(44)));

        let cursors_only = [candidate(42, true, Some(PlaneType::Cursor))];
        assert_eq!(pick_plane(&cursors_only), None);
    }

    #[test]
    fn incompatible_planes_are_ignored() {
        let planes = [candidate(41, false, Some(PlaneType::Primary))];
        assert_eq!(pick_plane(&planes), None);
    }

    #[test]
    fn plane_type_values() {
        assert_eq!(plane_type(1), Some(PlaneType::Primary));
        assert_eq!(plane_type(2), Some(PlaneType::Cursor));
        assert_eq!(plane_type(9), None);
    }

    #[test]
    fn source_rectangle_is_fixed_point() {
        assert_eq!(fixed_16_16(1920), 1920 << 16);
        assert_eq!(fixed_16_16(0), 0);
    }

    #[test]
    fn property_lookup() {
        let table = PropertyTable(vec![
            ("FB_ID".into(), handle(7), 0),
            ("type".into(), handle(8), 1),
        ]);
        assert_eq!(table.find("FB_ID"), Some(handle(7)));
        assert_eq!(table.value("type"), Some(1));
        assert!(matches!(
            table.require("plane", "IN_FENCE_FD"),
            Err(ConfigurationError::MissingProperty {
                name: "IN_FENCE_FD",
                ..
            })
        ));
    }
}
