// DRM device access
//
// Opens primary (modeset) or render nodes and reads the resource snapshot
// that `display::resolve` works on.

use std::{
    fs::OpenOptions,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use smithay::{
    backend::{
        drm::{DrmDeviceFd, DrmNode, NodeType},
        udev::{all_gpus, primary_gpu},
    },
    reexports::drm::control::{connector, Device as ControlDevice},
    utils::DeviceFd,
};
use tracing::{debug, info, warn};

use super::{ConnectorDesc, DisplayMode, EncoderDesc, ResourceSnapshot};
use crate::error::ConfigurationError;

const DEFAULT_SEAT: &str = "seat0";

/// An opened DRM node.
#[derive(Debug, Clone)]
pub struct DrmHandle {
    pub path: PathBuf,
    pub fd: DrmDeviceFd,
}

fn open_node(path: &Path) -> std::io::Result<DrmDeviceFd> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok(DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file))))
}

/// Opens the modeset device at `path`, or the first KMS capable primary node.
pub fn open_primary(path: Option<&Path>) -> Result<DrmHandle, ConfigurationError> {
    if let Some(path) = path {
        let fd = open_node(path).map_err(ConfigurationError::device("DRM device"))?;
        if let Err(err) = fd.resource_handles() {
            debug!("resource query on {} failed: {err}", path.display());
            return Err(ConfigurationError::NotModesetCapable(path.to_path_buf()));
        }
        return Ok(DrmHandle {
            path: path.to_path_buf(),
            fd,
        });
    }

    for path in nodes_of_type(NodeType::Primary) {
        let fd = match open_node(&path) {
            Ok(fd) => fd,
            Err(err) => {
                warn!("failed to open {}: {err}", path.display());
                continue;
            }
        };
        // resources answer only on KMS capable devices
        if fd.resource_handles().is_ok() {
            info!("using DRM device {}", path.display());
            return Ok(DrmHandle { path, fd });
        }
    }
    Err(ConfigurationError::NoDevice)
}

/// Opens the render node at `path`, or the first one available.
pub fn open_render(path: Option<&Path>) -> Result<DrmHandle, ConfigurationError> {
    if let Some(path) = path {
        let fd = open_node(path).map_err(ConfigurationError::device("render node"))?;
        return Ok(DrmHandle {
            path: path.to_path_buf(),
            fd,
        });
    }

    nodes_of_type(NodeType::Render)
        .into_iter()
        .find_map(|path| match open_node(&path) {
            Ok(fd) => {
                info!("using render node {}", path.display());
                Some(DrmHandle { path, fd })
            }
            Err(err) => {
                warn!("failed to open {}: {err}", path.display());
                None
            }
        })
        .ok_or(ConfigurationError::NoDevice)
}

fn seat_name() -> String {
    std::env::var("XDG_SEAT").unwrap_or_else(|_| DEFAULT_SEAT.to_string())
}

/// `ty` nodes of every GPU on the seat, boot GPU first.
fn nodes_of_type(ty: NodeType) -> Vec<PathBuf> {
    let seat = seat_name();
    let mut gpus = Vec::new();
    match primary_gpu(&seat) {
        Ok(Some(path)) => gpus.push(path),
        Ok(None) => debug!("no primary GPU on {seat}"),
        Err(err) => warn!("failed to query the primary GPU on {seat}: {err}"),
    }
    match all_gpus(&seat) {
        Ok(all) => gpus.extend(all),
        Err(err) => warn!("failed to enumerate GPUs on {seat}: {err}"),
    }
    collect_nodes(gpus, |gpu| {
        let node = DrmNode::from_path(gpu).ok()?;
        if node.ty() == ty {
            return Some(gpu.to_path_buf());
        }
        node.node_with_type(ty)?.ok()?.dev_path()
    })
}

/// Maps GPUs to device paths, dropping misses and duplicates in order.
fn collect_nodes(
    gpus: Vec<PathBuf>,
    mut node_path: impl FnMut(&Path) -> Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = Vec::with_capacity(gpus.len());
    for gpu in gpus {
        match node_path(&gpu) {
            Some(path) if !nodes.contains(&path) => nodes.push(path),
            Some(_) => {}
            None => debug!("{} has no node of the requested type", gpu.display()),
        }
    }
    nodes
}

/// Reads connectors, encoders and CRTCs in resource order.
pub fn snapshot(fd: &DrmDeviceFd) -> Result<ResourceSnapshot, ConfigurationError> {
    let resources = fd
        .resource_handles()
        .map_err(ConfigurationError::device("DRM resources"))?;

    let mut connectors = Vec::with_capacity(resources.connectors().len());
    for handle in resources.connectors() {
        let info = match fd.get_connector(*handle, true) {
            Ok(info) => info,
            Err(err) => {
                warn!("skipping connector {handle:?}: {err}");
                continue;
            }
        };
        connectors.push(ConnectorDesc {
            handle: *handle,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            encoders: info.encoders().to_vec(),
            current_encoder: info.current_encoder(),
            modes: info.modes().iter().copied().map(DisplayMode::from_drm).collect(),
        });
    }

    let mut encoders = Vec::with_capacity(resources.encoders().len());
    for handle in resources.encoders() {
        let info = fd
            .get_encoder(*handle)
            .map_err(ConfigurationError::device("encoder"))?;
        encoders.push(EncoderDesc {
            handle: *handle,
            crtc: info.crtc(),
            possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
        });
    }

    Ok(ResourceSnapshot {
        connectors,
        encoders,
        crtcs: resources.crtcs().to_vec(),
    })
}

/// Human readable listing of every connector and its modes.
pub fn describe(snapshot: &ResourceSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, connector) in snapshot.connectors.iter().enumerate() {
        lines.push(format!(
            "[{index}] {} (id {}) {}",
            connector.name,
            u32::from(connector.handle),
            if connector.connected {
                "connected"
            } else {
                "disconnected"
            }
        ));
        for mode in &connector.modes {
            lines.push(format!("      {mode}"));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tests::snapshot as fake_snapshot;

    #[test]
    fn describe_lists_connectors_and_modes() {
        let lines = describe(&fake_snapshot());
        assert_eq!(lines[0], "[0] DP-30 (id 30) disconnected");
        assert!(lines.iter().any(|l| l.trim() == "1920x1080@60 (preferred)"));
        // three connectors with three modes each
        assert_eq!(lines.len(), 12);
    }

    #[test]
    fn gpu_nodes_keep_boot_gpu_first_without_duplicates() {
        let gpus = vec![
            PathBuf::from("/dev/dri/card1"),
            PathBuf::from("/dev/dri/card0"),
            PathBuf::from("/dev/dri/card1"),
            PathBuf::from("/dev/dri/card2"),
        ];
        let nodes = collect_nodes(gpus, |gpu| match gpu.to_str() {
            Some("/dev/dri/card0") => Some(PathBuf::from("/dev/dri/renderD128")),
            Some("/dev/dri/card1") => Some(PathBuf::from("/dev/dri/renderD129")),
            // display only controller without a render node
            _ => None,
        });
        assert_eq!(
            nodes,
            vec![
                PathBuf::from("/dev/dri/renderD129"),
                PathBuf::from("/dev/dri/renderD128"),
            ]
        );
    }

    #[test]
    fn missing_device_path_is_reported() {
        let err = open_primary(Some(Path::new("/nonexistent/dri/card9"))).unwrap_err();
        assert!(matches!(err, ConfigurationError::Device { .. }));
    }
}
