// Display resource resolution
//
// Picks the connector, encoder, CRTC and mode used for the whole run:
// - a `ResourceSnapshot` is read once from the device (see `device.rs`)
// - `resolve` selects a hardware-valid routing from it without touching
//   any display state, so bad selections fail before the first modeset

pub mod device;

use std::{fmt, time::Duration};

use smithay::{
    backend::allocator::{Fourcc, Modifier},
    reexports::drm::control::{connector, crtc, encoder, Mode, ModeTypeFlags},
};
use tracing::{debug, info, warn};

use crate::error::ConfigurationError;

/// Refresh rate assumed when a mode does not advertise one.
const FALLBACK_REFRESH_HZ: u32 = 60;

/// Resolution + refresh + timing of an output.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMode {
    pub name: String,
    pub width: u16,
    pub height: u16,
    /// Vertical refresh in Hz, 0 when unknown.
    pub refresh: u32,
    pub preferred: bool,
    raw: Option<Mode>,
}

impl DisplayMode {
    pub fn from_drm(mode: Mode) -> Self {
        let (width, height) = mode.size();
        Self {
            name: mode.name().to_string_lossy().into_owned(),
            width,
            height,
            refresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
            raw: Some(mode),
        }
    }

    /// A mode with no kernel timing behind it, used when rendering offscreen.
    pub fn synthetic(width: u16, height: u16, refresh: u32) -> Self {
        Self {
            name: format!("{width}x{height}"),
            width,
            height,
            refresh,
            preferred: false,
            raw: None,
        }
    }

    /// Kernel mode descriptor, absent for synthetic modes.
    pub fn raw(&self) -> Option<Mode> {
        self.raw
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    pub fn area(&self) -> u32 {
        self.width as u32 * self.height as u32
    }

    /// Time between two vblanks.
    pub fn frame_budget(&self) -> Duration {
        let refresh = if self.refresh == 0 {
            FALLBACK_REFRESH_HZ
        } else {
            self.refresh
        };
        Duration::from_nanos(1_000_000_000 / refresh as u64)
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.refresh)?;
        if self.preferred {
            write!(f, " (preferred)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorDesc {
    pub handle: connector::Handle,
    pub name: String,
    pub connected: bool,
    pub encoders: Vec<encoder::Handle>,
    pub current_encoder: Option<encoder::Handle>,
    pub modes: Vec<DisplayMode>,
}

#[derive(Debug, Clone)]
pub struct EncoderDesc {
    pub handle: encoder::Handle,
    /// CRTC currently driven by this encoder.
    pub crtc: Option<crtc::Handle>,
    pub possible_crtcs: Vec<crtc::Handle>,
}

/// Connectors, encoders and CRTCs as reported by the device, in resource order.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub connectors: Vec<ConnectorDesc>,
    pub encoders: Vec<EncoderDesc>,
    pub crtcs: Vec<crtc::Handle>,
}

impl ResourceSnapshot {
    fn encoder(&self, handle: encoder::Handle) -> Option<&EncoderDesc> {
        self.encoders.iter().find(|e| e.handle == handle)
    }

    fn crtc_index(&self, crtc: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|c| *c == crtc)
    }
}

/// What the user asked for. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayRequest {
    /// Advertised mode name, optionally suffixed with `@Hz`.
    pub mode: Option<String>,
    /// Required refresh rate, 0 for any.
    pub refresh: u32,
    /// Connector object ID, or index into the connector list.
    pub connector: Option<u32>,
}

impl DisplayRequest {
    /// Splits `mode` into the name to match and the refresh filter.
    pub fn mode_filter(&self) -> Result<Option<(String, u32)>, ConfigurationError> {
        let Some(mode) = self.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(None);
        };
        match mode.split_once('@') {
            Some((name, hz)) => {
                let hz = hz
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigurationError::InvalidModeString(mode.to_string()))?;
                Ok(Some((name.trim().to_string(), hz)))
            }
            None => Ok(Some((mode.to_string(), self.refresh))),
        }
    }
}

/// Parses a `WxH` or `WxH@Hz` string into a synthetic mode.
pub fn parse_mode_size(mode: &str) -> Result<DisplayMode, ConfigurationError> {
    let invalid = || ConfigurationError::InvalidModeString(mode.to_string());
    let (size, refresh) = match mode.split_once('@') {
        Some((size, hz)) => (size, hz.trim().parse::<u32>().map_err(|_| invalid())?),
        None => (mode, 0),
    };
    let (w, h) = size.trim().split_once('x').ok_or_else(invalid)?;
    let width = w.trim().parse::<u16>().map_err(|_| invalid())?;
    let height = h.trim().parse::<u16>().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok(DisplayMode::synthetic(width, height, refresh))
}

/// Builds a fourcc from up to four characters, padding with spaces.
pub fn parse_fourcc(code: &str) -> Result<Fourcc, ConfigurationError> {
    let bytes = code.as_bytes();
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(ConfigurationError::InvalidFormat(code.to_string()));
    }
    let mut raw = [b' '; 4];
    raw[..bytes.len()].copy_from_slice(bytes);
    Fourcc::try_from(u32::from_le_bytes(raw))
        .map_err(|_| ConfigurationError::InvalidFormat(code.to_string()))
}

/// A connector → encoder → CRTC path the hardware can drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub connector: connector::Handle,
    pub connector_name: String,
    pub encoder: encoder::Handle,
    pub crtc: crtc::Handle,
    /// Position of `crtc` in the device's CRTC list; plane masks are indexed by it.
    pub crtc_index: usize,
}

/// The output configuration fixed at startup.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// `None` when rendering offscreen.
    pub routing: Option<Routing>,
    pub mode: DisplayMode,
    pub format: Fourcc,
    pub modifier: Modifier,
}

impl DisplayConfig {
    pub fn offscreen(mode: DisplayMode, format: Fourcc, modifier: Modifier) -> Self {
        Self {
            routing: None,
            mode,
            format,
            modifier,
        }
    }

    pub fn frame_budget(&self) -> Duration {
        self.mode.frame_budget()
    }
}

/// Selects connector, mode, encoder and CRTC from `snapshot`.
pub fn resolve(
    snapshot: &ResourceSnapshot,
    request: &DisplayRequest,
    format: Fourcc,
    modifier: Modifier,
) -> Result<DisplayConfig, ConfigurationError> {
    let connector = select_connector(snapshot, request.connector)?;
    let mode = select_mode(connector, request)?;
    let routing = select_routing(snapshot, connector)?;

    info!(
        connector = %routing.connector_name,
        crtc = ?routing.crtc,
        encoder = ?routing.encoder,
        %mode,
        "resolved display output"
    );

    Ok(DisplayConfig {
        routing: Some(routing),
        mode,
        format,
        modifier,
    })
}

fn select_connector(
    snapshot: &ResourceSnapshot,
    hint: Option<u32>,
) -> Result<&ConnectorDesc, ConfigurationError> {
    match hint {
        Some(id) => {
            let by_id = snapshot
                .connectors
                .iter()
                .find(|c| u32::from(c.handle) == id);
            let candidate = by_id.or_else(|| snapshot.connectors.get(id as usize));
            match candidate {
                Some(c) if c.connected => Ok(c),
                _ => Err(ConfigurationError::ConnectorNotFound(id)),
            }
        }
        None => {
            let mut connected = snapshot.connectors.iter().filter(|c| c.connected);
            let first = connected.next().ok_or(ConfigurationError::NoSuitableOutput)?;
            if connected.next().is_some() {
                debug!("more than one connected connector, using {}", first.name);
            }
            Ok(first)
        }
    }
}

fn select_mode(
    connector: &ConnectorDesc,
    request: &DisplayRequest,
) -> Result<DisplayMode, ConfigurationError> {
    if let Some((name, refresh)) = request.mode_filter()? {
        return connector
            .modes
            .iter()
            .find(|m| m.name == name && (refresh == 0 || m.refresh == refresh))
            .cloned()
            .ok_or_else(|| ConfigurationError::ModeNotFound {
                mode: request.mode.clone().unwrap_or(name),
                connector: connector.name.clone(),
            });
    }

    // preferred mode, else the largest one
    let mut best: Option<&DisplayMode> = None;
    for mode in &connector.modes {
        if mode.preferred {
            return Ok(mode.clone());
        }
        if best.map_or(true, |b| mode.area() > b.area()) {
            best = Some(mode);
        }
    }
    best.cloned().ok_or(ConfigurationError::NoSuitableOutput)
}

fn select_routing(
    snapshot: &ResourceSnapshot,
    connector: &ConnectorDesc,
) -> Result<Routing, ConfigurationError> {
    let routing = |encoder: &EncoderDesc, crtc: crtc::Handle| {
        snapshot.crtc_index(crtc).map(|crtc_index| Routing {
            connector: connector.handle,
            connector_name: connector.name.clone(),
            encoder: encoder.handle,
            crtc,
            crtc_index,
        })
    };

    // keep whatever routing is already active when it is valid
    if let Some(encoder) = connector
        .current_encoder
        .filter(|e| connector.encoders.contains(e))
        .and_then(|e| snapshot.encoder(e))
    {
        if let Some(crtc) = encoder.crtc.filter(|c| encoder.possible_crtcs.contains(c)) {
            if let Some(routing) = routing(encoder, crtc) {
                return Ok(routing);
            }
        }
        warn!(
            "current encoder {:?} of {} has no usable CRTC, searching",
            encoder.handle, connector.name
        );
    }

    for handle in &connector.encoders {
        let Some(encoder) = snapshot.encoder(*handle) else {
            continue;
        };
        for crtc in &encoder.possible_crtcs {
            if let Some(routing) = routing(encoder, *crtc) {
                return Ok(routing);
            }
        }
    }

    Err(ConfigurationError::ResourceConflict {
        connector: connector.name.clone(),
    })
}
