use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Bad device, connector, mode or format selection.
///
/// Always reported before any display state is changed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no usable DRM device found")]
    NoDevice,
    #[error("{} does not look like a modeset device", .0.display())]
    NotModesetCapable(PathBuf),
    #[error("no connected connector")]
    NoSuitableOutput,
    #[error("connector {0} not found or not connected")]
    ConnectorNotFound(u32),
    #[error("mode {mode:?} is not advertised by connector {connector}")]
    ModeNotFound { mode: String, connector: String },
    #[error("no encoder/CRTC combination can drive connector {connector}")]
    ResourceConflict { connector: String },
    #[error("invalid pixel format {0:?}")]
    InvalidFormat(String),
    #[error("invalid format modifier {0:?}, expected a decimal or 0x prefixed number")]
    InvalidModifier(String),
    #[error("invalid mode string {0:?}, expected WxH or WxH@Hz")]
    InvalidModeString(String),
    #[error("offscreen rendering needs an explicit mode, e.g. 1024x768")]
    MissingMode,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("{object} has no {name} property")]
    MissingProperty {
        object: &'static str,
        name: &'static str,
    },
    #[error("failed to query {what}")]
    Device {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ConfigurationError {
    pub(crate) fn device(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ConfigurationError::Device { what, source }
    }
}

/// Errors a presentation strategy reports for a single operation.
#[derive(Debug, Error)]
pub enum PresentError {
    /// A previous presentation has not retired yet. Transient.
    #[error("previous presentation still pending")]
    Busy,
    #[error("presentation rejected: {reason}")]
    Rejected {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("no retirement signal within {0:?}")]
    Timeout(Duration),
}

impl PresentError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        PresentError::Rejected {
            reason: reason.into(),
            source: None,
        }
    }

    /// Classifies a kernel error: `EBUSY` means a flip is still queued on the
    /// CRTC, everything else is a refusal.
    pub fn from_commit(reason: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::ResourceBusy {
            PresentError::Busy
        } else {
            PresentError::Rejected {
                reason: reason.to_string(),
                source: Some(err),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to allocate buffer {index} ({width}x{height})")]
    Allocation {
        index: usize,
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to export buffer for rendering: {0}")]
    Export(String),
    #[error("failed to create a scan-out framebuffer")]
    Import(#[source] io::Error),
    #[error("buffer {0} is not in a state that allows {1}")]
    InvalidTransition(usize, &'static str),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to set up the GPU context: {0}")]
    Setup(String),
    #[error("failed to draw frame {frame}: {reason}")]
    Draw { frame: u64, reason: String },
}

/// Coarse classification of [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ResourceExhaustion,
    PresentationRejected,
    RetirementTimeout,
    Render,
    Buffer,
    Device,
}

/// Fatal errors that abort the frame loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("buffer ring of {ring} exhausted with nothing left to retire")]
    ResourceExhaustion { ring: usize },
    #[error("frame {frame}: {source}")]
    PresentationRejected {
        frame: u64,
        #[source]
        source: PresentError,
    },
    #[error("frame {frame}: display did not retire the previous buffer after {attempts} attempts ({waited:?})")]
    RetirementTimeout {
        frame: u64,
        attempts: u32,
        waited: Duration,
    },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("{what}")]
    Device {
        what: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            PipelineError::PresentationRejected { .. } => ErrorKind::PresentationRejected,
            PipelineError::RetirementTimeout { .. } => ErrorKind::RetirementTimeout,
            PipelineError::Render(_) => ErrorKind::Render,
            PipelineError::Buffer(_) => ErrorKind::Buffer,
            PipelineError::Device { .. } => ErrorKind::Device,
        }
    }

    pub(crate) fn device(what: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let what = what.into();
        move |source| PipelineError::Device { what, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebusy_is_transient() {
        let err = io::Error::from(io::ErrorKind::ResourceBusy);
        assert!(matches!(
            PresentError::from_commit("page flip", err),
            PresentError::Busy
        ));
    }

    #[test]
    fn other_kernel_errors_are_rejections() {
        let err = io::Error::from(io::ErrorKind::InvalidInput);
        match PresentError::from_commit("atomic commit", err) {
            PresentError::Rejected { reason, source } => {
                assert_eq!(reason, "atomic commit");
                assert!(source.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pipeline_error_kinds() {
        let err = PipelineError::from(ConfigurationError::NoSuitableOutput);
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = PipelineError::PresentationRejected {
            frame: 0,
            source: PresentError::rejected("bad fb"),
        };
        assert_eq!(err.kind(), ErrorKind::PresentationRejected);
        assert!(err.to_string().contains("bad fb"));
    }
}
