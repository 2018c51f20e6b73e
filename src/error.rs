// error.rs — Error taxonomy for the equalization pipeline.
//
// Every failure is fatal to the run that hit it: these are one-shot,
// deterministic computations, so nothing here is retried. The coordinator
// surfaces the first error and aborts the remaining stages.

use std::fmt;
use std::path::PathBuf;

use crate::backend::BufferRole;

/// Direction of a host/device copy, used in transfer error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    Fill,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => write!(f, "host→device"),
            TransferDirection::DeviceToHost => write!(f, "device→host"),
            TransferDirection::Fill => write!(f, "fill"),
        }
    }
}

/// Errors produced while loading, splitting, equalizing or assembling an image.
#[derive(Debug, thiserror::Error)]
pub enum HistEqError {
    /// The image file could not be read or decoded.
    #[error("failed to load image {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// The result image could not be written.
    #[error("failed to save image {}: {reason}", path.display())]
    Save { path: PathBuf, reason: String },

    /// Platform/device enumeration or device creation failed.
    #[error("device selection failed: {0}")]
    Device(String),

    /// A kernel failed to build. `log` carries the backend's diagnostics.
    #[error("kernel `{kernel}` failed to compile\nbuild log:\n{log}")]
    Compile { kernel: String, log: String },

    /// Device memory for a buffer could not be obtained.
    #[error("allocating {bytes} bytes for the {role} buffer failed: {reason}")]
    Allocation {
        role: BufferRole,
        bytes: usize,
        reason: String,
    },

    /// A host/device copy or fill failed.
    #[error("{direction} transfer on the {role} buffer failed: {reason}")]
    Transfer {
        role: BufferRole,
        direction: TransferDirection,
        reason: String,
    },

    /// A kernel launch failed, or its result broke a host-checked invariant.
    #[error("stage `{stage}` failed: {reason}")]
    Launch { stage: String, reason: String },

    /// Planes handed to recombination (or assembly) disagree in size.
    #[error(
        "{plane} plane is {found_width}x{found_height}, expected {expected_width}x{expected_height}"
    )]
    InvalidDimensions {
        plane: &'static str,
        expected_width: usize,
        expected_height: usize,
        found_width: usize,
        found_height: usize,
    },

    /// Images must have exactly 1 or 3 channels.
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    UnsupportedChannels(usize),

    /// An interleaved sample buffer does not hold width * height * channels bytes.
    #[error("interleaved buffer holds {found} bytes, a {width}x{height}x{channels} image needs {expected}")]
    SampleCount {
        width: usize,
        height: usize,
        channels: usize,
        expected: usize,
        found: usize,
    },

    /// An assembled image does not have the channel count it was split with.
    #[error("assembled image has {found} channel(s), expected {expected}")]
    ChannelMismatch { expected: usize, found: usize },
}

impl HistEqError {
    pub(crate) fn launch(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        HistEqError::Launch { stage: stage.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, HistEqError>;
