//! Result codes and the library error type.
//!
//! `ZeResult` carries the stable `ze_result_t` values returned across the
//! API boundary. Internally everything is a [`DriverError`], which maps to
//! exactly one `ZeResult` through [`DriverError::code`].

use std::fmt;

/// Stable API result codes (`ze_result_t`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZeResult {
    Success = 0,
    NotReady = 1,
    ErrorDeviceLost = 0x7000_0001,
    ErrorOutOfHostMemory = 0x7000_0002,
    ErrorOutOfDeviceMemory = 0x7000_0003,
    ErrorUnsupportedFeature = 0x7800_0003,
    ErrorInvalidArgument = 0x7800_0004,
    ErrorInvalidNullHandle = 0x7800_0005,
    ErrorInvalidSize = 0x7800_0008,
    ErrorUnsupportedSize = 0x7800_0009,
    ErrorUnknown = 0x7fff_fffe,
}

impl ZeResult {
    pub fn is_success(self) -> bool {
        self == ZeResult::Success
    }

    /// Raw `ze_result_t` value.
    pub fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ZeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.raw())
    }
}

/// Outcome of handing a batch buffer to the submission channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Success,
    Failed,
    OutOfMemory,
    OutOfHostMemory,
    Unsupported,
    DeviceUninitialized,
}

impl SubmissionStatus {
    /// Translate a flush status into the code surfaced to the caller.
    pub fn to_ze_result(self) -> ZeResult {
        match self {
            SubmissionStatus::Success => ZeResult::Success,
            SubmissionStatus::OutOfHostMemory => ZeResult::ErrorOutOfHostMemory,
            SubmissionStatus::OutOfMemory => ZeResult::ErrorOutOfDeviceMemory,
            SubmissionStatus::Failed
            | SubmissionStatus::Unsupported
            | SubmissionStatus::DeviceUninitialized => ZeResult::ErrorUnknown,
        }
    }
}

/// Errors produced by the command-list engine.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A caller-supplied value is not acceptable in the current configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A kernel needs stateful (bindful or bindless) argument access but the
    /// list uses global-stateless addressing.
    #[error("kernel '{kernel}' argument {arg_index} requires stateful access under global-stateless addressing")]
    StatefulAccessUnderGlobalStateless { kernel: String, arg_index: usize },

    /// Operation attempted on a list in the wrong lifecycle state.
    #[error("command list is {state}, cannot {operation}")]
    InvalidListState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("unsupported size: {0}")]
    UnsupportedSize(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("null or unknown handle: {0}")]
    InvalidHandle(String),

    /// Flush returned a non-success status.
    #[error("submission failed: {0:?}")]
    Submission(SubmissionStatus),

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("out of device memory: requested {requested} bytes")]
    OutOfDeviceMemory { requested: usize },

    /// Shared engine state became unusable (poisoned lock, lost engine).
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// A command buffer failed to decode.
    #[error("malformed command buffer at offset {offset}: {reason}")]
    MalformedCommandBuffer { offset: usize, reason: String },
}

impl DriverError {
    /// The API code this error is surfaced as.
    pub fn code(&self) -> ZeResult {
        match self {
            DriverError::InvalidArgument(_)
            | DriverError::StatefulAccessUnderGlobalStateless { .. }
            | DriverError::InvalidListState { .. } => ZeResult::ErrorInvalidArgument,
            DriverError::UnsupportedFeature(_) => ZeResult::ErrorUnsupportedFeature,
            DriverError::UnsupportedSize(_) => ZeResult::ErrorUnsupportedSize,
            DriverError::InvalidSize(_) => ZeResult::ErrorInvalidSize,
            DriverError::InvalidHandle(_) => ZeResult::ErrorInvalidNullHandle,
            DriverError::Submission(status) => status.to_ze_result(),
            DriverError::OutOfHostMemory => ZeResult::ErrorOutOfHostMemory,
            DriverError::OutOfDeviceMemory { .. } => ZeResult::ErrorOutOfDeviceMemory,
            DriverError::DeviceLost(_) => ZeResult::ErrorDeviceLost,
            DriverError::MalformedCommandBuffer { .. } => ZeResult::ErrorUnknown,
        }
    }
}

impl From<DriverError> for ZeResult {
    fn from(err: DriverError) -> Self {
        err.code()
    }
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Collapse an engine result into the API code.
pub fn to_ze_result<T>(result: &Result<T>) -> ZeResult {
    match result {
        Ok(_) => ZeResult::Success,
        Err(e) => e.code(),
    }
}

/// Check a flush status, turning failures into [`DriverError::Submission`].
pub fn check_submission(status: SubmissionStatus) -> Result<()> {
    if status == SubmissionStatus::Success {
        Ok(())
    } else {
        Err(DriverError::Submission(status))
    }
}

pub(crate) fn lock_poisoned(what: &str) -> DriverError {
    DriverError::DeviceLost(format!("{what} lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_status_mapping() {
        assert_eq!(SubmissionStatus::Success.to_ze_result(), ZeResult::Success);
        assert_eq!(
            SubmissionStatus::OutOfHostMemory.to_ze_result(),
            ZeResult::ErrorOutOfHostMemory
        );
        assert_eq!(
            SubmissionStatus::OutOfMemory.to_ze_result(),
            ZeResult::ErrorOutOfDeviceMemory
        );
        assert_eq!(SubmissionStatus::Failed.to_ze_result(), ZeResult::ErrorUnknown);
    }

    #[test]
    fn test_error_codes() {
        let err = DriverError::StatefulAccessUnderGlobalStateless {
            kernel: "k".into(),
            arg_index: 0,
        };
        assert_eq!(err.code(), ZeResult::ErrorInvalidArgument);
        assert_eq!(
            DriverError::Submission(SubmissionStatus::OutOfMemory).code(),
            ZeResult::ErrorOutOfDeviceMemory
        );
        assert_eq!(ZeResult::from(DriverError::OutOfHostMemory), ZeResult::ErrorOutOfHostMemory);
    }

    #[test]
    fn test_raw_values_match_api() {
        assert_eq!(ZeResult::ErrorInvalidArgument.raw(), 0x7800_0004);
        assert_eq!(ZeResult::ErrorOutOfDeviceMemory.raw(), 0x7000_0003);
        assert!(ZeResult::Success.is_success());
    }

    #[test]
    fn test_check_submission() {
        assert!(check_submission(SubmissionStatus::Success).is_ok());
        let err = check_submission(SubmissionStatus::OutOfHostMemory).unwrap_err();
        assert_eq!(err.code(), ZeResult::ErrorOutOfHostMemory);
    }
}
