use std::fmt;

use anyhow::Error;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureErrorKind {
    /// Invalid lifecycle transition (double start, stop without start).
    Logic,
    /// Log creation failure, short write, failed read or seek.
    Storage,
    /// Malformed input handed to a component.
    Argument,
    /// The encoder could not be run or exited unsuccessfully.
    ExternalProcess,
    /// The log is corrupted in a way normal operation never produces.
    InternalInvariant,
}

#[derive(Debug, Clone)]
pub struct CaptureError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
    pub kind: CaptureErrorKind,
}

impl CaptureError {
    fn new(kind: CaptureErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            kind,
        }
    }

    pub fn logic(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::Logic, code, message)
    }

    pub fn storage(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::Storage, code, message)
    }

    pub fn argument(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::Argument, code, message)
    }

    pub fn internal_invariant(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::InternalInvariant, code, message)
    }

    /// Encoder failure. `status` is `None` when the process never ran or was
    /// killed by a signal.
    pub fn external_process(
        code: &'static str,
        message: impl Into<String>,
        status: Option<i32>,
    ) -> Self {
        Self::new(CaptureErrorKind::ExternalProcess, code, message)
            .with_details(json!({ "exit_status": status }))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.details
            .as_ref()?
            .get("exit_status")?
            .as_i64()
            .and_then(|status| i32::try_from(status).ok())
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code.to_owned(),
                kind: Some(self.kind),
                message: self.message.clone(),
                details: self.details.clone(),
            },
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CaptureError {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

impl ErrorEnvelope {
    /// Envelope for failures that carry no [`CaptureError`], such as a bad
    /// config file.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: ErrorEnvelopeBody {
                code: "E_UNCLASSIFIED".to_owned(),
                kind: None,
                message: message.into(),
                details: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<CaptureErrorKind>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn find_capture_error(error: &Error) -> Option<&CaptureError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CaptureError>())
}
