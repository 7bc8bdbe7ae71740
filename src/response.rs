//! JSON response envelope
//!
//! ```json
//! { "status": "success", "message": "PASS_PURCHASE_SUCCESS", "data": { ... } }
//! { "status": "error", "message": "...", "code": "PHONE_MISMATCH", "message_zh": "...", "message_es": "..." }
//! ```

use std::borrow::Cow;

use serde::Serialize;

use crate::commands::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_zh: Option<Cow<'static, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_es: Option<Cow<'static, str>>,
    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Cow<'static, str>>,
    /// HTTP status for the gateway; not part of the body
    #[serde(skip)]
    pub http_status: u16,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            data: Some(data),
            message_zh: None,
            message_es: None,
            code: None,
            http_status: 200,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(err: &Error) -> Self {
        let kind = err.kind();
        let (code, message_zh, message_es) = match err {
            Error::BusinessRule(violation) => (
                violation.code.clone(),
                Some(violation.message.zh.clone()),
                Some(violation.message.es.clone()),
            ),
            _ => (Cow::Borrowed(kind.as_str()), None, None),
        };
        // Storage details stay in the logs
        let message = if kind.status() >= 500 {
            Cow::Borrowed("internal server error")
        } else {
            Cow::Owned(err.to_string())
        };

        Self {
            status: ResponseStatus::Error,
            message,
            data: None,
            message_zh,
            message_es,
            code: Some(code),
            http_status: kind.status(),
        }
    }
}
