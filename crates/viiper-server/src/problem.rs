//! HTTP-style problem responses for the control plane.
//!
//! Handlers return typed failures; only the dispatcher turns them into wire
//! bytes, as `{"status":…,"title":…,"detail":…}` followed by `\n`.

use serde::Serialize;
use viiper_bus::BusError;
use viiper_devices::DeviceError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Problem {
    pub status: u16,
    pub title: String,
    pub detail: String,
}

impl Problem {
    pub fn bad_request(detail: impl Into<String>) -> Problem {
        Problem {
            status: 400,
            title: "Bad Request".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Problem {
        Problem {
            status: 401,
            title: "Unauthorized".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Problem {
        Problem {
            status: 404,
            title: "Not Found".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Problem {
        Problem {
            status: 409,
            title: "Conflict".to_owned(),
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Problem {
        Problem {
            status: 500,
            title: "Internal Server Error".to_owned(),
            detail: detail.into(),
        }
    }

    /// The wire form: single JSON object, newline, close.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"status":500,"title":"Internal Server Error","detail":"encoding failure"}"#
                .to_vec()
        });
        line.push(b'\n');
        line
    }
}

impl From<BusError> for Problem {
    fn from(err: BusError) -> Problem {
        match &err {
            BusError::AlreadyAllocated(_) | BusError::AlreadyRegistered | BusError::StreamBusy => {
                Problem::conflict(err.to_string())
            }
            BusError::BusNotFound(_) | BusError::DeviceNotFound(_) => {
                Problem::not_found(err.to_string())
            }
            BusError::InvalidProfile(_) => Problem::bad_request(err.to_string()),
        }
    }
}

impl From<DeviceError> for Problem {
    fn from(err: DeviceError) -> Problem {
        Problem::bad_request(err.to_string())
    }
}
