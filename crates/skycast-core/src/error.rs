//! Error types shared by SkyCast crates.
//!
//! Every HTTP adapter classifies reqwest failures through
//! [`ReqwestErrorExt`], so a timeout means the same thing for the geocoder
//! and for each forecast provider.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Config rejected: {0}")]
    Rejected(String),
}

/// How an HTTP call to an upstream failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Upstream did not answer in time")]
    Timeout,

    #[error("Upstream answered HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unreadable upstream body: {0}")]
    Body(String),
}

pub trait ReqwestErrorExt {
    fn into_network_error(self) -> NetworkError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_network_error(self) -> NetworkError {
        if self.is_timeout() {
            return NetworkError::Timeout;
        }
        if self.is_decode() || self.is_body() {
            return NetworkError::Body(self.to_string());
        }
        match self.status() {
            Some(status) => NetworkError::Status {
                status: status.as_u16(),
                message: self.to_string(),
            },
            None => NetworkError::Unreachable(self.to_string()),
        }
    }
}
