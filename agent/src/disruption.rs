//! Disruption configuration shared by the HTTP and gRPC proxies.

use std::time::Duration;

use crate::error::{AgentError, AgentResult};

/// `{average_delay, delay_variation, error_rate, error_code, error_body,
/// excluded_paths}` from the HTTP fault injection contract.
#[derive(Debug, Clone)]
pub struct HttpDisruption {
    pub average_delay: Duration,
    pub delay_variation: Duration,
    pub error_rate: f64,
    pub error_code: u16,
    pub error_body: Vec<u8>,
    pub excluded_paths: Vec<String>,
}

impl HttpDisruption {
    pub fn validate(&self) -> AgentResult<()> {
        if self.delay_variation > self.average_delay {
            return Err(AgentError::Validation(format!(
                "delay_variation ({:?}) must be <= average_delay ({:?})",
                self.delay_variation, self.average_delay
            )));
        }

        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(AgentError::Validation(format!(
                "error_rate must be in [0, 1], got {}",
                self.error_rate
            )));
        }

        if self.error_rate > 0.0 && self.error_code < 100 {
            return Err(AgentError::Validation(format!(
                "error_code must be a valid HTTP status (>= 100), got {}",
                self.error_code
            )));
        }

        Ok(())
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|excluded| excluded == path)
    }
}

/// `{average_delay, delay_variation, error_rate, status_code,
/// status_message, excluded_services}` from the gRPC fault injection
/// contract.
#[derive(Debug, Clone)]
pub struct GrpcDisruption {
    pub average_delay: Duration,
    pub delay_variation: Duration,
    pub error_rate: f64,
    pub status_code: u32,
    pub status_message: String,
    pub excluded_services: Vec<String>,
}

impl GrpcDisruption {
    pub fn validate(&self) -> AgentResult<()> {
        if self.delay_variation > self.average_delay {
            return Err(AgentError::Validation(format!(
                "delay_variation ({:?}) must be <= average_delay ({:?})",
                self.delay_variation, self.average_delay
            )));
        }

        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(AgentError::Validation(format!(
                "error_rate must be in [0, 1], got {}",
                self.error_rate
            )));
        }

        if self.error_rate > 0.0 && self.status_code == 0 {
            return Err(AgentError::Validation(
                "status_code must be non-zero (non-OK) when error_rate > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether `fully_qualified_service` (extracted from a method path's
    /// `/package.Service/Method` shape) is excluded from disruption.
    pub fn is_excluded(&self, fully_qualified_service: &str) -> bool {
        self.excluded_services
            .iter()
            .any(|excluded| excluded == fully_qualified_service)
    }

    /// Extracts the fully qualified service name from a gRPC method path
    /// of the form `/package.Service/Method`.
    pub fn service_from_path(path: &str) -> Option<&str> {
        let rest = path.strip_prefix('/')?;
        rest.split('/').next()
    }
}
