//! Exchange gateway error types.

use thiserror::Error;

/// Errors returned by an [`ExchangeGateway`](super::ExchangeGateway).
///
/// Split into retryable kinds (network trouble, rate limits, exchange-side
/// 5xx) and terminal kinds (the exchange understood the request and refused it).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Network failure, timeout or exchange-side 5xx.
    #[error("Transient gateway error: {0}")]
    Transient(String),

    /// Rate limited by the exchange (HTTP 429/418).
    #[error("Rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    /// The exchange rejected the request parameters.
    #[error("Rejected by exchange: [{code}] {message}")]
    Rejected { code: i64, message: String },

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The trading pair is not listed.
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_) | GatewayError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 | 418 => GatewayError::RateLimited {
                    status: status.as_u16(),
                },
                code if code >= 500 => GatewayError::Transient(err.to_string()),
                code => GatewayError::Rejected {
                    code: -(code as i64),
                    message: err.to_string(),
                },
            }
        } else {
            // Timeouts, connection resets, DNS failures
            GatewayError::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Transient("reset".into()).is_retryable());
        assert!(GatewayError::RateLimited { status: 429 }.is_retryable());
        assert!(!GatewayError::Rejected {
            code: -2010,
            message: "insufficient balance".into()
        }
        .is_retryable());
        assert!(!GatewayError::Decode("eof".into()).is_retryable());
        assert!(!GatewayError::UnknownSymbol("FOOUSDT".into()).is_retryable());
    }
}
