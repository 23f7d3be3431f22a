use thiserror::Error;

/// Why an outbound request ended without a usable status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpClientError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("send header failed")]
    SendHeaderFailed,
    #[error("send payload failed")]
    SendPayloadFailed,
    #[error("not connected")]
    NotConnected,
    #[error("connection lost")]
    ConnectionLost,
    #[error("no HTTP server")]
    NoHttpServer,
    #[error("not enough ram")]
    TooLittleRam,
    #[error("Transfer-Encoding not supported")]
    Encoding,
    #[error("stream write error")]
    StreamWrite,
    #[error("read timeout")]
    ReadTimeout,
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("request was never started")]
    NoBegin,
    #[error("malformed chunk")]
    MalformedChunk,
}

impl HttpClientError {
    /// Stable negative code reported alongside HTTP status codes.
    pub fn code(self) -> i32 {
        match self {
            Self::ConnectionRefused => -1,
            Self::SendHeaderFailed => -2,
            Self::SendPayloadFailed => -3,
            Self::NotConnected => -4,
            Self::ConnectionLost => -5,
            Self::NoHttpServer => -7,
            Self::TooLittleRam => -8,
            Self::Encoding => -9,
            Self::StreamWrite => -10,
            Self::ReadTimeout => -11,
            Self::ConnectTimeout => -12,
            Self::NoBegin => -13,
            Self::MalformedChunk => -14,
        }
    }

    /// Failures of the network path rather than of the peer's response. Only these are retried.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused
                | Self::SendHeaderFailed
                | Self::SendPayloadFailed
                | Self::NotConnected
                | Self::ConnectionLost
                | Self::ReadTimeout
                | Self::ConnectTimeout
        )
    }
}

/// `200`, or `-12 connect timeout`.
pub fn describe_result(result: Result<u16, HttpClientError>) -> String {
    match result {
        Ok(status) => status.to_string(),
        Err(err) => format!("{} {err}", err.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HttpClientError::ConnectionRefused.code(), -1);
        assert_eq!(HttpClientError::NoHttpServer.code(), -7);
        assert_eq!(HttpClientError::ConnectTimeout.code(), -12);
        assert_eq!(HttpClientError::MalformedChunk.code(), -14);
    }

    #[test]
    fn protocol_errors_are_not_transport() {
        assert!(HttpClientError::ReadTimeout.is_transport());
        assert!(HttpClientError::ConnectionLost.is_transport());
        assert!(!HttpClientError::Encoding.is_transport());
        assert!(!HttpClientError::MalformedChunk.is_transport());
        assert!(!HttpClientError::NoBegin.is_transport());
    }

    #[test]
    fn results_describe_themselves() {
        assert_eq!(describe_result(Ok(204)), "204");
        assert_eq!(
            describe_result(Err(HttpClientError::ConnectTimeout)),
            "-12 connect timeout"
        );
    }
}
