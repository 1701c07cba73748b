//! RPC Surface Types
//!
//! Requests and responses exchanged on client connections, plus the
//! wire error codes the taxonomy maps onto.

use serde::{Deserialize, Serialize};

use crate::commitlog::Record;
use crate::distributed::ClusterServer;
use crate::error::Error;

/// Client requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Append one record
    Produce { record: Record },
    /// Read the record at an offset
    Consume { offset: u64 },
    /// Switch the connection into produce-streaming mode
    ProduceStream,
    /// Stream records starting at an offset until the client hangs up
    ConsumeStream { offset: u64 },
    /// List the cluster's servers
    GetServers,
}

/// Server responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Produce { offset: u64 },
    Consume { record: Record },
    Servers { servers: Vec<ClusterServer> },
    Error { code: ErrorCode, message: String },
}

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The requested offset does not exist
    NotFound,
    /// The node cannot accept writes
    NotLeader,
    /// The subject is not permitted
    PermissionDenied,
    /// No subject could be established
    Unauthenticated,
    /// The operation did not complete in time
    Timeout,
    /// Anything else
    Internal,
}

impl Response {
    /// Map an error into its wire representation
    pub fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::OffsetOutOfRange(_) => ErrorCode::NotFound,
            Error::NotLeader(_) | Error::NoLeader => ErrorCode::NotLeader,
            Error::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Error::Unauthenticated => ErrorCode::Unauthenticated,
            Error::Timeout(_) => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        };
        Response::Error {
            code,
            message: err.to_string(),
        }
    }
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Produce { .. } => "Produce",
            Request::Consume { .. } => "Consume",
            Request::ProduceStream => "ProduceStream",
            Request::ConsumeStream { .. } => "ConsumeStream",
            Request::GetServers => "GetServers",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (Error::OffsetOutOfRange(3), ErrorCode::NotFound),
            (Error::NoLeader, ErrorCode::NotLeader),
            (Error::Unauthenticated, ErrorCode::Unauthenticated),
            (Error::Timeout("t".into()), ErrorCode::Timeout),
            (Error::Internal("x".into()), ErrorCode::Internal),
        ];

        for (err, expected) in cases {
            match Response::from_error(&err) {
                Response::Error { code, .. } => assert_eq!(code, expected),
                _ => panic!("expected error response"),
            }
        }
    }
}
