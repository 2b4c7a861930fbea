/*
 * Copyright (C) 2025-2026 Aerys Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io;
use thiserror::Error;

// request-level protocol violations, each mapping to a client-facing
// status code
#[derive(Debug, PartialEq, Clone, Copy, Error)]
pub enum ProtocolError {
    #[error("malformed request")]
    BadRequest,

    #[error("invalid header field")]
    BadHeader,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk framing")]
    InvalidChunk,

    #[error("method not recognized")]
    UnknownMethod,

    #[error("request target too long")]
    UriTooLong,

    #[error("header block too large")]
    HeadersTooLarge,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("expected http request")]
    NotHttp,
}

impl ProtocolError {
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::BadHeader => 400,
            Self::InvalidContentLength => 400,
            Self::UnsupportedTransferEncoding => 501,
            Self::InvalidChunk => 400,
            Self::UnknownMethod => 501,
            Self::UriTooLong => 414,
            Self::HeadersTooLarge => 431,
            Self::BodyTooLarge => 413,
            Self::MethodNotAllowed => 405,
            Self::NotHttp => 400,
        }
    }
}

// the server-wide fault taxonomy. peer-induced faults are not
// programmer errors and are logged quietly; internal faults are not
#[derive(Debug, Error)]
pub enum Error {
    // the peer disconnected or aborted the stream
    #[error("client connection lost")]
    Client,

    // a body or query exceeded its configured limit. recoverable by
    // raising the limit and resuming
    #[error("size limit exceeded")]
    ClientSize,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    // a middleware or codec filter raised
    #[error("filter {key} failed: {msg}")]
    Filter { key: &'static str, msg: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::Client | Self::ClientSize | Self::Protocol(_))
    }

    // status code for an error surfaced before any response bytes went
    // out
    pub fn status(&self) -> u16 {
        match self {
            Self::Client => 400,
            Self::ClientSize => 413,
            Self::Protocol(e) => e.status(),
            Self::Filter { .. } | Self::Internal(_) | Self::Fatal(_) | Self::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_status() {
        assert_eq!(ProtocolError::BadRequest.status(), 400);
        assert_eq!(ProtocolError::UnknownMethod.status(), 501);
        assert_eq!(ProtocolError::UriTooLong.status(), 414);
        assert_eq!(ProtocolError::HeadersTooLarge.status(), 431);
        assert_eq!(ProtocolError::BodyTooLarge.status(), 413);
    }

    #[test]
    fn test_error_status() {
        assert_eq!(Error::ClientSize.status(), 413);
        assert_eq!(Error::Internal("x".into()).status(), 500);
        assert_eq!(Error::Protocol(ProtocolError::UriTooLong).status(), 414);
    }
}
