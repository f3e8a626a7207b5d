// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Maps raw transport failures onto [`NetworkErrorKind`].
//!
//! Classification walks the `source()` chain, so a `reqwest::Error` wrapping
//! a hyper error wrapping an `io::Error` is judged by the most specific cause
//! it carries. Anything unrecognised yields `None` and is treated by callers
//! as a general, non-retryable failure.

use std::{error::Error as StdError, io};

use crate::error::{NetworkErrorKind, TransportError};

/// Classify an error into one of the known network kinds.
pub fn classify(err: &(dyn StdError + 'static)) -> Option<NetworkErrorKind> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(transport) = err.downcast_ref::<TransportError>() {
            return classify_transport(transport);
        }
        if let Some(request) = err.downcast_ref::<reqwest::Error>() {
            return classify_reqwest(request);
        }
        if let Some(kind) = err
            .downcast_ref::<io::Error>()
            .and_then(|io| classify_io_kind(io.kind()))
        {
            return Some(kind);
        }
        current = err.source();
    }
    None
}

/// True for the failures a user would call "the network": the classified
/// kinds plus a resource that does not exist.
pub fn is_common_network_error(err: &(dyn StdError + 'static)) -> bool {
    classify(err).is_some() || is_missing_resource(err)
}

fn is_missing_resource(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(transport) = err.downcast_ref::<TransportError>() {
            return matches!(
                transport,
                TransportError::Status {
                    status: 404 | 410,
                    ..
                }
            );
        }
        if let Some(status) = err
            .downcast_ref::<reqwest::Error>()
            .and_then(reqwest::Error::status)
        {
            return matches!(status.as_u16(), 404 | 410);
        }
        if err
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn classify_transport(err: &TransportError) -> Option<NetworkErrorKind> {
    match err {
        TransportError::Request { source } => classify_reqwest(source),
        TransportError::Timeout { .. } => Some(NetworkErrorKind::ConnectionTimeout),
        TransportError::IncompleteBody { .. } => Some(NetworkErrorKind::ConnectionReset),
        TransportError::RangeNotHonored { .. } | TransportError::UnexpectedLength { .. } => {
            Some(NetworkErrorKind::ProtocolError)
        }
        TransportError::Cancelled => Some(NetworkErrorKind::OperationCancelled),
        // Local disk trouble and HTTP statuses are not network conditions.
        TransportError::Status { .. } | TransportError::FileWrite { .. } => None,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> Option<NetworkErrorKind> {
    if err.is_timeout() {
        return Some(NetworkErrorKind::ConnectionTimeout);
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(kind) = cause
            .downcast_ref::<io::Error>()
            .and_then(|io| classify_io_kind(io.kind()))
        {
            return Some(kind);
        }
        source = cause.source();
    }

    if err.is_body() {
        // The body stream broke after the head arrived: the peer went away.
        Some(NetworkErrorKind::ConnectionReset)
    } else if err.is_decode() {
        Some(NetworkErrorKind::ProtocolError)
    } else {
        None
    }
}

const fn classify_io_kind(kind: io::ErrorKind) -> Option<NetworkErrorKind> {
    match kind {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(NetworkErrorKind::ConnectionReset),
        io::ErrorKind::TimedOut => Some(NetworkErrorKind::ConnectionTimeout),
        io::ErrorKind::InvalidData => Some(NetworkErrorKind::ProtocolError),
        _ => None,
    }
}
