// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The error types used by the throttle.
//!
//! The throttle produces three kinds of errors of its own: configuration
//! validation errors, admissions refused because the circuit breaker is open,
//! and admissions refused because the throttle was closed. Everything else is
//! an application error passing through the throttle unchanged: the throttle
//! observes such errors for bookkeeping and always re-propagates them, with
//! the original error reachable through the [source][std::error::Error::source]
//! chain.

use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error returned by all throttle operations.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
    retry_after: Option<Duration>,
}

impl Error {
    /// A helper to create a new [ErrorKind::Validation] error.
    ///
    /// The message should name the offending field and the violated
    /// constraint.
    pub fn validation<T: Into<BoxError>>(source: T) -> Self {
        Error {
            kind: ErrorKind::Validation,
            source: Some(source.into()),
            retry_after: None,
        }
    }

    /// A helper to create a new [ErrorKind::CircuitOpen] error.
    ///
    /// # Parameters
    /// * `retry_after` - how long until the breaker may admit a probe. Zero
    ///   when the breaker is half-open but all probe slots are taken.
    pub fn circuit_open(retry_after: Duration) -> Self {
        Error {
            kind: ErrorKind::CircuitOpen,
            source: None,
            retry_after: Some(retry_after),
        }
    }

    /// A helper to create a new [ErrorKind::ThrottleClosed] error.
    pub fn throttle_closed() -> Self {
        Error {
            kind: ErrorKind::ThrottleClosed,
            source: None,
            retry_after: None,
        }
    }

    /// Wraps an application error so it can flow through the throttle.
    ///
    /// The throttle never consumes such errors: they are counted (subject to
    /// the configured failure classifier) and re-propagated. Use
    /// [as_inner][Error::as_inner] to recover the original error.
    pub fn operation<T: Into<BoxError>>(source: T) -> Self {
        Error {
            kind: ErrorKind::Operation,
            source: Some(source.into()),
            retry_after: None,
        }
    }

    /// Returns the [ErrorKind] associated with this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// For [ErrorKind::CircuitOpen] errors, how long until the breaker may
    /// admit another call.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_throttle_closed(&self) -> bool {
        self.kind == ErrorKind::ThrottleClosed
    }

    /// Recurses through the source error chain and returns a reference to the
    /// inner value if it is of type `T`, or `None` if no such inner value is
    /// found.
    pub fn as_inner<T: std::error::Error + Send + Sync + 'static>(&self) -> Option<&T> {
        let mut error = self.source.as_deref()? as &(dyn std::error::Error);
        loop {
            match error.downcast_ref::<T>() {
                Some(e) => return Some(e),
                None => error = error.source()?,
            }
        }
    }

    pub(crate) fn with_source<T: Into<BoxError>>(mut self, source: T) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.source, self.retry_after) {
            (Some(source), _) => write!(f, "{}: {}", self.kind, source),
            (None, Some(retry_after)) => {
                write!(f, "{}, retry after {:?}", self.kind, retry_after)
            }
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// The type of error held by an [Error] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration violated one of its constraints.
    Validation,
    /// The admission was refused because the circuit breaker is open.
    CircuitOpen,
    /// The admission was refused because the throttle was closed.
    ThrottleClosed,
    /// An application error observed while running an operation.
    Operation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "invalid throttle configuration"),
            ErrorKind::CircuitOpen => write!(f, "the circuit breaker is open"),
            ErrorKind::ThrottleClosed => write!(f, "the throttle is closed"),
            ErrorKind::Operation => write!(f, "the operation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_matches_kind() {
        use std::error::Error as E;
        let error = Error::validation("source".to_string());
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.is_validation(), "{error:?}");
        assert!(error.source().is_some(), "missing source for {error:?}");

        let error = Error::circuit_open(Duration::from_secs(10));
        assert_eq!(error.kind(), ErrorKind::CircuitOpen);
        assert!(error.is_circuit_open(), "{error:?}");
        assert_eq!(error.retry_after(), Some(Duration::from_secs(10)));

        let error = Error::throttle_closed();
        assert_eq!(error.kind(), ErrorKind::ThrottleClosed);
        assert!(error.is_throttle_closed(), "{error:?}");
        assert!(error.source().is_none(), "{error:?}");

        let error = Error::operation("source".to_string());
        assert_eq!(error.kind(), ErrorKind::Operation);
        assert!(error.source().is_some(), "missing source for {error:?}");
    }

    #[test_case(Error::validation("v"); "validation")]
    #[test_case(Error::circuit_open(Duration::ZERO); "circuit open")]
    #[test_case(Error::throttle_closed(); "throttle closed")]
    #[test_case(Error::operation("op"); "operation")]
    fn error_display_includes_kind(error: Error) {
        let kind_msg = format!("{}", error.kind());
        let msg = format!("{error}");
        assert!(msg.contains(&kind_msg), "missing kind message in {msg:?}");
    }

    #[test]
    fn as_inner_traverses_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        let error = Error::operation(inner);
        let got = error.as_inner::<std::io::Error>();
        assert!(
            matches!(got, Some(e) if e.kind() == std::io::ErrorKind::TimedOut),
            "{error:?}"
        );
        assert!(error.as_inner::<std::fmt::Error>().is_none());

        let error = Error::throttle_closed();
        assert!(error.as_inner::<std::io::Error>().is_none());
    }

    #[test]
    fn circuit_open_with_source_keeps_retry_after() {
        let cause = Error::operation("probe failed");
        let error = Error::circuit_open(Duration::from_secs(20)).with_source(cause);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(20)));
        assert!(error.as_inner::<Error>().is_some(), "{error:?}");
    }
}
