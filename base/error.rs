// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Structured errors: a status-code taxonomy plus message and cause chain.
//!
//! The codes follow the general-purpose gRPC status classification; see
//! <https://grpc.github.io/grpc/core/md_doc_statuscodes.html> for meanings.

use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Cancelled => "Cancelled",
            Unknown => "Unknown",
            InvalidArgument => "Invalid argument",
            DeadlineExceeded => "Deadline exceeded",
            NotFound => "Not found",
            AlreadyExists => "Already exists",
            PermissionDenied => "Permission denied",
            Unauthenticated => "Unauthenticated",
            ResourceExhausted => "Resource exhausted",
            FailedPrecondition => "Failed precondition",
            Aborted => "Aborted",
            OutOfRange => "Out of range",
            Unimplemented => "Unimplemented",
            Internal => "Internal",
            Unavailable => "Unavailable",
            DataLoss => "Data loss",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An error with a [`ErrorKind`], an optional message, and an optional cause.
///
/// Boxed so that `Result<T, Error>` stays a single pointer wide on the `Ok`
/// path.
pub struct Error(Box<Inner>);

impl Error {
    pub fn new(kind: ErrorKind, msg: Option<String>) -> Self {
        Error(Box::new(Inner {
            kind,
            msg,
            source: None,
        }))
    }

    /// Wraps another error, keeping it as the cause.
    pub fn wrap<E: Into<Box<dyn std::error::Error + Send + Sync>>>(kind: ErrorKind, e: E) -> Self {
        Error(Box::new(Inner {
            kind,
            msg: None,
            source: Some(e.into()),
        }))
    }

    pub fn with_source<E: Into<Box<dyn std::error::Error + Send + Sync>>>(mut self, e: E) -> Self {
        self.0.source = Some(e.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` impl which includes the full cause chain.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0.msg.as_deref(), self.0.source.as_deref()) {
            (Some(m), _) => write!(f, "{}: {}", self.0.kind, m),
            (None, Some(s)) => write!(f, "{}: {}", self.0.kind, s),
            (None, None) => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // When there's a msg, the source hasn't been folded into Display yet.
        match self.0.msg {
            Some(_) => self
                .0
                .source
                .as_deref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            None => self
                .0
                .source
                .as_deref()
                .and_then(std::error::Error::source),
        }
    }
}

/// `Display` impl for an [`Error`] and all its causes.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur = std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(f, "\ncaused by: {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from an `ErrorKind` and optional `msg(...)` /
/// `source(...)` clauses, e.g. `err!(NotFound, msg("no camera {name}"))`.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)))
    };
    ($kind:ident, msg($($msg:tt)*), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)))
            .with_source($src)
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::wrap($crate::ErrorKind::$kind, $src)
    };
}

/// `return Err(err!(...))`. A bare format string maps to `Unknown`.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($rest:tt)+) => {
        return Err($crate::err!($kind, $($rest)+))
    };
    ($kind:ident) => {
        return Err($crate::err!($kind))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::Error::new(
            $crate::ErrorKind::Unknown,
            Some(format!($fmt $(, $arg)*)),
        ))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_io() -> Result<(), Error> {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        Err(err!(NotFound, msg("missing spool file"), source(e)))
    }

    #[test]
    fn display_includes_kind_and_msg() {
        let e = fail_io().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found: missing spool file");
        let chain = e.chain().to_string();
        assert!(chain.contains("caused by: gone"), "{chain}");
    }

    #[test]
    fn bail_forms() {
        fn f() -> Result<(), Error> {
            bail!(InvalidArgument, msg("bad key {}", "ip"));
        }
        fn g() -> Result<(), Error> {
            bail!("plain {}", 42);
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::InvalidArgument);
        let e = g().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Unknown);
        assert_eq!(e.msg(), Some("plain 42"));
    }

    #[test]
    fn io_conversion_maps_kind() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }
}
