// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

// Error type and kind taxonomy shared across the workspace.

use std::fmt::{self, Write};

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// a general-purpose classification that covers everything this codebase
/// needs to distinguish on: whether an error is retryable, whether it's the
/// caller's fault, whether it's fatal.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
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
    /// True for kinds where retrying the same operation later might succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::DeadlineExceeded
                | ErrorKind::ResourceExhausted
                | ErrorKind::Aborted
                | ErrorKind::Unavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

/// The workspace's common error type: a kind plus a message and optional
/// source chain.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Renders the kind, message and full cause chain on one line, suitable
    /// for a `%` tracing field.
    pub fn chain(&self) -> String {
        let mut out = String::new();
        write!(&mut out, "{self}").unwrap();
        let mut cause = self.source.as_deref().and_then(std::error::Error::source);
        while let Some(c) = cause {
            write!(&mut out, ": {c}").unwrap();
            cause = c.source();
        }
        out
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(m), Some(s)) => write!(f, "{}: {m}: {s}", self.kind),
            (Some(m), None) => write!(f, "{}: {m}", self.kind),
            (None, Some(s)) => write!(f, "{}: {s}", self.kind),
            (None, None) => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

/// Extension methods for annotating foreign errors with a kind.
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_source(e))
    }
}

/// Builds an [`Error`] with the given kind.
///
/// ```ignore
/// err!(NotFound, msg("no such stream {}", name));
/// err!(Internal, msg("couldn't open {}", path.display()), source(e));
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($arg)+))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($src)
    };
    ($kind:ident, msg($($arg:tt)+), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($arg)+))
            .with_source($src)
    };
}

/// Like [`err!`], but returns immediately.
#[macro_export]
macro_rules! bail {
    ($($t:tt)+) => {
        return Err($crate::err!($($t)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_msg_and_source() {
        let src = std::io::Error::new(std::io::ErrorKind::Other, "disk offline");
        let e = err!(Unavailable, msg("writing {}", "seg0001.mp4"), source(src));
        assert_eq!(
            e.to_string(),
            "Unavailable: writing seg0001.mp4: disk offline"
        );
        assert_eq!(e.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn bail_macro_returns_early() {
        fn inner() -> Result<(), Error> {
            bail!(InvalidArgument, msg("bad stream name: {}", "a/b"));
        }
        let e = inner().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Unavailable.retryable());
        assert!(!ErrorKind::InvalidArgument.retryable());
    }
}
