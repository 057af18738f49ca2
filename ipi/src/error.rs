//! Error types and result definitions for engine operations.
//!
//! [`IpiError`] carries a classification, a static description, optional dynamic detail, the
//! originating error and the call site where it was raised. Several errors can be aggregated into
//! one, which is used when more than one background worker fails during shutdown.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use ipi_config::load::LoadConfigError;
use ipi_config::shared::ValidationError;

use crate::fetch::FetchError;
use crate::native::NativeError;
use crate::watcher::WatchError;

/// Result type for engine operations.
pub type IpiResult<T> = Result<T, IpiError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
#[derive(Debug, Clone)]
pub struct IpiError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<IpiError>,
        location: &'static Location<'static>,
    },
}

/// Classification of engine errors.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration
    ConfigError,
    ValidationError,
    DataFileMissing,

    // Native layer
    NativeInitFailed,
    NativeReloadFailed,
    QueryFailed,

    // Updates
    FetchFailed,
    FetchTimedOut,
    WatcherFailed,
    TempCopyFailed,

    // Lifecycle
    EngineStopped,
    PoolClosed,
    InvalidState,
    WorkerPanic,
    ReloadPanic,
    UpdaterPanic,

    IoError,
    Unknown,

    // Raised by fail points in tests.
    #[cfg(feature = "failpoints")]
    FailpointInjected,
}

impl IpiError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    /// Returns the dynamic detail, or the first detail found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        IpiError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        IpiError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for IpiError {
    fn eq(&self, other: &IpiError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for IpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, body: &str) -> fmt::Result {
    if body.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for IpiError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for IpiError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> IpiError {
        IpiError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for IpiError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> IpiError {
        IpiError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for IpiError
where
    E: Into<IpiError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> IpiError {
        let location = Location::caller();
        let mut errors: Vec<IpiError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        IpiError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for IpiError {
    #[track_caller]
    fn from(err: std::io::Error) -> IpiError {
        IpiError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<ValidationError> for IpiError {
    #[track_caller]
    fn from(err: ValidationError) -> IpiError {
        let kind = match err {
            ValidationError::DataFileNotFound(_) => ErrorKind::DataFileMissing,
            _ => ErrorKind::ValidationError,
        };
        IpiError::from_source(kind, "Invalid engine configuration", err)
    }
}

impl From<LoadConfigError> for IpiError {
    #[track_caller]
    fn from(err: LoadConfigError) -> IpiError {
        IpiError::from_source(ErrorKind::ConfigError, "Failed to load configuration", err)
    }
}

impl From<NativeError> for IpiError {
    #[track_caller]
    fn from(err: NativeError) -> IpiError {
        let (kind, description) = match err {
            NativeError::Init { .. } => (ErrorKind::NativeInitFailed, "Failed to load data file"),
            NativeError::Reload { .. } => {
                (ErrorKind::NativeReloadFailed, "Failed to reload data file")
            }
            NativeError::Query { .. } => (ErrorKind::QueryFailed, "Lookup failed"),
            NativeError::Released => (ErrorKind::InvalidState, "Resource already released"),
        };
        IpiError::from_source(kind, description, err)
    }
}

impl From<FetchError> for IpiError {
    #[track_caller]
    fn from(err: FetchError) -> IpiError {
        let kind = match err {
            FetchError::Timeout(_) => ErrorKind::FetchTimedOut,
            _ => ErrorKind::FetchFailed,
        };
        IpiError::from_source(kind, "Failed to fetch data file", err)
    }
}

impl From<WatchError> for IpiError {
    #[track_caller]
    fn from(err: WatchError) -> IpiError {
        IpiError::from_source(ErrorKind::WatcherFailed, "File watcher failed", err)
    }
}

impl From<tokio::task::JoinError> for IpiError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> IpiError {
        let description = if err.is_panic() {
            "Background task panicked"
        } else {
            "Background task was cancelled"
        };
        IpiError::from_source(ErrorKind::WorkerPanic, description, err)
    }
}
