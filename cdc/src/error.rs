//! Error types and result definitions for the CDC engine.
//!
//! A [`CdcError`] is either one classified failure or an aggregate of several, which is how a
//! failed drain reports both the original failure and the failure of the final checkpoint.
//! Every error remembers the callsite that created it.
//!
//! Fatal errors leaving the flow controller are stamped with the last confirmed position via
//! [`CdcError::with_last_confirmed`], the position a later run resumes from.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use cdc_postgres::replication::slots::SlotNameError;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::PgLsn;

/// Result type of the CDC engine.
pub type CdcResult<T> = Result<T, CdcError>;

/// Main error type of the CDC engine.
#[derive(Debug, Clone)]
pub struct CdcError {
    cause: Cause,
    last_confirmed: Option<PgLsn>,
    location: &'static Location<'static>,
}

#[derive(Debug, Clone)]
enum Cause {
    Failure(Box<Failure>),
    Aggregate(Vec<CdcError>),
}

#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    backtrace: Arc<Backtrace>,
}

/// Classification of a failure, used to decide between retrying and stopping.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Talking to the source server.
    SourceConnectionFailed,
    SourceDatabaseShutdown,
    SourceDatabaseInRecovery,
    SourceOperationCanceled,
    SourceIoError,
    SourceQueryFailed,
    SourceError,
    AuthenticationError,
    PermissionDenied,
    EncryptionError,

    // Replication slot and positions.
    SlotBusy,
    SlotIncompatible,
    SlotNotFound,
    SlotAlreadyExists,
    SlotNotCreated,
    PositionUnavailable,
    InvalidAcknowledgement,
    ResyncRequired,

    // Payloads and values.
    MalformedPayload,
    ConversionError,
    InvalidData,
    DeserializationError,

    // Collaborators.
    DestinationIoError,
    StateStoreIoError,
    IoError,

    // Setup.
    ConfigError,
    ValidationError,

    // Pipeline lifecycle.
    InvalidState,
    ReconnectionExhausted,
    PipelineCancelled,
    PipelinePanic,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` if a failure of this kind may go away by reopening the replication
    /// session after a backoff.
    pub fn is_connection_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::SourceDatabaseShutdown
                | ErrorKind::SourceDatabaseInRecovery
                | ErrorKind::SourceOperationCanceled
                | ErrorKind::SourceIoError
        )
    }
}

impl CdcError {
    #[track_caller]
    fn failure(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CdcError {
            cause: Cause::Failure(Box::new(Failure {
                kind,
                description,
                detail,
                source,
                backtrace: Arc::new(Backtrace::capture()),
            })),
            last_confirmed: None,
            location: Location::caller(),
        }
    }

    /// Kind of the failure, the first one for an aggregate.
    ///
    /// An empty aggregate is [`ErrorKind::Unknown`].
    pub fn kind(&self) -> ErrorKind {
        match &self.cause {
            Cause::Failure(failure) => failure.kind,
            Cause::Aggregate(errors) => errors
                .first()
                .map_or(ErrorKind::Unknown, CdcError::kind),
        }
    }

    /// Kinds of all failures, in aggregation order.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.cause {
            Cause::Failure(failure) => vec![failure.kind],
            Cause::Aggregate(errors) => errors.iter().flat_map(CdcError::kinds).collect(),
        }
    }

    /// Dynamic detail of the failure, the first available one for an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match &self.cause {
            Cause::Failure(failure) => failure.detail.as_deref(),
            Cause::Aggregate(errors) => errors.iter().find_map(CdcError::detail),
        }
    }

    /// Last confirmed position recorded when this error became fatal.
    pub fn last_confirmed(&self) -> Option<PgLsn> {
        self.last_confirmed
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match &self.cause {
            Cause::Failure(failure) => Some(failure.backtrace.as_ref()),
            Cause::Aggregate(_) => None,
        }
    }

    /// Callsite that created this error.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Attaches the error that caused this one. Aggregates are left unchanged.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let Cause::Failure(failure) = &mut self.cause {
            failure.source = Some(Arc::new(source));
        }

        self
    }

    /// Records the last confirmed position at the moment this error became fatal.
    pub fn with_last_confirmed(mut self, position: PgLsn) -> Self {
        self.last_confirmed = Some(position);
        self
    }
}

/// Errors compare by kind only, aggregates element-wise.
impl PartialEq for CdcError {
    fn eq(&self, other: &CdcError) -> bool {
        match (&self.cause, &other.cause) {
            (Cause::Failure(a), Cause::Failure(b)) => a.kind == b.kind,
            (Cause::Aggregate(a), Cause::Aggregate(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.location;
        let at = format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );

        match &self.cause {
            Cause::Failure(failure) => {
                write!(f, "[{:?}] {} @ {at}", failure.kind, failure.description)?;
                if let Some(detail) = &failure.detail {
                    write_indented(f, "Detail:", detail)?;
                }
                if let Some(position) = self.last_confirmed {
                    write!(f, "\n  Last confirmed position: {position}")?;
                }

                let backtrace = failure.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }
            }
            Cause::Aggregate(errors) => {
                write!(f, "[Many] {} errors @ {at}", errors.len())?;
                if let Some(position) = self.last_confirmed {
                    write!(f, "\n  Last confirmed position: {position}")?;
                }

                for (number, error) in errors.iter().enumerate().map(|(i, e)| (i + 1, e)) {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {number}. {}", lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, text: &str) -> fmt::Result {
    write!(f, "\n  {title}")?;
    if text.trim().is_empty() {
        return write!(f, " <empty>");
    }

    for line in text.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

impl error::Error for CdcError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.cause {
            Cause::Failure(failure) => failure
                .source
                .as_deref()
                .map(|source| source as &(dyn error::Error + 'static)),
            Cause::Aggregate(errors) => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CdcError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> CdcError {
        CdcError::failure(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for CdcError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> CdcError {
        CdcError::failure(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates several errors. A single error is returned as is.
///
/// The aggregate keeps the first last confirmed position found among its errors.
impl<E> From<Vec<E>> for CdcError
where
    E: Into<CdcError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> CdcError {
        let location = Location::caller();
        let mut errors: Vec<CdcError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        CdcError {
            last_confirmed: errors.iter().find_map(CdcError::last_confirmed),
            cause: Cause::Aggregate(errors),
            location,
        }
    }
}

/// Wraps `err` as source, with its message as detail.
#[track_caller]
fn caused_by<E>(kind: ErrorKind, description: &'static str, err: E) -> CdcError
where
    E: error::Error + Send + Sync + 'static,
{
    CdcError::failure(
        kind,
        Cow::Borrowed(description),
        Some(Cow::Owned(err.to_string())),
        Some(Arc::new(err)),
    )
}

impl From<std::io::Error> for CdcError {
    #[track_caller]
    fn from(err: std::io::Error) -> CdcError {
        caused_by(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for CdcError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CdcError {
        match err.is_io() {
            true => caused_by(ErrorKind::IoError, "Reading JSON failed", err),
            false => caused_by(ErrorKind::DeserializationError, "Invalid JSON", err),
        }
    }
}

impl From<std::str::Utf8Error> for CdcError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> CdcError {
        caused_by(ErrorKind::ConversionError, "Text is not valid UTF-8", err)
    }
}

impl From<std::num::ParseIntError> for CdcError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> CdcError {
        caused_by(ErrorKind::ConversionError, "Invalid integer", err)
    }
}

impl From<std::num::ParseFloatError> for CdcError {
    #[track_caller]
    fn from(err: std::num::ParseFloatError) -> CdcError {
        caused_by(ErrorKind::ConversionError, "Invalid floating point number", err)
    }
}

impl From<chrono::ParseError> for CdcError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> CdcError {
        caused_by(ErrorKind::ConversionError, "Invalid date or time", err)
    }
}

impl From<rustls::Error> for CdcError {
    #[track_caller]
    fn from(err: rustls::Error) -> CdcError {
        caused_by(ErrorKind::EncryptionError, "TLS setup failed", err)
    }
}

impl From<rustls::pki_types::pem::Error> for CdcError {
    #[track_caller]
    fn from(err: rustls::pki_types::pem::Error) -> CdcError {
        caused_by(ErrorKind::ConfigError, "Trusted root certificates are not valid PEM", err)
    }
}

impl From<SlotNameError> for CdcError {
    #[track_caller]
    fn from(err: SlotNameError) -> CdcError {
        caused_by(ErrorKind::ValidationError, "Invalid replication slot name", err)
    }
}

/// Classifies a Postgres error by its SQLSTATE.
///
/// Errors without SQLSTATE come from the connection itself and are retried as
/// [`ErrorKind::SourceConnectionFailed`].
impl From<tokio_postgres::Error> for CdcError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> CdcError {
        let Some(code) = err.code() else {
            return caused_by(
                ErrorKind::SourceConnectionFailed,
                "Connection to the source lost",
                err,
            );
        };

        let (kind, description) = classify_sqlstate(code);
        caused_by(kind, description, err)
    }
}

fn classify_sqlstate(code: &SqlState) -> (ErrorKind, &'static str) {
    // Class 08 and the connection limit.
    if code.code().starts_with("08")
        || *code == SqlState::TOO_MANY_CONNECTIONS
        || *code == SqlState::IDLE_SESSION_TIMEOUT
    {
        return (ErrorKind::SourceConnectionFailed, "Connection to the source failed");
    }

    match *code {
        SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => {
            (ErrorKind::AuthenticationError, "Authentication rejected")
        }
        SqlState::INSUFFICIENT_PRIVILEGE => {
            (ErrorKind::PermissionDenied, "Missing replication privilege")
        }
        SqlState::OBJECT_IN_USE => (ErrorKind::SlotBusy, "Replication slot is active"),
        SqlState::UNDEFINED_OBJECT => (ErrorKind::SlotNotFound, "Replication slot not found"),
        SqlState::DUPLICATE_OBJECT => {
            (ErrorKind::SlotAlreadyExists, "Replication slot already exists")
        }
        SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE => {
            (ErrorKind::InvalidState, "Source not ready for logical decoding")
        }
        SqlState::FEATURE_NOT_SUPPORTED | SqlState::UNDEFINED_FILE => {
            (ErrorKind::SlotIncompatible, "Output plugin not available")
        }
        SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => {
            (ErrorKind::SourceDatabaseShutdown, "Source is shutting down")
        }
        SqlState::CANNOT_CONNECT_NOW => {
            (ErrorKind::SourceDatabaseInRecovery, "Source is starting up or in recovery")
        }
        SqlState::QUERY_CANCELED | SqlState::OPERATOR_INTERVENTION => {
            (ErrorKind::SourceOperationCanceled, "Operation canceled by the source")
        }
        SqlState::IO_ERROR | SqlState::DISK_FULL => {
            (ErrorKind::SourceIoError, "Source I/O failure")
        }
        SqlState::SYNTAX_ERROR | SqlState::UNDEFINED_TABLE => {
            (ErrorKind::SourceQueryFailed, "Replication command rejected")
        }
        _ => (ErrorKind::SourceError, "Source error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, cdc_error};

    #[test]
    fn detail_and_kind_are_exposed() {
        let err = cdc_error!(
            ErrorKind::MalformedPayload,
            "Payload is not valid JSON",
            "expected value at line 1"
        );

        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
        assert_eq!(err.detail(), Some("expected value at line 1"));
        assert_eq!(err.last_confirmed(), None);
        assert!(err.location().file().ends_with("error.rs"));
    }

    #[test]
    fn display_shows_the_resume_position() {
        let err = CdcError::from((ErrorKind::ReconnectionExhausted, "gave up"))
            .with_last_confirmed(PgLsn::from(0x16B3748));

        assert_eq!(err.last_confirmed(), Some(PgLsn::from(0x16B3748)));
        assert!(err.to_string().contains("Last confirmed position: 0/16B3748"));
    }

    #[test]
    fn single_error_is_not_aggregated() {
        let err: CdcError = vec![
            CdcError::from((ErrorKind::SlotBusy, "busy")).with_last_confirmed(PgLsn::from(7)),
        ]
        .into();

        assert_eq!(err.kinds(), vec![ErrorKind::SlotBusy]);
        assert_eq!(err.last_confirmed(), Some(PgLsn::from(7)));
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn aggregate_reports_every_failure() {
        let err: CdcError = vec![
            CdcError::from((ErrorKind::MalformedPayload, "bad payload"))
                .with_last_confirmed(PgLsn::from(42)),
            CdcError::from((ErrorKind::StateStoreIoError, "store failed")),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::MalformedPayload, ErrorKind::StateStoreIoError]
        );
        assert_eq!(err.last_confirmed(), Some(PgLsn::from(42)));

        let rendered = err.to_string();
        assert!(rendered.starts_with("[Many] 2 errors"));
        assert!(rendered.contains("1. [MalformedPayload] bad payload"));
        assert!(rendered.contains("2. [StateStoreIoError] store failed"));
    }

    #[test]
    fn transient_source_failures_are_retryable() {
        assert!(ErrorKind::SourceConnectionFailed.is_connection_retryable());
        assert!(ErrorKind::SourceDatabaseShutdown.is_connection_retryable());
        assert!(!ErrorKind::MalformedPayload.is_connection_retryable());
        assert!(!ErrorKind::SlotIncompatible.is_connection_retryable());
        assert!(!ErrorKind::PositionUnavailable.is_connection_retryable());
        assert!(!ErrorKind::SlotBusy.is_connection_retryable());
    }

    #[test]
    fn sqlstates_map_to_slot_kinds() {
        assert_eq!(
            classify_sqlstate(&SqlState::OBJECT_IN_USE).0,
            ErrorKind::SlotBusy
        );
        assert_eq!(
            classify_sqlstate(&SqlState::CONNECTION_FAILURE).0,
            ErrorKind::SourceConnectionFailed
        );
        assert_eq!(
            classify_sqlstate(&SqlState::UNDEFINED_FILE).0,
            ErrorKind::SlotIncompatible
        );
        assert_eq!(
            classify_sqlstate(&SqlState::UNIQUE_VIOLATION).0,
            ErrorKind::SourceError
        );
    }

    #[test]
    fn bail_returns_early() {
        fn fails() -> CdcResult<()> {
            bail!(ErrorKind::InvalidState, "nope");
        }

        assert_eq!(fails().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn equality_ignores_detail() {
        let a = cdc_error!(ErrorKind::SlotBusy, "busy", "pid 1");
        let b = cdc_error!(ErrorKind::SlotBusy, "busy", "pid 2");
        assert_eq!(a, b);
    }
}
