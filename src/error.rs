use crate::SpfDisposition;
use thiserror::Error;

/// Internal error taxonomy for the evaluator.
///
/// Nothing in this crate ever panics or unwinds on malformed input from the
/// network or from a badly configured domain; every variant here is caught
/// at the `Step()` boundary and folded into an `(SpfDisposition, problem)`
/// pair via [`SpfError::disposition`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpfError {
    #[error("invalid token '{0}'")]
    InvalidToken(String),

    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),

    #[error("directive after modifier")]
    DirectiveAfterModifier,

    #[error("expected SPF version 1, got '{0}'")]
    WrongVersion(String),

    #[error("invalid macro string: {0}")]
    InvalidMacro(String),

    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: &'static str },

    #[error("multiple SPF records")]
    MultipleRecords,

    #[error("Number of DNS mechanism exceeded")]
    BudgetExceeded,

    #[error("redirect target has no SPF record")]
    NoRecordForRedirect,

    #[error("unexpected DNS response")]
    UnexpectedResponse,

    #[error("none produced inside include")]
    NoneInsideInclude,

    #[error("{0}")]
    TempError(String),
}

impl SpfError {
    /// Whether this error should be reported as `TempError` rather than
    /// `PermError`.
    pub fn is_temp(&self) -> bool {
        matches!(self, SpfError::TempError(_) | SpfError::UnexpectedResponse)
    }

    /// Every internal error collapses to exactly one of the two terminal
    /// error dispositions.
    pub fn disposition(&self) -> SpfDisposition {
        if self.is_temp() {
            SpfDisposition::TempError
        } else {
            SpfDisposition::PermError
        }
    }
}
