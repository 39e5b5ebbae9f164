use thiserror::Error;

/// The seven error categories from the project error taxonomy.
///
/// Every public `Project`/`QualRouter` operation that can fail returns one
/// of these; `error_code` gives the stable integer used by callers that
/// only want a numeric status (API misuse never has side effects).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MsxError {
    #[error("input error in [{section}] at line {line}: {message}")]
    Input {
        section: &'static str,
        line: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("API misuse: {0}")]
    ApiMisuse(String),

    /// Numeric failures are non-fatal by design: the caller records
    /// this via `Project::warn`, finishes the step with a zeroed result,
    /// and keeps going. The variant exists so call sites that *do* need to
    /// fail hard (e.g. a test asserting a specific failure) can still
    /// construct and match on it.
    #[error("numeric error in {expression_kind} for {object}: {message}")]
    Numeric {
        object: String,
        expression_kind: &'static str,
        message: String,
    },
}

impl MsxError {
    pub fn error_code(&self) -> i32 {
        match self {
            MsxError::Input { .. } => 1,
            MsxError::Io(_) => 2,
            MsxError::Numeric { .. } => 3,
            MsxError::Resource { .. } => 4,
            MsxError::ApiMisuse(_) => 5,
        }
    }

    pub fn input(section: &'static str, line: usize, message: impl Into<String>) -> Self {
        MsxError::Input {
            section,
            line,
            message: message.into(),
        }
    }

    pub fn numeric(
        object: impl Into<String>,
        expression_kind: &'static str,
        message: impl Into<String>,
    ) -> Self {
        MsxError::Numeric {
            object: object.into(),
            expression_kind,
            message: message.into(),
        }
    }
}

/// A recorded numeric warning: the first occurrence is recorded, and
/// subsequent occurrences in the same step are suppressed.
#[derive(Debug, Clone, PartialEq)]
pub struct MathWarning {
    pub object: String,
    pub expression_kind: &'static str,
    pub message: String,
}

pub type MsxResult<T> = Result<T, MsxError>;
