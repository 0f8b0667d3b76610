use crate::error::ErrorCode;

/// A settled result: either a value or a provider-tagged error.
///
/// `Maybe` is the non-throwing error channel used by promises, futures and
/// continuation callbacks. Exactly one of the two variants is ever live.
/// `Maybe<()>` is the value-less form used where only success or failure is
/// interesting.
#[derive(Debug, Clone)]
pub enum Maybe<T> {
    Value(T),
    Error(ErrorCode),
}

impl<T> Maybe<T> {
    pub fn is_value(&self) -> bool {
        matches!(self, Maybe::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Maybe::Error(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Maybe::Value(value) => Some(value),
            Maybe::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorCode> {
        match self {
            Maybe::Value(_) => None,
            Maybe::Error(error) => Some(error),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Maybe::Value(value) => Some(value),
            Maybe::Error(_) => None,
        }
    }

    pub fn into_error(self) -> Option<ErrorCode> {
        match self {
            Maybe::Value(_) => None,
            Maybe::Error(error) => Some(error),
        }
    }

    /// Unwraps the value. Accessing the value of a failed result is a
    /// programmer error and panics.
    #[track_caller]
    pub fn unwrap_value(self) -> T {
        match self {
            Maybe::Value(value) => value,
            Maybe::Error(error) => panic!("called unwrap_value on a failed result: {error}"),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Maybe<U> {
        match self {
            Maybe::Value(value) => Maybe::Value(f(value)),
            Maybe::Error(error) => Maybe::Error(error),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Maybe<U>) -> Maybe<U> {
        match self {
            Maybe::Value(value) => f(value),
            Maybe::Error(error) => Maybe::Error(error),
        }
    }

    pub fn into_result(self) -> Result<T, ErrorCode> {
        match self {
            Maybe::Value(value) => Ok(value),
            Maybe::Error(error) => Err(error),
        }
    }
}

impl Maybe<()> {
    /// The value-less success result.
    pub fn ok() -> Self {
        Maybe::Value(())
    }
}

impl<T> From<Result<T, ErrorCode>> for Maybe<T> {
    fn from(result: Result<T, ErrorCode>) -> Self {
        match result {
            Ok(value) => Maybe::Value(value),
            Err(error) => Maybe::Error(error),
        }
    }
}

impl<T> From<ErrorCode> for Maybe<T> {
    fn from(error: ErrorCode) -> Self {
        Maybe::Error(error)
    }
}
