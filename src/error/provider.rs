use crate::error::{ErrorCode, ErrorCodeState};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A stable error-provider identity plus the typed payload it wraps.
///
/// Every component that produces errors defines one or more providers as
/// `static` items; the address of the static is the provider identity used
/// to probe an [`ErrorCode`] for known error kinds. Providers also own the
/// rendering of their payload and the policy for errors that are dropped
/// without ever being handled.
pub struct ErrorProvider<T> {
    name: &'static str,
    on_unhandled: Option<fn(&T)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ErrorProvider<T>
where
    T: fmt::Display + Send + Sync + 'static,
{
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            on_unhandled: None,
            _marker: PhantomData,
        }
    }

    /// Overrides the unhandled-error hook. The default hook reports the
    /// error as a fatal diagnostic; providers whose errors are routinely
    /// dropped unobserved (e.g. cancellation) install a quiet hook instead.
    pub const fn with_unhandled(mut self, hook: fn(&T)) -> Self {
        self.on_unhandled = Some(hook);
        self
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Wraps a payload into a ref-counted [`ErrorCode`] tagged with this
    /// provider's identity.
    pub fn make_error_code(&'static self, payload: T) -> ErrorCode {
        ErrorCode::from_state(Arc::new(ErrorCodeState::new(self, Box::new(payload))))
    }
}

/// Object-safe view of a provider, stored inside [`ErrorCodeState`].
pub(crate) trait DynErrorProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn render(&self, payload: &(dyn Any + Send + Sync)) -> String;
    fn on_unhandled(&self, payload: &(dyn Any + Send + Sync));
    fn addr(&self) -> usize;
}

impl<T> DynErrorProvider for ErrorProvider<T>
where
    T: fmt::Display + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn render(&self, payload: &(dyn Any + Send + Sync)) -> String {
        match payload.downcast_ref::<T>() {
            Some(payload) => payload.to_string(),
            None => format!("<foreign payload for provider {}>", self.name),
        }
    }

    fn on_unhandled(&self, payload: &(dyn Any + Send + Sync)) {
        if let Some(payload) = payload.downcast_ref::<T>() {
            if let Some(hook) = self.on_unhandled {
                hook(payload);
                return;
            }
            tracing::error!(
                provider = self.name,
                error = %payload,
                "error code dropped without being handled"
            );
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

//=============================================================================
// Built-in providers
//=============================================================================

pub const E_FAIL: u32 = 0x8000_4005;

/// HRESULT-backed error payload. Renders as `"[0x80004005] <message>"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[0x{code:08x}] {message}")]
pub struct HResultError {
    pub code: u32,
    pub message: String,
}

impl HResultError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub fn hresult_error_provider() -> &'static ErrorProvider<HResultError> {
    static PROVIDER: ErrorProvider<HResultError> = ErrorProvider::new("hresult");
    &PROVIDER
}

/// Why an operation was canceled instead of completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CanceledError {
    /// Every producer handle was dropped before the result was set.
    #[error("the promise was abandoned before it was fulfilled")]
    Abandoned,

    /// The scheduler discarded the task before it could run.
    #[error("the task was discarded before it could run")]
    TaskDiscarded,

    #[error("the operation was canceled")]
    Canceled,
}

pub fn cancellation_error_provider() -> &'static ErrorProvider<CanceledError> {
    // Cancellation errors are routinely dropped unobserved; that is not a
    // diagnostic event.
    static PROVIDER: ErrorProvider<CanceledError> =
        ErrorProvider::new("cancellation").with_unhandled(|_| {});
    &PROVIDER
}

/// A callback panic captured by a panic-catching executor.
#[derive(Debug, Clone, thiserror::Error)]
#[error("callback panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self { message }
    }
}

pub fn panic_error_provider() -> &'static ErrorProvider<PanicError> {
    static PROVIDER: ErrorProvider<PanicError> = ErrorProvider::new("panic");
    &PROVIDER
}
