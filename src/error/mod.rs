use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod maybe;
pub use maybe::Maybe;

mod provider;
pub use provider::{
    CanceledError, E_FAIL, ErrorProvider, HResultError, PanicError, cancellation_error_provider,
    hresult_error_provider, panic_error_provider,
};

pub(crate) use provider::DynErrorProvider;

/// A lightweight, ref-counted error value tagged with a provider identity.
///
/// `ErrorCode` is the non-throwing error channel of the crate. It is cheap to
/// clone (a pointer-sized ref-count bump) and carries an opaque payload that
/// can be probed by provider identity with [`ErrorCode::handle_as`].
///
/// Errors track whether anyone inspected them. If the last reference to an
/// error is dropped without [`ErrorCode::handle`] (or a successful
/// `handle_as`) having been called, the provider's unhandled-error hook runs;
/// the default hook reports a fatal diagnostic.
#[derive(Clone)]
pub struct ErrorCode {
    state: Arc<ErrorCodeState>,
}

impl ErrorCode {
    pub(crate) fn from_state(state: Arc<ErrorCodeState>) -> Self {
        Self { state }
    }

    /// True if the error was inspected by someone.
    pub fn is_handled(&self) -> bool {
        self.state.handled.load(Ordering::Acquire)
    }

    /// Marks the error as handled regardless of its provider.
    pub fn handle(&self) {
        self.state.handled.store(true, Ordering::Release);
    }

    /// Probes the error for the given provider identity and, on a match,
    /// marks it handled and returns the typed payload.
    pub fn handle_as<T>(&self, provider: &'static ErrorProvider<T>) -> Option<&T>
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        let info = self.try_as(provider)?;
        self.handle();
        Some(info)
    }

    /// Returns the typed payload if the error was created by the given
    /// provider, without marking the error handled.
    pub fn try_as<T>(&self, provider: &'static ErrorProvider<T>) -> Option<&T>
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        if !self.is_from(provider) {
            return None;
        }
        self.state.payload.downcast_ref::<T>()
    }

    /// True if the error was created by the given provider.
    pub fn is_from<T>(&self, provider: &'static ErrorProvider<T>) -> bool
    where
        T: fmt::Display + Send + Sync + 'static,
    {
        self.state.provider.addr() == DynErrorProvider::addr(provider)
    }

    pub fn provider_name(&self) -> &'static str {
        self.state.provider.name()
    }

    /// True if both codes share the same state instance.
    pub fn same_state(&self, other: &ErrorCode) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.state.provider.render(self.state.payload.as_ref()))
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCode")
            .field("provider", &self.provider_name())
            .field("handled", &self.is_handled())
            .field("message", &self.to_string())
            .finish()
    }
}

/// Ref-counted state shared by all clones of an [`ErrorCode`].
pub(crate) struct ErrorCodeState {
    provider: &'static dyn DynErrorProvider,
    payload: Box<dyn Any + Send + Sync>,
    handled: AtomicBool,
}

impl ErrorCodeState {
    pub(crate) fn new(
        provider: &'static dyn DynErrorProvider,
        payload: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            provider,
            payload,
            handled: AtomicBool::new(false),
        }
    }
}

impl Drop for ErrorCodeState {
    fn drop(&mut self) {
        if !self.handled.load(Ordering::Acquire) {
            self.provider.on_unhandled(self.payload.as_ref());
        }
    }
}
