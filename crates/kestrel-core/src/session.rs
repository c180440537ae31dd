use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::AppError;

/// Type-erased handle to the automation resource backing one run
/// (a browser tab, an HTTP client, ...).
///
/// Routines recover the concrete type with [`Session::downcast_ref`].
#[derive(Clone)]
pub struct Session {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl Session {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
        }
    }

    /// A session that carries no resource.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Source of scoped automation resources for runs.
///
/// The executor acquires one session before invoking a routine and hands
/// the same session back to [`SessionProvider::release`] on every exit path.
pub trait SessionProvider: Send + Sync + Clone + 'static {
    fn acquire(
        &self,
        scraper_name: &str,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Session, AppError>> + Send;

    fn release(&self, session: Session) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op provider for routines that manage their own resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSessionProvider;

impl SessionProvider for NullSessionProvider {
    async fn acquire(&self, _scraper_name: &str, _run_id: Uuid) -> Result<Session, AppError> {
        Ok(Session::empty())
    }

    async fn release(&self, _session: Session) -> Result<(), AppError> {
        Ok(())
    }
}
