use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use http::StatusCode;

use crate::pipeline::{ProgressTask, Stage};
use crate::protocol::HttpError;
use crate::source::HttpDataSource;

/// A pluggable unit of request processing bound to one [`Stage`].
///
/// The engine first asks [`can_handle`](Service::can_handle); a `Some` answer means the service
/// matched and its data is handed to [`execute`](Service::execute). Services run in ascending
/// [`priority`](Service::priority) within their stage.
#[async_trait]
pub trait Service: Send + Sync {
    fn stage(&self) -> Stage;

    /// Lower values run earlier.
    fn priority(&self) -> i32 {
        0
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData>;

    async fn execute(&self, task: &mut ProgressTask, data: ServiceData) -> Result<Outcome, HttpError>;
}

/// Opaque data passed from [`Service::can_handle`] to [`Service::execute`].
#[derive(Default)]
pub struct ServiceData(Option<Box<dyn Any + Send>>);

impl ServiceData {
    /// A match without any data.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast<T: Any>(self) -> Option<T> {
        self.0.and_then(|value| value.downcast::<T>().ok()).map(|value| *value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for ServiceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceData").field(&self.0.as_ref().map(|_| "..")).finish()
    }
}

/// How a service execution ended.
pub enum Outcome {
    Continue,
    /// Stop the current stage and answer with `status`.
    ///
    /// The body, if any, is appended to the document and a task that has not reached
    /// [`Stage::CreateResponse`] yet continues there.
    Abort { status: StatusCode, body: Option<Box<dyn HttpDataSource>> },
}

impl Outcome {
    pub fn abort(status: StatusCode) -> Self {
        Outcome::Abort { status, body: None }
    }

    pub fn abort_with<S: HttpDataSource + 'static>(status: StatusCode, body: S) -> Self {
        Outcome::Abort { status, body: Some(Box::new(body)) }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Outcome::Abort { .. })
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Continue => f.write_str("Continue"),
            Outcome::Abort { status, body } => {
                f.debug_struct("Abort").field("status", status).field("has_body", &body.is_some()).finish()
            }
        }
    }
}
