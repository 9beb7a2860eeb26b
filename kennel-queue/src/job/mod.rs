//! Handler trait and the registry that routes jobs to handlers by name.

pub mod registry;

pub use registry::JobRegistry;

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::{Job, JobError};

/// Executes jobs of one or more names.
///
/// Return [`JobError::Retryable`] to retry with backoff and
/// [`JobError::Permanent`] to dead-letter right away. Handlers must tolerate
/// running more than once for the same job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Handler built from an async closure over the whole job
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (self.f)(job.clone()).await
    }
}

/// Handler that decodes the payload into `P` before calling the closure.
///
/// A payload that does not decode is a permanent failure.
pub struct TypedHandlerFn<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

/// Wrap an async closure taking a decoded payload as a [`JobHandler`]
pub fn typed_handler_fn<P, F, Fut>(f: F) -> TypedHandlerFn<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    TypedHandlerFn {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> JobHandler for TypedHandlerFn<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: P = serde_json::from_value(job.payload.clone()).map_err(|e| {
            JobError::permanent(format!("payload for `{}` does not decode: {e}", job.name))
        })?;
        (self.f)(payload).await
    }
}
