use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// An externally supplied async callable taking no arguments, such as
/// `process_notifications()` or the body of a periodic job.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug)]
pub enum TaskFailure {
    Failed(anyhow::Error),
    Panicked,
}

/// Runs `fut` to completion, turning both an error result and a panic into
/// a [`TaskFailure`] instead of unwinding into the caller.
pub async fn guarded<F>(fut: F) -> Result<(), TaskFailure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskFailure::Failed(e)),
        Err(_) => Err(TaskFailure::Panicked),
    }
}
