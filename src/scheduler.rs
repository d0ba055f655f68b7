use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Serial background executor for cache maintenance.
///
/// The engine submits two kinds of work here: journal rebuilds and size trims. Tasks re-enter the
/// engine through its public maintenance entry points, acquire the engine monitor, do their work,
/// and release it. Implementations must run tasks one at a time, in submission order; the engine
/// coalesces redundant submissions itself.
///
/// Tests substitute a deterministic implementation that queues tasks and runs them only when
/// explicitly stepped.
pub trait Scheduler: Send + Sync + 'static {
    /// Submits a task for background execution.
    fn schedule(&self, task: BoxFuture<'static, ()>);
}

/// A [`Scheduler`] that drains tasks serially on a spawned Tokio task.
///
/// Must be created from within a Tokio runtime. Dropping the scheduler (and every clone of it)
/// stops the drain task after any queued work completes.
#[derive(Clone)]
pub struct TokioScheduler {
    tasks: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (tasks, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
        });

        Self { tasks }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        // Failure here means the drain task is gone, which only happens at runtime shutdown;
        // maintenance is best-effort at that point.
        let _ = self.tasks.send(task);
    }
}
