use crate::core::TaskValue;
use crate::core::context::Context;
use crate::core::flow::FlowBuilder;
use async_trait::async_trait;
use std::sync::Arc;

/// A task step written as an `async fn` body.
///
/// The future is spawned on the ambient tokio runtime and completes the
/// step through the normal protocol (`ctx.next(...)` and friends) when it
/// is ready. Flows containing async tasks must therefore be invoked from
/// within a tokio runtime.
#[async_trait]
pub trait AsyncTask: Send + Sync + 'static {
    async fn run(&self, ctx: Context, args: Vec<TaskValue>);
}

impl FlowBuilder {
    /// Appends an [`AsyncTask`] step.
    pub fn async_task<T: AsyncTask>(self, task: T) -> Self {
        let task = Arc::new(task);
        self.task(move |ctx: Context, args: Vec<TaskValue>| {
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                task.run(ctx, args).await;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::Flow;
    use serde_json::json;

    struct DelayedDouble {
        delay_ms: u64,
    }

    #[async_trait]
    impl AsyncTask for DelayedDouble {
        async fn run(&self, ctx: Context, args: Vec<TaskValue>) {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
            let doubled = args[0].as_i64().unwrap_or(0) * 2;
            ctx.next(vec![json!(doubled)]);
        }
    }

    #[tokio::test]
    async fn test_async_task_completes_its_step() {
        let flow = Flow::builder()
            .async_task(DelayedDouble { delay_ms: 1 })
            .task(|ctx: Context, args| ctx.next(args))
            .build();

        let outcome = flow.call(vec![json!(21)]).await.expect("not stalled");
        assert_eq!(outcome.args, vec![json!(42)]);
    }

    #[tokio::test]
    async fn test_async_tasks_chain_in_order() {
        let flow = Flow::builder()
            .async_task(DelayedDouble { delay_ms: 5 })
            .async_task(DelayedDouble { delay_ms: 1 })
            .build();

        let outcome = flow.call(vec![json!(3)]).await.expect("not stalled");
        assert_eq!(outcome.args, vec![json!(12)]);
    }
}
