use crate::core::TaskValue;
use crate::core::context::{AsyncCallback, Context};
use crate::core::error::TaskError;
use crate::core::flow::Flow;

/// The per-item handle given to a [`parallel_each`] worker.
///
/// Each forked item gets its own handle carrying the item's declaration
/// index. A worker must either [`join`](ForkContext::join) exactly once or
/// signal failure with [`end`](ForkContext::end); everything else on the
/// shared invocation (data bag, error slot) is reachable through it too.
pub struct ForkContext {
    ctx: Context,
    index: usize,
    slot: AsyncCallback,
}

impl ForkContext {
    /// The item's position in the original fork declaration.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reports this item's result. Results are assembled by fork index, so
    /// join order never affects the finishing step's result order.
    pub fn join(self, value: TaskValue) {
        self.slot.ok(vec![value]);
    }

    /// Signals a fatal error: the finishing step runs immediately with the
    /// error set, and joins from still-running workers are dropped.
    pub fn end(self, error: TaskError) {
        self.ctx.end(Some(error), Vec::new());
    }

    /// The shared error slot.
    pub fn err(&self) -> Option<TaskError> {
        self.ctx.err()
    }

    /// A snapshot of the shared data bag.
    pub fn data(&self) -> TaskValue {
        self.ctx.data()
    }

    /// Replaces the shared data bag.
    pub fn set_data(&self, value: impl Into<TaskValue>) {
        self.ctx.set_data(value);
    }

    /// Runs `f` with mutable access to the shared data bag.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut TaskValue) -> R) -> R {
        self.ctx.with_data(f)
    }
}

/// Compiles the dynamic fan-out pattern into a three-step [`Flow`]:
///
/// 1. `begin` declares the units of work by calling
///    [`Context::fork`](crate::Context::fork) with the item list;
/// 2. `worker` runs once per item, in declaration order, and eventually
///    joins a result (or fails);
/// 3. `finish` runs once every join has landed (or immediately when a
///    worker signals a fatal error), receiving the error slot and the
///    results ordered by fork index, independent of completion order.
///
/// The returned flow can be called on its own or spliced into another flow
/// as a single step.
pub fn parallel_each<B, W, F>(begin: B, worker: W, finish: F) -> Flow
where
    B: Fn(Context, Vec<TaskValue>) + Send + Sync + 'static,
    W: Fn(ForkContext, TaskValue) + Send + Sync + 'static,
    F: Fn(Context, Option<TaskError>, Vec<TaskValue>) + Send + Sync + 'static,
{
    Flow::builder()
        .named("parallel_each")
        .task(begin)
        .task(move |ctx: Context, items: Vec<TaskValue>| {
            if items.is_empty() {
                ctx.next(Vec::new());
                return;
            }
            // Claim one result slot per item before dispatching, so slot
            // order matches declaration order even if an early worker
            // joins synchronously.
            let slots: Vec<AsyncCallback> = items.iter().map(|_| ctx.async_cb()).collect();
            for ((index, item), slot) in items.into_iter().enumerate().zip(slots) {
                worker(
                    ForkContext {
                        ctx: ctx.clone(),
                        index,
                        slot,
                    },
                    item,
                );
            }
        })
        .task(move |ctx: Context, results: Vec<TaskValue>| {
            let error = ctx.err();
            finish(ctx, error, results);
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_results_follow_fork_order_not_join_order() {
        let each = parallel_each(
            |ctx: Context, _args| ctx.fork(vec![json!("a"), json!("bb")]),
            |fork: ForkContext, item: TaskValue| {
                // The first-declared item sleeps longest, so joins land in
                // the reverse of fork order.
                let len = item.as_str().map(str::len).unwrap_or(0);
                tokio::spawn(async move {
                    let delay = 20u64.saturating_sub(len as u64 * 5);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    fork.join(json!(len));
                });
            },
            |ctx: Context, error, results| {
                assert!(error.is_none());
                ctx.next(results);
            },
        );

        let outcome = each.call(Vec::new()).await.expect("not stalled");
        assert_eq!(outcome.args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_synchronous_joins_keep_declaration_order() {
        let each = parallel_each(
            |ctx: Context, _args| ctx.fork(vec![json!(10), json!(20), json!(30)]),
            |fork: ForkContext, item: TaskValue| {
                let doubled = item.as_i64().unwrap_or(0) * 2;
                fork.join(json!(doubled));
            },
            |ctx: Context, error, results| {
                assert!(error.is_none());
                ctx.next(results);
            },
        );

        let outcome = block_on(each.call(Vec::new())).expect("not stalled");
        assert_eq!(outcome.args, vec![json!(20), json!(40), json!(60)]);
    }

    #[test]
    fn test_worker_indexes_match_declaration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let each = parallel_each(
            |ctx: Context, _args| ctx.fork(vec![json!("x"), json!("y")]),
            move |fork: ForkContext, item: TaskValue| {
                record
                    .lock()
                    .unwrap()
                    .push((fork.index(), item.clone()));
                fork.join(item);
            },
            |ctx: Context, _error, results| ctx.next(results),
        );

        block_on(each.call(Vec::new())).expect("not stalled");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, json!("x")), (1, json!("y"))]
        );
    }

    #[test]
    fn test_worker_failure_reaches_the_finishing_step() {
        let each = parallel_each(
            |ctx: Context, _args| ctx.fork(vec![json!("good"), json!("bad")]),
            |fork: ForkContext, item: TaskValue| {
                if item == json!("bad") {
                    fork.end(TaskError::msg("broken item"));
                } else {
                    fork.join(item);
                }
            },
            |ctx: Context, error, results| {
                assert_eq!(error, Some(TaskError::msg("broken item")));
                assert!(results.is_empty());
                ctx.next(Vec::new());
            },
        );

        let outcome = block_on(each.call(Vec::new())).expect("not stalled");
        assert_eq!(outcome.err, Some(TaskError::msg("broken item")));
    }

    #[test]
    fn test_empty_fork_finishes_with_no_results() {
        let each = parallel_each(
            |ctx: Context, _args| ctx.fork(Vec::new()),
            |_fork: ForkContext, _item: TaskValue| unreachable!("no items to dispatch"),
            |ctx: Context, error, results| {
                assert!(error.is_none());
                assert!(results.is_empty());
                ctx.next(Vec::new());
            },
        );

        block_on(each.call(Vec::new())).expect("not stalled");
    }
}
