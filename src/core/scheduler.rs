//! The advance loop shared by every flow invocation.
//!
//! One [`Invocation`] exists per call of a compiled flow. The loop pops one
//! step at a time and runs it; a step that neither advances explicitly nor
//! has completion callbacks outstanding parks the loop, and the last
//! reporting callback resumes it. Locks are never held across caller code.

use crate::core::TaskValue;
use crate::core::context::Context;
use crate::core::error::TaskError;
use crate::core::flow::{FlowOutcome, FlowSpec, Step};
use futures::channel::oneshot;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Per-invocation state. The `data` bag is held behind its own lock so a
/// nested flow invocation can share it without sharing the rest.
pub(crate) struct Invocation {
    pub(crate) spec: Arc<FlowSpec>,
    pub(crate) id: Uuid,
    pub(crate) data: Arc<Mutex<TaskValue>>,
    pub(crate) state: Mutex<RunState>,
    pub(crate) finish: Mutex<Option<Finish>>,
}

pub(crate) struct RunState {
    pub(crate) queue: VecDeque<Step>,
    pub(crate) err: Option<TaskError>,
    /// Monotonic step counter; a `Context` minted for an earlier epoch is
    /// stale and all of its advance calls are ignored.
    pub(crate) epoch: u64,
    pub(crate) step: StepState,
}

#[derive(Default)]
pub(crate) struct StepState {
    /// The step's synchronous body has not returned yet.
    in_sync: bool,
    /// The step already advanced; later advance calls are duplicates.
    advanced: bool,
    issued: usize,
    pending: usize,
    /// Completions to await before auto-advancing (the flow's batch size).
    min_issued: usize,
    /// One buffered result list per issued callback, in declaration order.
    slots: Vec<Option<Vec<TaskValue>>>,
    /// Arguments recorded by an explicit `next`/`callback`/`end`.
    explicit: Option<Vec<TaskValue>>,
    jump: bool,
}

/// Completion hooks, taken exactly once when the invocation finishes.
pub(crate) struct Finish {
    pub(crate) tx: Option<oneshot::Sender<FlowOutcome>>,
    pub(crate) nested: Option<Box<dyn FnOnce(FlowOutcome) + Send>>,
}

struct Advance {
    args: Vec<TaskValue>,
    jump: bool,
}

impl Invocation {
    pub(crate) fn label(&self) -> &str {
        self.spec.name.as_deref().unwrap_or("flow")
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().expect("invocation state lock poisoned")
    }
}

pub(crate) fn launch(run: Arc<Invocation>, args: Vec<TaskValue>) {
    log::debug!(
        "flow '{}' [{}]: starting with {} step(s)",
        run.label(),
        run.id,
        run.lock_state().queue.len()
    );
    run_loop(&run, args);
}

/// Runs steps until one parks waiting for completions or the queue drains.
fn run_loop(run: &Arc<Invocation>, mut args: Vec<TaskValue>) {
    loop {
        let popped = {
            let mut st = run.lock_state();
            st.queue.pop_front().map(|step| {
                st.epoch += 1;
                st.step = StepState {
                    in_sync: true,
                    min_issued: run.spec.batch_size.unwrap_or(0),
                    ..StepState::default()
                };
                (step, st.epoch)
            })
        };
        let Some((step, epoch)) = popped else {
            finish(run, args);
            return;
        };

        match step {
            Step::Task(task) => {
                task(Context::new(Arc::clone(run), epoch), args);
                let ready = {
                    let mut st = run.lock_state();
                    st.step.in_sync = false;
                    try_take_advance(&mut st)
                };
                match ready {
                    Some(advance) => args = accept(run, epoch, advance),
                    // Parked; the last completion callback resumes the loop.
                    None => return,
                }
            }
            Step::Flow(subflow) => {
                log::debug!(
                    "flow '{}' [{}]: step {} enters nested flow '{}'",
                    run.label(),
                    run.id,
                    epoch,
                    subflow.spec.name.as_deref().unwrap_or("flow")
                );
                let parent = Arc::clone(run);
                let inherited = run.lock_state().err.clone();
                subflow.invoke_nested(
                    args,
                    Arc::clone(&run.data),
                    inherited,
                    Box::new(move |outcome: FlowOutcome| {
                        let advance = {
                            let mut st = parent.lock_state();
                            st.step.in_sync = false;
                            st.step.advanced = true;
                            // The nested terminal state stands in for an
                            // explicit advance: its final error slot is
                            // written back wholesale.
                            st.err = outcome.err;
                            Advance {
                                args: outcome.args,
                                jump: false,
                            }
                        };
                        let args = accept(&parent, epoch, advance);
                        run_loop(&parent, args);
                    }),
                );
                // The nested completion hook continues this invocation,
                // whether it already fired or fires later.
                return;
            }
        }
    }
}

/// Records an explicit `next`/`callback`/`end` from the step at `epoch`.
pub(crate) fn explicit_advance(
    run: &Arc<Invocation>,
    epoch: u64,
    error: Option<TaskError>,
    values: Vec<TaskValue>,
    jump: bool,
) {
    let ready = {
        let mut st = run.lock_state();
        if st.epoch != epoch || st.step.advanced {
            log::debug!(
                "flow '{}' [{}]: duplicate advance from step {} ignored",
                run.label(),
                run.id,
                epoch
            );
            return;
        }
        if let Some(e) = error {
            log::debug!("flow '{}' [{}]: error recorded: {}", run.label(), run.id, e);
            st.err = Some(e);
        }
        st.step.advanced = true;
        st.step.explicit = Some(values);
        st.step.jump = jump;
        try_take_advance(&mut st)
    };
    if let Some(advance) = ready {
        let args = accept(run, epoch, advance);
        run_loop(run, args);
    }
}

/// Reserves the next ordered result slot for the step at `epoch`. Returns
/// `None` when the step has already advanced; the callback is then dead.
pub(crate) fn issue_slot(run: &Arc<Invocation>, epoch: u64) -> Option<usize> {
    let mut st = run.lock_state();
    if st.epoch != epoch || st.step.advanced {
        log::warn!(
            "flow '{}' [{}]: completion callback requested after step {} advanced; it will never fire",
            run.label(),
            run.id,
            epoch
        );
        return None;
    }
    st.step.issued += 1;
    st.step.pending += 1;
    st.step.slots.push(None);
    Some(st.step.slots.len() - 1)
}

/// Buffers one completion callback's results and advances the step once
/// every outstanding callback has reported.
pub(crate) fn complete_slot(
    run: &Arc<Invocation>,
    epoch: u64,
    slot: usize,
    error: Option<TaskError>,
    results: Vec<TaskValue>,
) {
    let ready = {
        let mut st = run.lock_state();
        if st.epoch != epoch || st.step.advanced {
            log::debug!(
                "flow '{}' [{}]: stale completion for step {} ignored",
                run.label(),
                run.id,
                epoch
            );
            return;
        }
        if st.step.slots[slot].is_some() {
            log::debug!(
                "flow '{}' [{}]: duplicate completion for step {} slot {} ignored",
                run.label(),
                run.id,
                epoch,
                slot
            );
            return;
        }
        if let Some(e) = error {
            log::debug!("flow '{}' [{}]: error recorded: {}", run.label(), run.id, e);
            st.err = Some(e);
        }
        st.step.slots[slot] = Some(results);
        st.step.pending -= 1;
        try_take_advance(&mut st)
    };
    if let Some(advance) = ready {
        let args = accept(run, epoch, advance);
        run_loop(run, args);
    }
}

/// Consumes a step's pending advance, if it is complete. Composes the next
/// step's arguments either from the explicit advance or by concatenating
/// the buffered slots in declaration order. Returns `None` while the step's
/// body is still running or callbacks are outstanding.
fn try_take_advance(st: &mut RunState) -> Option<Advance> {
    if st.step.in_sync {
        return None;
    }
    if st.step.advanced {
        let jump = st.step.jump;
        st.step.explicit.take().map(|args| Advance { args, jump })
    } else if st.step.issued > 0 && st.step.pending == 0 && st.step.issued >= st.step.min_issued {
        st.step.advanced = true;
        let args: Vec<TaskValue> = st.step.slots.drain(..).flatten().flatten().collect();
        Some(Advance { args, jump: false })
    } else {
        None
    }
}

/// Applies an `end` jump (truncating the queue to the terminal step) and
/// yields the arguments for the next step.
fn accept(run: &Arc<Invocation>, epoch: u64, advance: Advance) -> Vec<TaskValue> {
    if advance.jump {
        let mut st = run.lock_state();
        let terminal = st.queue.pop_back();
        st.queue.clear();
        if let Some(step) = terminal {
            st.queue.push_back(step);
        }
        log::debug!(
            "flow '{}' [{}]: step {} jumped to the terminal step",
            run.label(),
            run.id,
            epoch
        );
    } else {
        log::debug!(
            "flow '{}' [{}]: step {} advanced with {} arg(s)",
            run.label(),
            run.id,
            epoch,
            advance.args.len()
        );
    }
    advance.args
}

/// Fires the completion hooks exactly once.
fn finish(run: &Arc<Invocation>, args: Vec<TaskValue>) {
    let Some(hooks) = run
        .finish
        .lock()
        .expect("invocation finish lock poisoned")
        .take()
    else {
        return;
    };
    // Take the two locks one after the other, never together.
    let err = run.lock_state().err.clone();
    let data = run.data.lock().expect("data lock poisoned").clone();
    let outcome = FlowOutcome { err, args, data };
    log::debug!("flow '{}' [{}]: done", run.label(), run.id);
    for listener in &run.spec.listeners {
        listener(&outcome);
    }
    match (hooks.nested, hooks.tx) {
        (Some(nested), Some(tx)) => {
            nested(outcome.clone());
            let _ = tx.send(outcome);
        }
        (Some(nested), None) => nested(outcome),
        // The caller may have dropped its Done handle; that is fine.
        (None, Some(tx)) => {
            let _ = tx.send(outcome);
        }
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::core::context::Context;
    use crate::core::error::TaskError;
    use crate::core::flow::Flow;
    use futures::executor::block_on;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_end_truncates_the_queue_to_the_terminal_step() {
        let skipped = Arc::new(AtomicUsize::new(0));
        let watched = Arc::clone(&skipped);
        let flow = Flow::builder()
            .task(|ctx: Context, _args| ctx.end(None, vec![json!("early")]))
            .task(move |ctx: Context, _args| {
                watched.fetch_add(1, Ordering::SeqCst);
                ctx.next(Vec::new());
            })
            .task(|ctx: Context, args| ctx.next(args))
            .build();

        let outcome = block_on(flow.call(Vec::new())).expect("flow completed");
        assert_eq!(outcome.args, vec![json!("early")]);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_advance_wins_over_later_calls_in_the_same_step() {
        let flow = Flow::builder()
            .task(|ctx: Context, _args| {
                ctx.next(vec![json!("first")]);
                ctx.next(vec![json!("second")]);
                ctx.callback(Some(TaskError::msg("late")), vec![json!("third")]);
            })
            .task(|ctx: Context, args| {
                assert_eq!(args, vec![json!("first")]);
                // The duplicate calls were dropped wholesale: no error
                // sneaks into the slot either.
                assert!(ctx.err().is_none());
                ctx.next(Vec::new());
            })
            .build();

        block_on(flow.call(Vec::new())).expect("flow completed");
    }

    #[test]
    fn test_callback_issued_after_advancing_is_dead() {
        let flow = Flow::builder()
            .task(|ctx: Context, _args| {
                ctx.next(vec![json!("done")]);
                // Too late: the step already advanced.
                ctx.async_cb().ok(vec![json!("never delivered")]);
            })
            .task(|ctx: Context, args| {
                assert_eq!(args, vec![json!("done")]);
                ctx.next(Vec::new());
            })
            .build();

        block_on(flow.call(Vec::new())).expect("flow completed");
    }
}
