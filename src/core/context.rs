use crate::core::TaskValue;
use crate::core::error::TaskError;
use crate::core::flow::Flow;
use crate::core::scheduler::{self, Invocation};
use std::sync::Arc;

/// Applies to a completion callback's raw result list before buffering.
pub(crate) type Selector = Arc<dyn Fn(Vec<TaskValue>) -> Vec<TaskValue> + Send + Sync>;

/// The per-step handle to a flow invocation.
///
/// Every task step receives a `Context` alongside its positional arguments.
/// It carries the invocation's shared `data` bag and error slot, and the
/// continuation primitives that move the flow forward: [`next`](Context::next),
/// [`callback`](Context::callback), [`end`](Context::end) and the
/// [`async_cb`](Context::async_cb) family.
///
/// A `Context` is cheap to clone and may be moved into spawned tasks or
/// completion callbacks. Each step gets its own handle; once the step has
/// advanced, calls through any handle minted for it are silently ignored,
/// so a double-fired callback or a stashed handle from an earlier step
/// cannot advance the flow twice.
#[derive(Clone)]
pub struct Context {
    run: Arc<Invocation>,
    epoch: u64,
}

impl Context {
    pub(crate) fn new(run: Arc<Invocation>, epoch: u64) -> Self {
        Context { run, epoch }
    }

    /// Records success and advances to the next step, delivering `values`
    /// as its positional arguments.
    ///
    /// A second `next`/`callback` call after the step has advanced is a
    /// no-op.
    pub fn next(&self, values: Vec<TaskValue>) {
        scheduler::explicit_advance(&self.run, self.epoch, None, values, false);
    }

    /// Error-first variant of [`next`](Context::next), matching the ambient
    /// asynchronous-callback convention. A non-`None` `error` is stored in
    /// the shared error slot before advancing.
    pub fn callback(&self, error: Option<TaskError>, values: Vec<TaskValue>) {
        scheduler::explicit_advance(&self.run, self.epoch, error, values, false);
    }

    /// Abandons all remaining steps and jumps directly to the flow's
    /// terminal step, delivering `values` positionally. `error` may be
    /// `None` to signal a non-error early exit. From the terminal step
    /// itself, `end` completes the invocation.
    pub fn end(&self, error: Option<TaskError>, values: Vec<TaskValue>) {
        scheduler::explicit_advance(&self.run, self.epoch, error, values, true);
    }

    /// Returns a completion callback to hand to an external asynchronous
    /// operation.
    ///
    /// Each call reserves the next ordered result slot for the current
    /// step. Once every reserved callback has reported (and the step's
    /// synchronous body has returned), the step advances as if `next` had
    /// been called with the buffered results concatenated in reservation
    /// order, regardless of completion order.
    pub fn async_cb(&self) -> AsyncCallback {
        self.make_callback(None)
    }

    /// Like [`async_cb`](Context::async_cb), but runs `selector` over the
    /// raw result list before buffering. See [`nth`] for adapting
    /// operations that report more than one value.
    pub fn async_as<F>(&self, selector: F) -> AsyncCallback
    where
        F: Fn(Vec<TaskValue>) -> Vec<TaskValue> + Send + Sync + 'static,
    {
        self.make_callback(Some(Arc::new(selector)))
    }

    fn make_callback(&self, selector: Option<Selector>) -> AsyncCallback {
        AsyncCallback {
            slot: scheduler::issue_slot(&self.run, self.epoch),
            run: Arc::clone(&self.run),
            epoch: self.epoch,
            selector,
        }
    }

    /// Invokes a nested compiled flow with the given arguments, delivering
    /// its terminal result (or error) to `cb`. The outer flow does not
    /// advance until the callback fires. The nested invocation shares this
    /// invocation's data bag and starts with its current error slot.
    pub fn exec(&self, subflow: &Flow, args: Vec<TaskValue>, cb: AsyncCallback) {
        let inherited = self.run.lock_state().err.clone();
        subflow.invoke_nested(
            args,
            Arc::clone(&self.run.data),
            inherited,
            Box::new(move |outcome| cb.complete(outcome.err, outcome.args)),
        );
    }

    /// Declares `items` as dynamic parallel units of work and advances,
    /// delivering one item per positional argument. Used from the first
    /// step of a [`parallel_each`](crate::parallel_each) flow.
    pub fn fork(&self, items: Vec<TaskValue>) {
        log::debug!(
            "flow '{}': forking {} item(s)",
            self.run.label(),
            items.len()
        );
        self.next(items);
    }

    /// The shared error slot. `None` until a step or callback records an
    /// error; once set it stays visible until explicitly cleared.
    pub fn err(&self) -> Option<TaskError> {
        self.run.lock_state().err.clone()
    }

    /// Records `error` in the shared error slot.
    pub fn set_err(&self, error: TaskError) {
        self.run.lock_state().err = Some(error);
    }

    /// Explicitly clears the shared error slot. The engine itself never
    /// clears a recorded error.
    pub fn clear_err(&self) {
        self.run.lock_state().err = None;
    }

    /// A snapshot of the shared data bag.
    pub fn data(&self) -> TaskValue {
        self.run.data.lock().expect("data lock poisoned").clone()
    }

    /// Replaces the shared data bag.
    pub fn set_data(&self, value: impl Into<TaskValue>) {
        *self.run.data.lock().expect("data lock poisoned") = value.into();
    }

    /// Runs `f` with mutable access to the shared data bag. Do not call
    /// other data accessors from inside `f`; the bag is locked for the
    /// duration of the call.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut TaskValue) -> R) -> R {
        f(&mut self.run.data.lock().expect("data lock poisoned"))
    }
}

/// A completion callback for one external asynchronous operation, created
/// by [`Context::async_cb`] / [`Context::async_as`].
///
/// Invoke it once with the error-first outcome of the operation. Completing
/// a callback twice, or completing one that belongs to a step that already
/// advanced, is silently ignored.
#[derive(Clone)]
pub struct AsyncCallback {
    run: Arc<Invocation>,
    epoch: u64,
    /// `None` when the callback was requested after its step advanced; such
    /// a callback is dead and completing it does nothing.
    slot: Option<usize>,
    selector: Option<Selector>,
}

impl AsyncCallback {
    /// Reports the operation's outcome: an optional error and the
    /// positional results.
    pub fn complete(self, error: Option<TaskError>, results: Vec<TaskValue>) {
        let Some(slot) = self.slot else {
            return;
        };
        let results = match &self.selector {
            Some(selector) => selector(results),
            None => results,
        };
        scheduler::complete_slot(&self.run, self.epoch, slot, error, results);
    }

    /// Reports success with the given results.
    pub fn ok(self, results: Vec<TaskValue>) {
        self.complete(None, results);
    }

    /// Reports failure.
    pub fn fail(self, error: TaskError) {
        self.complete(Some(error), Vec::new());
    }
}

/// A result selector forwarding only the `index`-th result argument,
/// discarding the rest. Adapts operations that report several values to
/// the one-value-per-callback join convention:
///
/// ```rust,no_run
/// # use weir::{nth, Context, TaskValue};
/// # fn read(cb: impl FnOnce(Option<weir::TaskError>, Vec<TaskValue>)) {}
/// # fn step(ctx: Context, _args: Vec<TaskValue>) {
/// // keep only the contents, dropping the operation's extra outputs
/// let cb = ctx.async_as(nth(0));
/// # }
/// ```
pub fn nth(index: usize) -> impl Fn(Vec<TaskValue>) -> Vec<TaskValue> + Send + Sync + 'static {
    move |mut results: Vec<TaskValue>| {
        if index < results.len() {
            vec![results.swap_remove(index)]
        } else {
            Vec::new()
        }
    }
}
