use crate::core::TaskValue;
use crate::core::context::Context;
use crate::core::error::{Stalled, TaskError};
use crate::core::scheduler::{self, Finish, Invocation, RunState, StepState};
use futures::channel::oneshot;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};
use uuid::Uuid;

pub(crate) type TaskFn = Arc<dyn Fn(Context, Vec<TaskValue>) + Send + Sync>;
type DoneListener = Arc<dyn Fn(&FlowOutcome) + Send + Sync>;

/// One entry of a compiled flow: a plain task function, or a previously
/// compiled flow spliced in as a single opaque step.
#[derive(Clone)]
pub(crate) enum Step {
    Task(TaskFn),
    Flow(Flow),
}

/// The immutable compile-time description of a flow.
#[derive(Clone)]
pub(crate) struct FlowSpec {
    pub(crate) name: Option<String>,
    pub(crate) batch_size: Option<usize>,
    pub(crate) steps: Vec<Step>,
    pub(crate) listeners: Vec<DoneListener>,
}

/// A compiled, reusable sequence of task steps.
///
/// Built once with [`Flow::builder`], then invoked any number of times with
/// [`call`](Flow::call); every call runs independently with its own
/// [`Context`]. The last step of the sequence is the terminal step: it is
/// where [`end`](Context::end) jumps land and what completes the
/// invocation.
#[derive(Clone)]
pub struct Flow {
    pub(crate) spec: Arc<FlowSpec>,
}

impl Flow {
    pub fn builder() -> FlowBuilder {
        FlowBuilder {
            name: None,
            batch_size: None,
            steps: Vec::new(),
        }
    }

    /// The name given at compile time, if any. Used to tag log output.
    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    /// Number of compiled steps. A zero-step flow is valid and completes
    /// immediately when called.
    pub fn len(&self) -> usize {
        self.spec.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spec.steps.is_empty()
    }

    /// Registers a completion listener, fired exactly once per invocation
    /// with the terminal outcome. Returns the extended flow; already
    /// compiled copies of this flow are unaffected.
    pub fn on_done<F>(self, listener: F) -> Flow
    where
        F: Fn(&FlowOutcome) + Send + Sync + 'static,
    {
        let mut spec = (*self.spec).clone();
        spec.listeners.push(Arc::new(listener));
        Flow {
            spec: Arc::new(spec),
        }
    }

    /// Starts one invocation, delivering `args` to the first step exactly
    /// like [`next`](Context::next) arguments.
    ///
    /// Execution begins on the calling thread and proceeds as far as it can
    /// before parking on outstanding completion callbacks. The returned
    /// [`Done`] future resolves once the terminal step completes; dropping
    /// it does not cancel the invocation.
    pub fn call(&self, args: Vec<TaskValue>) -> Done {
        let (tx, rx) = oneshot::channel();
        self.invoke(
            args,
            Arc::new(Mutex::new(TaskValue::Null)),
            None,
            Some(tx),
            None,
        );
        Done { rx }
    }

    /// Runs this flow as a nested step: sharing the caller's data bag,
    /// inheriting its error slot, and reporting the outcome through `hook`.
    pub(crate) fn invoke_nested(
        &self,
        args: Vec<TaskValue>,
        data: Arc<Mutex<TaskValue>>,
        err: Option<TaskError>,
        hook: Box<dyn FnOnce(FlowOutcome) + Send>,
    ) {
        self.invoke(args, data, err, None, Some(hook));
    }

    fn invoke(
        &self,
        args: Vec<TaskValue>,
        data: Arc<Mutex<TaskValue>>,
        err: Option<TaskError>,
        tx: Option<oneshot::Sender<FlowOutcome>>,
        nested: Option<Box<dyn FnOnce(FlowOutcome) + Send>>,
    ) {
        let queue: VecDeque<Step> = self.spec.steps.iter().cloned().collect();
        let run = Arc::new(Invocation {
            spec: Arc::clone(&self.spec),
            id: Uuid::new_v4(),
            data,
            state: Mutex::new(RunState {
                queue,
                err,
                epoch: 0,
                step: StepState::default(),
            }),
            finish: Mutex::new(Some(Finish { tx, nested })),
        });
        scheduler::launch(run, args);
    }
}

/// Compiles a [`Flow`] from task functions and nested flows, in order.
pub struct FlowBuilder {
    name: Option<String>,
    batch_size: Option<usize>,
    steps: Vec<Step>,
}

impl FlowBuilder {
    /// Names the flow; the name shows up in log output.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the default number of asynchronous completions a step awaits
    /// before auto-advancing. Steps that advance explicitly are unaffected.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "Batch size must be greater than 0");
        self.batch_size = Some(batch_size);
        self
    }

    /// Appends a task step.
    pub fn task<F>(mut self, task: F) -> Self
    where
        F: Fn(Context, Vec<TaskValue>) + Send + Sync + 'static,
    {
        self.steps.push(Step::Task(Arc::new(task)));
        self
    }

    /// Splices a previously compiled flow in as a single opaque step. The
    /// nested flow runs its own full lifecycle, sharing the outer data bag
    /// and error slot as described on [`Context::exec`].
    pub fn flow(mut self, subflow: Flow) -> Self {
        self.steps.push(Step::Flow(subflow));
        self
    }

    pub fn build(self) -> Flow {
        Flow {
            spec: Arc::new(FlowSpec {
                name: self.name,
                batch_size: self.batch_size,
                steps: self.steps,
                listeners: Vec::new(),
            }),
        }
    }
}

/// Everything the terminal step left behind: its delivered arguments, the
/// final error slot, and the final data bag.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub err: Option<TaskError>,
    pub args: Vec<TaskValue>,
    pub data: TaskValue,
}

/// Resolves with the [`FlowOutcome`] of one invocation, exactly once.
///
/// Yields [`Stalled`] if the invocation is abandoned (every live handle
/// dropped without the terminal step completing).
pub struct Done {
    rx: oneshot::Receiver<FlowOutcome>,
}

impl Future for Done {
    type Output = Result<FlowOutcome, Stalled>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|outcome| outcome.map_err(|_| Stalled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::executor::block_on;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_flow_completes_immediately_with_no_arguments() {
        let flow = Flow::builder().build();
        assert!(flow.is_empty());

        let outcome = flow
            .call(Vec::new())
            .now_or_never()
            .expect("empty flow completes synchronously")
            .expect("not stalled");
        assert!(outcome.args.is_empty());
        assert!(outcome.err.is_none());
    }

    #[test]
    fn test_single_task_flow() {
        let flow = Flow::builder()
            .task(|ctx: Context, _args| ctx.next(vec![json!("only")]))
            .build();
        let outcome = block_on(flow.call(Vec::new())).expect("not stalled");
        assert_eq!(outcome.args, vec![json!("only")]);
    }

    #[test]
    fn test_startup_arguments_reach_the_first_step_unchanged() {
        let flow = Flow::builder()
            .task(|ctx: Context, args| {
                assert_eq!(args, vec![json!(1), json!(true), json!("hoge")]);
                ctx.next(args);
            })
            .build();
        let outcome =
            block_on(flow.call(vec![json!(1), json!(true), json!("hoge")])).expect("not stalled");
        assert_eq!(outcome.args, vec![json!(1), json!(true), json!("hoge")]);
    }

    #[test]
    fn test_on_done_listener_fires_once_per_invocation() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let flow = Flow::builder()
            .task(|ctx: Context, _args| ctx.next(vec![json!(7)]))
            .build()
            .on_done(move |outcome| {
                assert_eq!(outcome.args, vec![json!(7)]);
                observed.fetch_add(1, Ordering::SeqCst);
            });

        block_on(flow.call(Vec::new())).expect("not stalled");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        block_on(flow.call(Vec::new())).expect("not stalled");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invocations_are_independent() {
        let flow = Flow::builder()
            .task(|ctx: Context, args| {
                ctx.set_data(args[0].clone());
                ctx.next(Vec::new());
            })
            .task(|ctx: Context, _args| {
                let data = ctx.data();
                ctx.next(vec![data]);
            })
            .build();

        let first = block_on(flow.call(vec![json!("a")])).expect("not stalled");
        let second = block_on(flow.call(vec![json!("b")])).expect("not stalled");
        assert_eq!(first.args, vec![json!("a")]);
        assert_eq!(second.args, vec![json!("b")]);
    }

    #[test]
    #[should_panic(expected = "Batch size must be greater than 0")]
    fn test_zero_batch_size_panics() {
        let _ = Flow::builder().batch_size(0);
    }

    #[test]
    fn test_named_flow_reports_its_name() {
        let flow = Flow::builder().named("myFlow").build();
        assert_eq!(flow.name(), Some("myFlow"));
        assert_eq!(flow.len(), 0);
    }
}
