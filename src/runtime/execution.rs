//! Single-turn execution of orchestration handlers.
//!
//! A turn polls the handler future exactly once against the instance's
//! history. Durable futures resolve synchronously from recorded completions,
//! so one poll runs the workflow forward to its next unresolved await (or to
//! completion). Nothing here registers real wakers; progress between turns
//! comes from new history, not from task wakeups.

use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use tracing::{debug, warn};

use super::registry::OrchestrationHandler;
use crate::{Action, Event, OrchestrationContext};

/// What one turn produced: the decisions to commit, and the final output if
/// the handler ran to completion.
pub(crate) struct TurnOutcome {
    pub actions: Vec<Action>,
    pub output: Option<Result<String, String>>,
}

fn noop_raw_waker() -> RawWaker {
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    // SAFETY: the vtable functions never dereference the (null) data pointer.
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Run one turn of `handler` against `history`. `fresh_from` is the index of
/// the first event appended since the previous turn.
pub(crate) async fn run_turn(
    instance: &str,
    history: Vec<Event>,
    fresh_from: usize,
    handler: Arc<dyn OrchestrationHandler>,
    input: String,
) -> TurnOutcome {
    let ctx = OrchestrationContext::new(instance, history, fresh_from);
    let mut fut = handler.invoke(ctx.clone(), input);

    let waker = noop_waker();
    let mut poll_ctx = Context::from_waker(&waker);
    let polled = std::future::Future::poll(fut.as_mut(), &mut poll_ctx);

    let actions = ctx.take_actions();
    if let Some(error) = ctx.take_nondeterminism() {
        warn!(instance, error = %error, "replay diverged from history, failing instance");
        return TurnOutcome {
            actions: Vec::new(),
            output: Some(Err(error)),
        };
    }
    match polled {
        Poll::Ready(output) => {
            debug!(instance, ok = output.is_ok(), "orchestration ran to completion");
            TurnOutcome {
                actions,
                output: Some(output),
            }
        }
        Poll::Pending => {
            debug!(instance, actions = actions.len(), "orchestration suspended");
            TurnOutcome { actions, output: None }
        }
    }
}
