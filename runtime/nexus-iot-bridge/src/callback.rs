//! Callback invocation protocol.
//!
//! [`invoke_callback`] and [`invoke_callback_with_result`] are the only
//! sanctioned way for native code to call into script. Each invocation:
//!
//! 1. returns `undefined` without running anything once the process is
//!    exiting;
//! 2. calls the function synchronously;
//! 3. routes a thrown exception to the uncaught-exception handler;
//! 4. drains the next-tick queue, unless it is nested inside another
//!    invocation.

use tracing::{debug, error, trace, warn};

use crate::context::Runtime;
use crate::env::UNCAUGHT_EXCEPTION_EXIT_CODE;
use crate::metrics::CallbackTimer;
use crate::value::{JsFunction, JsValue};

/// Marks the runtime as inside a script callback for its lifetime
struct CallbackScope<'a> {
    rt: &'a Runtime,
}

impl<'a> CallbackScope<'a> {
    fn enter(rt: &'a Runtime) -> Self {
        rt.enter_callback();
        Self { rt }
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        self.rt.leave_callback();
    }
}

/// Invoke a script callback, discarding its result
pub fn invoke_callback(rt: &Runtime, f: &JsFunction, this: &JsValue, args: &[JsValue]) {
    let _ = invoke_callback_with_result(rt, f, this, args);
}

/// Invoke a script callback and return its result.
///
/// Returns `undefined` if the process is exiting or the callback threw.
pub fn invoke_callback_with_result(
    rt: &Runtime,
    f: &JsFunction,
    this: &JsValue,
    args: &[JsValue],
) -> JsValue {
    if rt.is_exiting() {
        rt.metrics().record_callback_suppressed();
        trace!(callback = f.name(), "callback suppressed while exiting");
        return JsValue::Undefined;
    }

    let result = {
        let _scope = CallbackScope::enter(rt);
        call_guarded(rt, f, this, args)
    };

    if rt.callback_depth() == 0 {
        process_next_tick(rt);
    }
    result
}

fn call_guarded(rt: &Runtime, f: &JsFunction, this: &JsValue, args: &[JsValue]) -> JsValue {
    let timer = CallbackTimer::start();
    let outcome = f.call(rt, this, args);
    rt.metrics().record_callback(timer.elapsed());
    match outcome {
        Ok(value) => value,
        Err(exception) => {
            handle_uncaught_exception(rt, exception);
            JsValue::Undefined
        }
    }
}

/// Schedule `f` to run once the current callback finishes
pub fn next_tick(rt: &Runtime, f: JsFunction) {
    rt.next_ticks().borrow_mut().push_back(f);
}

/// Run queued next-tick callbacks until the queue is empty.
///
/// Callbacks queued while draining run in the same drain. Returns whether
/// anything ran.
pub fn process_next_tick(rt: &Runtime) -> bool {
    let _scope = CallbackScope::enter(rt);
    let mut ran = 0u64;

    loop {
        let batch: Vec<JsFunction> = rt.next_ticks().borrow_mut().drain(..).collect();
        if batch.is_empty() {
            break;
        }
        for f in batch {
            if rt.is_exiting() {
                rt.metrics().record_callback_suppressed();
                continue;
            }
            call_guarded(rt, &f, &JsValue::Undefined, &[]);
            ran += 1;
        }
    }

    if ran > 0 {
        rt.metrics().record_next_ticks(ran);
        trace!(ran, "next tick queue drained");
    }
    ran > 0
}

/// Deliver an exception that escaped a callback.
///
/// The handler may return `false` to report it did not handle the error.
/// An unhandled exception, a throwing handler or a missing handler sends
/// the process to `Exiting` with [`UNCAUGHT_EXCEPTION_EXIT_CODE`].
pub fn handle_uncaught_exception(rt: &Runtime, exception: JsValue) {
    rt.metrics().record_uncaught_exception();

    let handled = match rt.uncaught_exception_handler() {
        Some(handler) => match handler.call(rt, &JsValue::Undefined, &[exception.clone()]) {
            Ok(JsValue::Bool(false)) => {
                debug!(?exception, "uncaught exception handler declined");
                false
            }
            Ok(_) => true,
            Err(thrown) => {
                error!(?exception, ?thrown, "uncaught exception handler threw");
                false
            }
        },
        None => false,
    };

    if !handled {
        warn!(?exception, "uncaught exception");
        rt.begin_exit(UNCAUGHT_EXCEPTION_EXIT_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::env::ProcessState;
    use crate::error::ScriptError;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn create_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_thread_pool_size(1)).unwrap()
    }

    fn push(log: &Rc<RefCell<Vec<String>>>, entry: &str) -> JsFunction {
        let log = Rc::clone(log);
        let entry = entry.to_string();
        JsFunction::new(&entry.clone(), move |_, _, _| {
            log.borrow_mut().push(entry.clone());
            Ok(JsValue::Undefined)
        })
    }

    #[test]
    fn test_returns_callback_result() {
        let rt = create_runtime();
        let f = JsFunction::new("double", |_, _, args| {
            Ok(JsValue::from(args[0].as_number().unwrap_or(0.0) * 2.0))
        });
        let args = [JsValue::from(21)];
        let result = invoke_callback_with_result(&rt, &f, &JsValue::Undefined, &args);
        assert_eq!(result, JsValue::from(42));
        assert_eq!(rt.metrics().snapshot().callbacks_invoked, 1);
    }

    #[test]
    fn test_next_tick_runs_after_body() {
        let rt = create_runtime();
        let log = Rc::new(RefCell::new(Vec::new()));

        let tick = push(&log, "tick");
        let inner_log = Rc::clone(&log);
        let body = JsFunction::new("body", move |rt, _, _| {
            next_tick(rt, tick.clone());
            inner_log.borrow_mut().push("body".to_string());
            Ok(JsValue::Undefined)
        });

        invoke_callback(&rt, &body, &JsValue::Undefined, &[]);
        assert_eq!(*log.borrow(), vec!["body", "tick"]);
    }

    #[test]
    fn test_nested_invoke_defers_drain_to_outermost() {
        let rt = create_runtime();
        let log = Rc::new(RefCell::new(Vec::new()));

        let tick = push(&log, "tick");
        let inner = {
            let log = Rc::clone(&log);
            JsFunction::new("inner", move |rt, _, _| {
                next_tick(rt, tick.clone());
                log.borrow_mut().push("inner".to_string());
                Ok(JsValue::Undefined)
            })
        };
        let outer = {
            let log = Rc::clone(&log);
            JsFunction::new("outer", move |rt, _, _| {
                invoke_callback(rt, &inner, &JsValue::Undefined, &[]);
                log.borrow_mut().push("outer".to_string());
                Ok(JsValue::Undefined)
            })
        };

        invoke_callback(&rt, &outer, &JsValue::Undefined, &[]);
        assert_eq!(*log.borrow(), vec!["inner", "outer", "tick"]);
    }

    #[test]
    fn test_ticks_queued_by_ticks_run_in_same_drain() {
        let rt = create_runtime();
        let log = Rc::new(RefCell::new(Vec::new()));
        let second = push(&log, "second");
        let first = {
            let log = Rc::clone(&log);
            JsFunction::new("first", move |rt, _, _| {
                log.borrow_mut().push("first".to_string());
                next_tick(rt, second.clone());
                Ok(JsValue::Undefined)
            })
        };
        next_tick(&rt, first);

        assert!(process_next_tick(&rt));
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert!(!process_next_tick(&rt));
        assert_eq!(rt.metrics().snapshot().next_ticks_run, 2);
    }

    #[test]
    fn test_exception_routed_before_next_tick() {
        let rt = create_runtime();
        let log = Rc::new(RefCell::new(Vec::new()));

        let handler = {
            let log = Rc::clone(&log);
            JsFunction::new("handler", move |_, _, args| {
                let message = args[0].as_error().map(|e| e.message.clone()).unwrap_or_default();
                log.borrow_mut().push(format!("handler:{}", message));
                Ok(JsValue::Bool(true))
            })
        };
        rt.set_uncaught_exception_handler(Some(handler));

        let tick = push(&log, "tick");
        let body = JsFunction::new("body", move |rt, _, _| {
            next_tick(rt, tick.clone());
            Err(JsValue::from(ScriptError::error("boom")))
        });

        invoke_callback(&rt, &body, &JsValue::Undefined, &[]);
        assert_eq!(*log.borrow(), vec!["handler:boom", "tick"]);
        assert!(!rt.is_exiting());
    }

    #[test]
    fn test_unhandled_exception_enters_exiting() {
        let rt = create_runtime();
        let thrower = JsFunction::new("thrower", |_, _, _| Err(JsValue::from("oops")));

        invoke_callback(&rt, &thrower, &JsValue::Undefined, &[]);
        assert_eq!(rt.state(), ProcessState::Exiting);
        assert_eq!(rt.exit_code(), UNCAUGHT_EXCEPTION_EXIT_CODE);
    }

    #[test]
    fn test_declining_or_throwing_handler_enters_exiting() {
        for verdict in [Ok(JsValue::Bool(false)), Err(JsValue::from("again"))] {
            let rt = create_runtime();
            let verdict = verdict.clone();
            rt.set_uncaught_exception_handler(Some(JsFunction::new("handler", move |_, _, _| {
                verdict.clone()
            })));
            handle_uncaught_exception(&rt, JsValue::from("oops"));
            assert!(rt.is_exiting());
            assert_eq!(rt.exit_code(), UNCAUGHT_EXCEPTION_EXIT_CODE);
        }
    }

    #[test]
    fn test_silence_after_exit() {
        let rt = create_runtime();
        let log = Rc::new(RefCell::new(Vec::new()));
        let f = push(&log, "call");

        rt.begin_exit(0);
        for _ in 0..100 {
            invoke_callback(&rt, &f, &JsValue::Undefined, &[]);
        }
        next_tick(&rt, f.clone());
        assert!(!process_next_tick(&rt));

        assert!(log.borrow().is_empty());
        assert_eq!(rt.metrics().snapshot().callbacks_suppressed, 101);
    }
}
