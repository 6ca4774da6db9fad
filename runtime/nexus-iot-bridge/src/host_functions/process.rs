//! Process host functions.
//!
//! Exit handling, the next-tick queue and the uncaught-exception handler.

use tracing::info;

use super::HostResult;
use crate::callback;
use crate::context::Runtime;
use crate::value::{JsFunction, JsValue};

/// Run `f` after the current callback, before the next loop event
pub fn next_tick(rt: &Runtime, f: JsFunction) -> HostResult<()> {
    callback::next_tick(rt, f);
    Ok(())
}

/// Set the exit code and enter `Exiting`.
///
/// Script callbacks stop firing; the loop unwinds and closes every handle.
pub fn exit(rt: &Runtime, code: i32) -> HostResult<()> {
    info!(code, "exit requested by script");
    rt.set_exit_code(code);
    rt.begin_exit(code);
    Ok(())
}

/// Install the uncaught-exception handler, or remove it with `None`.
///
/// The handler may return `false` to report it did not handle the error.
pub fn set_uncaught_exception_handler(rt: &Runtime, handler: Option<JsFunction>) -> HostResult<()> {
    rt.set_uncaught_exception_handler(handler);
    Ok(())
}

/// Register an exit listener
pub fn on_exit(rt: &Runtime, listener: JsFunction) -> HostResult<()> {
    rt.add_exit_listener(listener);
    Ok(())
}

/// Call the exit listeners now
pub fn emit_exit(rt: &Runtime) -> HostResult<()> {
    rt.emit_exit();
    Ok(())
}

/// Script arguments as an array
pub fn argv(rt: &Runtime) -> JsValue {
    JsValue::from(rt.argv().into_iter().map(JsValue::from).collect::<Vec<_>>())
}

/// Current exit code
pub fn exit_code(rt: &Runtime) -> i32 {
    rt.exit_code()
}

/// Set the exit code used when the process ends normally
pub fn set_exit_code(rt: &Runtime, code: i32) -> HostResult<()> {
    rt.set_exit_code(code);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::env::ProcessState;
    use crate::host_functions::timer;
    use crate::value::JsObject;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn test_exit_from_timer_stops_loop() {
        let rt = Runtime::new(RuntimeConfig::default().with_thread_pool_size(1)).unwrap();
        let later_fired = Rc::new(Cell::new(false));

        let exiting = JsObject::new();
        exiting.set(
            timer::TIMEOUT_METHOD,
            JsFunction::new("exit", |rt, _, _| {
                exit(rt, 3).map_err(JsValue::from)?;
                Ok(JsValue::Undefined)
            }),
        );
        let later = JsObject::new();
        let flag = Rc::clone(&later_fired);
        later.set(
            timer::TIMEOUT_METHOD,
            JsFunction::new("later", move |_, _, _| {
                flag.set(true);
                Ok(JsValue::Undefined)
            }),
        );

        let timers = (exiting.clone(), later.clone());
        let entry = JsFunction::new("main", move |rt, _, _| {
            timer::create(rt, &timers.0).map_err(JsValue::from)?;
            timer::start(rt, &timers.0, 1.0, 0.0).map_err(JsValue::from)?;
            timer::create(rt, &timers.1).map_err(JsValue::from)?;
            timer::start(rt, &timers.1, 50.0, 0.0).map_err(JsValue::from)?;
            Ok(JsValue::Undefined)
        });

        assert_eq!(rt.run(&entry), 3);
        assert!(!later_fired.get());
        assert_eq!(rt.state(), ProcessState::Terminated);
        assert_eq!(rt.live_handles(), 0);
    }

    #[test]
    fn test_argv_and_exit_code() {
        let rt = Runtime::with_args(
            RuntimeConfig::default(),
            vec!["iotjs".into(), "app.js".into()],
        )
        .unwrap();
        assert_eq!(
            argv(&rt),
            JsValue::from(vec![JsValue::from("iotjs"), JsValue::from("app.js")])
        );
        set_exit_code(&rt, 4).unwrap();
        assert_eq!(exit_code(&rt), 4);
        assert!(!rt.is_exiting());
    }

    #[test]
    fn test_exit_listeners_run_on_emit() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&calls);
        on_exit(
            &rt,
            JsFunction::new("listener", move |_, _, args| {
                log.borrow_mut().push(args[0].clone());
                Ok(JsValue::Undefined)
            }),
        )
        .unwrap();

        exit(&rt, 9).unwrap();
        emit_exit(&rt).unwrap();
        emit_exit(&rt).unwrap();
        assert_eq!(*calls.borrow(), vec![JsValue::from(9)]);
    }
}
