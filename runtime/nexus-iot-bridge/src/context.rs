//! Runtime context and lifecycle driver.
//!
//! [`Runtime`] is the explicit context passed to every entry point. It
//! owns the process environment, the wrap arenas, the event loop, the
//! next-tick queue and the process-level script hooks. Nothing in the
//! bridge is global; two runtimes in one process are independent.
//!
//! The runtime is single-threaded. It is cheap to clone and clones share
//! state, so script functions may capture one.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::arena::ResourceArena;
use crate::callback::{invoke_callback, process_next_tick};
use crate::config::RuntimeConfig;
use crate::engine::{EventLoop, LoopEvent, PollMode};
use crate::env::{ProcessEnvironment, ProcessState, EXIT_LISTENER_FAILURE_EXIT_CODE};
use crate::error::Result;
use crate::handle::{self, HandleEvent, HandleWrap};
use crate::metrics::BridgeMetrics;
use crate::request::{self, RequestWrap};
use crate::value::{JsFunction, JsValue};

struct RuntimeInner {
    env: RefCell<ProcessEnvironment>,
    handles: RefCell<ResourceArena<HandleWrap>>,
    requests: RefCell<ResourceArena<RequestWrap>>,
    event_loop: EventLoop,
    next_ticks: RefCell<VecDeque<JsFunction>>,
    uncaught_handler: RefCell<Option<JsFunction>>,
    exit_listeners: RefCell<Vec<JsFunction>>,
    callback_depth: Cell<u32>,
    metrics: Arc<BridgeMetrics>,
}

/// The explicit runtime context
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with no arguments
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_args(config, Vec::new())
    }

    /// Create a runtime with the script-visible `argv`
    pub fn with_args(config: RuntimeConfig, argv: Vec<String>) -> Result<Self> {
        config.validate()?;
        let event_loop = EventLoop::new(&config)?;

        info!(
            threads = config.thread_pool_size,
            args = argv.len(),
            "Initializing IoT bridge runtime"
        );

        Ok(Self {
            inner: Rc::new(RuntimeInner {
                env: RefCell::new(ProcessEnvironment::new(config, argv)),
                handles: RefCell::new(ResourceArena::new("handle")),
                requests: RefCell::new(ResourceArena::new("request")),
                event_loop,
                next_ticks: RefCell::new(VecDeque::new()),
                uncaught_handler: RefCell::new(None),
                exit_listeners: RefCell::new(Vec::new()),
                callback_depth: Cell::new(0),
                metrics: Arc::new(BridgeMetrics::new()),
            }),
        })
    }

    // ---- lifecycle ----

    /// Run `entry`, then the loop, then shut down. Returns the exit code.
    #[instrument(skip(self, entry), fields(entry = entry.name()))]
    pub fn run(&self, entry: &JsFunction) -> i32 {
        self.env_mut().go_state_running_main();
        invoke_callback(self, entry, &JsValue::Undefined, &[]);

        if !self.is_exiting() {
            self.env_mut().go_state_running_loop();
            self.run_loop();
        }
        self.shutdown()
    }

    /// Drive the loop until nothing keeps it alive or the process exits
    pub fn run_loop(&self) {
        loop {
            let mut more = self.run_once(PollMode::Block);
            more |= process_next_tick(self);
            if !more {
                more = self.inner.event_loop.is_alive();
            }
            if !more || self.is_exiting() {
                break;
            }
        }
        debug!(exiting = self.is_exiting(), "event loop finished");
    }

    /// One loop iteration: timers, poll, timers again, close callbacks.
    /// Returns whether the loop is still alive.
    pub fn run_once(&self, mode: PollMode) -> bool {
        let event_loop = &self.inner.event_loop;

        self.run_timers();
        for event in event_loop.poll_io(mode) {
            self.dispatch(event);
        }
        self.run_timers();

        for os in event_loop.take_closed() {
            match event_loop.finish_close(os) {
                Some(id) => handle::on_closed(self, id),
                None => debug!(handle = %os, "closed handle had no wrap"),
            }
        }

        event_loop.record_iteration();
        self.inner.metrics.record_loop_iteration();
        event_loop.is_alive()
    }

    fn run_timers(&self) {
        while let Some(os) = self.inner.event_loop.pop_expired_timer() {
            handle::dispatch_event(self, os, HandleEvent::Timeout);
        }
    }

    fn dispatch(&self, event: LoopEvent) {
        match event {
            LoopEvent::Completed {
                req,
                status,
                payload,
            } => request::complete(self, req, status, payload),
            LoopEvent::Stream { handle, event } => {
                handle::dispatch_event(self, handle, HandleEvent::Stream(event))
            }
            LoopEvent::Datagram { handle, event } => {
                handle::dispatch_event(self, handle, HandleEvent::Datagram(event))
            }
            LoopEvent::Closed { handle } => {
                warn!(handle = %handle, "close confirmation outside the close phase")
            }
        }
    }

    /// Enter `Exiting` with `code`. Returns false if already exiting.
    pub fn begin_exit(&self, code: i32) -> bool {
        let mut env = self.env_mut();
        if !env.go_state_exiting() {
            return false;
        }
        env.set_exit_code(code);
        info!(code, "process exiting");
        true
    }

    /// Tear the process down. Returns the exit code.
    ///
    /// Exit listeners run, every live handle is closed, and the loop runs
    /// until all closes and in-flight requests have completed. Script
    /// callbacks are suppressed throughout.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> i32 {
        if self.state() == ProcessState::Terminated {
            return self.exit_code();
        }
        self.env_mut().go_state_exiting();
        self.emit_exit();

        let event_loop = &self.inner.event_loop;
        for os in event_loop.walk() {
            match event_loop.data(os) {
                Some(id) => handle::close(self, id, None),
                None => event_loop.close(os),
            }
        }
        while event_loop.is_alive() {
            self.run_once(PollMode::Block);
        }
        // closes requested by the last iteration's callbacks
        self.run_once(PollMode::NoWait);

        event_loop.shutdown();
        self.inner.next_ticks.borrow_mut().clear();
        self.inner.uncaught_handler.borrow_mut().take();
        self.inner.exit_listeners.borrow_mut().clear();
        self.env_mut().go_state_terminated();

        let code = self.exit_code();
        info!(
            code,
            handles = self.live_handles(),
            requests = self.live_requests(),
            "runtime terminated"
        );
        code
    }

    // ---- process hooks ----

    /// Register a listener called with the exit code on shutdown
    pub fn add_exit_listener(&self, listener: JsFunction) {
        self.inner.exit_listeners.borrow_mut().push(listener);
    }

    /// Call every exit listener once.
    ///
    /// Listeners run even while exiting. A listener that throws sets the
    /// exit code to [`EXIT_LISTENER_FAILURE_EXIT_CODE`].
    pub fn emit_exit(&self) {
        let listeners = std::mem::take(&mut *self.inner.exit_listeners.borrow_mut());
        for listener in listeners {
            let code = JsValue::from(self.exit_code());
            if let Err(exception) = listener.call(self, &JsValue::Undefined, &[code]) {
                warn!(listener = listener.name(), ?exception, "exit listener threw");
                self.set_exit_code(EXIT_LISTENER_FAILURE_EXIT_CODE);
            }
        }
    }

    /// Install or remove the uncaught-exception handler
    pub fn set_uncaught_exception_handler(&self, handler: Option<JsFunction>) {
        *self.inner.uncaught_handler.borrow_mut() = handler;
    }

    /// The uncaught-exception handler, if any
    pub fn uncaught_exception_handler(&self) -> Option<JsFunction> {
        self.inner.uncaught_handler.borrow().clone()
    }

    // ---- accessors ----

    /// The event loop
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Lifecycle metrics
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.inner.metrics
    }

    /// Process state
    pub fn state(&self) -> ProcessState {
        self.env().state()
    }

    /// Whether script callbacks are suppressed
    pub fn is_exiting(&self) -> bool {
        self.env().is_exiting()
    }

    /// Current exit code
    pub fn exit_code(&self) -> i32 {
        self.env().exit_code()
    }

    /// Set the exit code without exiting
    pub fn set_exit_code(&self, code: i32) {
        self.env_mut().set_exit_code(code);
    }

    /// Script-visible arguments
    pub fn argv(&self) -> Vec<String> {
        self.env().argv().to_vec()
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> RuntimeConfig {
        self.env().config().clone()
    }

    /// Handle wraps not yet freed
    pub fn live_handles(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    /// Request wraps not yet freed
    pub fn live_requests(&self) -> usize {
        self.inner.requests.borrow().len()
    }

    pub(crate) fn handles(&self) -> &RefCell<ResourceArena<HandleWrap>> {
        &self.inner.handles
    }

    pub(crate) fn requests(&self) -> &RefCell<ResourceArena<RequestWrap>> {
        &self.inner.requests
    }

    pub(crate) fn next_ticks(&self) -> &RefCell<VecDeque<JsFunction>> {
        &self.inner.next_ticks
    }

    pub(crate) fn callback_depth(&self) -> u32 {
        self.inner.callback_depth.get()
    }

    pub(crate) fn enter_callback(&self) {
        let depth = &self.inner.callback_depth;
        depth.set(depth.get() + 1);
    }

    pub(crate) fn leave_callback(&self) {
        let depth = &self.inner.callback_depth;
        depth.set(depth.get().saturating_sub(1));
    }

    fn env(&self) -> Ref<'_, ProcessEnvironment> {
        self.inner.env.borrow()
    }

    fn env_mut(&self) -> RefMut<'_, ProcessEnvironment> {
        self.inner.env.borrow_mut()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .field("handles", &self.live_handles())
            .field("requests", &self.live_requests())
            .field("event_loop", &self.inner.event_loop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::next_tick;
    use crate::env::UNCAUGHT_EXCEPTION_EXIT_CODE;
    use crate::error::BridgeError;
    use crate::value::JsObject;

    fn create_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_thread_pool_size(1)).unwrap()
    }

    fn noop(name: &str) -> JsFunction {
        JsFunction::new(name, |_, _, _| Ok(JsValue::Undefined))
    }

    #[test]
    fn test_tick_runs_between_events_of_one_batch() {
        use crate::engine::CompletionPayload;
        use crate::request::{RequestKind, RequestPayload};

        let rt = create_runtime();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        let first = JsFunction::new("first", move |rt, _, _| {
            log.borrow_mut().push("first");
            let log = Rc::clone(&log);
            next_tick(
                rt,
                JsFunction::new("tick", move |_, _, _| {
                    log.borrow_mut().push("tick");
                    Ok(JsValue::Undefined)
                }),
            );
            Ok(JsValue::Undefined)
        });
        let log = Rc::clone(&order);
        let second = JsFunction::new("second", move |_, _, _| {
            log.borrow_mut().push("second");
            Ok(JsValue::Undefined)
        });

        for callback in [first, second] {
            let (_, req) =
                request::create(&rt, Some(callback), RequestKind::Write, RequestPayload::None);
            rt.event_loop().post(LoopEvent::Completed {
                req,
                status: 0,
                payload: CompletionPayload::None,
            });
        }

        // both completions are taken by a single poll phase
        rt.run_once(PollMode::NoWait);
        assert_eq!(*order.borrow(), vec!["first", "tick", "second"]);
        assert_eq!(rt.live_requests(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Runtime::new(RuntimeConfig::default().with_thread_pool_size(0));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_run_empty_entry() {
        let rt = Runtime::with_args(RuntimeConfig::default(), vec!["main.js".into()]).unwrap();
        assert_eq!(rt.state(), ProcessState::Initializing);
        assert_eq!(rt.argv(), vec!["main.js".to_string()]);

        assert_eq!(rt.run(&noop("main")), 0);
        assert_eq!(rt.state(), ProcessState::Terminated);
        // a second shutdown is a no-op
        assert_eq!(rt.shutdown(), 0);
    }

    #[test]
    fn test_entry_exception_exits_with_code() {
        let rt = create_runtime();
        let entry = JsFunction::new("main", |_, _, _| Err(JsValue::from("fail")));
        assert_eq!(rt.run(&entry), UNCAUGHT_EXCEPTION_EXIT_CODE);
    }

    #[test]
    fn test_exit_listener_failure_sets_code() {
        let rt = create_runtime();
        rt.add_exit_listener(JsFunction::new("bad", |_, _, _| Err(JsValue::from("x"))));
        assert_eq!(rt.run(&noop("main")), EXIT_LISTENER_FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_exit_listener_sees_code_and_runs_once() {
        let rt = create_runtime();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        rt.add_exit_listener(JsFunction::new("listener", move |_, _, args| {
            log.borrow_mut().push(args[0].clone());
            Ok(JsValue::Undefined)
        }));
        let entry = JsFunction::new("main", |rt, _, _| {
            rt.begin_exit(7);
            Ok(JsValue::Undefined)
        });

        assert_eq!(rt.run(&entry), 7);
        rt.emit_exit();
        assert_eq!(*seen.borrow(), vec![JsValue::from(7)]);
    }

    #[test]
    fn test_loop_runs_next_ticks_from_entry() {
        let rt = create_runtime();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let tick = JsFunction::new("tick", move |_, _, _| {
            flag.set(true);
            Ok(JsValue::Undefined)
        });
        let entry = JsFunction::new("main", move |rt, _, _| {
            next_tick(rt, tick.clone());
            Ok(JsValue::Undefined)
        });

        assert_eq!(rt.run(&entry), 0);
        assert!(ran.get());
    }

    #[test]
    fn test_shutdown_closes_live_handles() {
        let rt = create_runtime();
        let object = JsObject::new();
        let weak = object.downgrade();
        let os = rt.event_loop().timer_init();
        handle::create(&rt, &object, os, None).unwrap();
        rt.event_loop().timer_start(os, 60_000, 0);
        drop(object);

        rt.begin_exit(0);
        assert_eq!(rt.shutdown(), 0);
        assert_eq!(rt.live_handles(), 0);
        assert_eq!(rt.event_loop().handle_count(), 0);
        assert!(weak.is_collected());
        assert!(rt.event_loop().pool().is_shut_down());
    }

    #[test]
    fn test_in_flight_requests_complete_silently_on_shutdown() {
        let rt = create_runtime();
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);
        let callback = JsFunction::new("cb", move |_, _, _| {
            flag.set(true);
            Ok(JsValue::Undefined)
        });
        let (_, req) = request::create(
            &rt,
            Some(callback),
            request::RequestKind::Work,
            request::RequestPayload::None,
        );
        rt.event_loop().queue_work(req, || Ok(serde_json::Value::Null));

        rt.begin_exit(0);
        rt.shutdown();
        assert!(!called.get());
        assert_eq!(rt.live_requests(), 0);
        assert_eq!(rt.metrics().snapshot().callbacks_suppressed, 1);
    }
}
