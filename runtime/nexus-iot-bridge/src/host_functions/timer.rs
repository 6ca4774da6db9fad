//! Timer host functions.
//!
//! A timer object calls its own `handleTimeout` method on expiry. Timers
//! are single-use: stopping one closes its handle.

use std::rc::Rc;

use tracing::debug;

use super::{create_handle, handle_of, HostResult};
use crate::callback::invoke_callback;
use crate::context::Runtime;
use crate::error::status;
use crate::handle::HandleEvent;
use crate::value::{JsObject, JsValue};

/// Property invoked when the timer fires
pub const TIMEOUT_METHOD: &str = "handleTimeout";

fn to_ms(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

fn on_timeout(rt: &Runtime, object: &JsObject, event: HandleEvent) {
    if event != HandleEvent::Timeout {
        return;
    }
    match object.get_function(TIMEOUT_METHOD) {
        Some(f) => invoke_callback(rt, &f, &JsValue::from(object.clone()), &[]),
        None => debug!("timer fired without {}", TIMEOUT_METHOD),
    }
}

/// Bind a new timer handle to `object`
pub fn create(rt: &Runtime, object: &JsObject) -> HostResult<()> {
    let os = rt.event_loop().timer_init();
    create_handle(rt, object, os, Rc::new(on_timeout))?;
    Ok(())
}

/// Arm the timer. A non-zero `repeat_ms` fires it again every period.
pub fn start(rt: &Runtime, object: &JsObject, timeout_ms: f64, repeat_ms: f64) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    Ok(rt.event_loop().timer_start(os, to_ms(timeout_ms), to_ms(repeat_ms)))
}

/// Stop the timer by closing it
pub fn stop(rt: &Runtime, object: &JsObject) -> HostResult<i32> {
    super::close(rt, object, None)?;
    Ok(status::OK)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::value::JsFunction;
    use std::cell::Cell;

    fn counting_timer(rt: &Runtime, hits: &Rc<Cell<u32>>) -> JsObject {
        let object = JsObject::new();
        let seen = Rc::clone(hits);
        object.set(
            TIMEOUT_METHOD,
            JsFunction::new(TIMEOUT_METHOD, move |_, _, _| {
                seen.set(seen.get() + 1);
                Ok(JsValue::Undefined)
            }),
        );
        create(rt, &object).unwrap();
        object
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let rt = create_runtime();
        let hits = Rc::new(Cell::new(0));
        let object = counting_timer(&rt, &hits);

        assert_eq!(start(&rt, &object, 5.0, 0.0).unwrap(), status::OK);
        rt.run_loop();
        assert_eq!(hits.get(), 1);

        stop(&rt, &object).unwrap();
        rt.run_loop();
        assert_eq!(rt.live_handles(), 0);
    }

    #[test]
    fn test_repeating_timer_stops_itself() {
        let rt = create_runtime();
        let hits = Rc::new(Cell::new(0));
        let object = JsObject::new();
        let seen = Rc::clone(&hits);
        object.set(
            TIMEOUT_METHOD,
            JsFunction::new(TIMEOUT_METHOD, move |rt, this, _| {
                seen.set(seen.get() + 1);
                if seen.get() == 3 {
                    if let Some(timer) = this.as_object() {
                        stop(rt, timer).map_err(JsValue::from)?;
                    }
                }
                Ok(JsValue::Undefined)
            }),
        );
        create(&rt, &object).unwrap();
        start(&rt, &object, 1.0, 1.0).unwrap();

        rt.run_loop();
        assert_eq!(hits.get(), 3);
        assert_eq!(rt.live_handles(), 0);
    }

    #[test]
    fn test_negative_timeout_fires_immediately() {
        let rt = create_runtime();
        let hits = Rc::new(Cell::new(0));
        let object = counting_timer(&rt, &hits);
        start(&rt, &object, -10.0, f64::NAN).unwrap();
        rt.run_loop();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_start_after_stop_throws() {
        let rt = create_runtime();
        let hits = Rc::new(Cell::new(0));
        let object = counting_timer(&rt, &hits);
        stop(&rt, &object).unwrap();
        // closing, not yet closed: the loop rejects it
        assert_eq!(start(&rt, &object, 1.0, 0.0).unwrap(), status::EINVAL);
        rt.run_loop();
        assert!(start(&rt, &object, 1.0, 0.0).is_err());
        assert_eq!(hits.get(), 0);
    }
}
