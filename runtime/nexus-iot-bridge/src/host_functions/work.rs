//! Work queue host functions.

use super::HostResult;
use crate::context::Runtime;
use crate::request::{self, RequestKind, RequestPayload};
use crate::value::JsFunction;

/// Run `job` on the worker pool.
///
/// The callback receives `(status, result)`; a job failing with a
/// negative status leaves `result` undefined.
pub fn queue_work<F>(rt: &Runtime, job: F, callback: JsFunction) -> HostResult<i32>
where
    F: FnOnce() -> std::result::Result<serde_json::Value, i32> + Send + 'static,
{
    let (_, req) = request::create(rt, Some(callback), RequestKind::Work, RequestPayload::None);
    let code = rt.event_loop().queue_work(req, job);
    Ok(request::dispatch(rt, req, code))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::status;
    use crate::value::JsValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_results_delivered_with_status() {
        let rt = create_runtime();
        let results = Rc::new(RefCell::new(Vec::new()));

        for i in 0..4 {
            let log = Rc::clone(&results);
            let callback = JsFunction::new("done", move |_, _, args| {
                log.borrow_mut().push(args.to_vec());
                Ok(JsValue::Undefined)
            });
            let job = move || {
                if i == 3 {
                    Err(status::EIO)
                } else {
                    Ok(serde_json::json!({ "square": i * i }))
                }
            };
            assert_eq!(queue_work(&rt, job, callback).unwrap(), status::OK);
        }

        run_until(&rt, || results.borrow().len() == 4);
        let results = results.borrow();
        let failed: Vec<_> = results
            .iter()
            .filter(|a| a[0] == JsValue::from(status::EIO))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0][1], JsValue::Undefined);

        let squares: Vec<f64> = results
            .iter()
            .filter_map(|a| a[1].as_object().and_then(|o| o.get("square").as_number()))
            .collect();
        assert_eq!(squares.len(), 3);
        assert!(squares.contains(&4.0));
    }

    #[test]
    fn test_queue_after_pool_shutdown_fails_through_callback() {
        let rt = create_runtime();
        rt.event_loop().pool().shutdown();

        let seen = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&seen);
        let callback = JsFunction::new("done", move |_, _, args| {
            *slot.borrow_mut() = Some(args[0].clone());
            Ok(JsValue::Undefined)
        });
        let code = queue_work(&rt, || Ok(serde_json::Value::Null), callback).unwrap();
        assert_eq!(code, status::ECANCELED);

        rt.run_once(crate::engine::PollMode::NoWait);
        assert_eq!(*seen.borrow(), Some(JsValue::from(status::ECANCELED)));
    }
}
