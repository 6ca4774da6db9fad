//! Script value model.
//!
//! The embedded engine is an external collaborator; this module is the
//! surface the bridge needs from it: values, objects that can carry a
//! native binding, and functions that can be called with a result or an
//! exception.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::arena::WrapId;
use crate::buffer::BufferWrap;
use crate::context::Runtime;
use crate::error::ScriptError;

/// Outcome of calling a script function: a value or a thrown exception
pub type CallResult = std::result::Result<JsValue, JsValue>;

/// Body of a callable function
pub type NativeFn = dyn Fn(&Runtime, &JsValue, &[JsValue]) -> CallResult;

/// A script-visible value
#[derive(Clone, Default)]
pub enum JsValue {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number
    Number(f64),
    /// String
    String(Rc<str>),
    /// Array of values
    Array(Rc<Vec<JsValue>>),
    /// Object
    Object(JsObject),
    /// Function
    Function(JsFunction),
    /// Error value
    Error(Rc<ScriptError>),
}

impl JsValue {
    /// Whether this is `undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    /// Whether this is `null`
    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    /// Numeric value, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object, if this is an object
    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            JsValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Function, if this is a function
    pub fn as_function(&self) -> Option<&JsFunction> {
        match self {
            JsValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Error, if this is an error value
    pub fn as_error(&self) -> Option<&ScriptError> {
        match self {
            JsValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Elements, if this is an array
    pub fn as_array(&self) -> Option<&[JsValue]> {
        match self {
            JsValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Script truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Name of the value's type, as `typeof` would report it
    pub fn type_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Function(_) => "function",
            _ => "object",
        }
    }
}

impl PartialEq for JsValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) => true,
            (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Array(a), JsValue::Array(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => JsObject::ptr_eq(a, b),
            (JsValue::Function(a), JsValue::Function(b)) => JsFunction::ptr_eq(a, b),
            (JsValue::Error(a), JsValue::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::Undefined => write!(f, "undefined"),
            JsValue::Null => write!(f, "null"),
            JsValue::Bool(b) => write!(f, "{}", b),
            JsValue::Number(n) => write!(f, "{}", n),
            JsValue::String(s) => write!(f, "{:?}", s),
            JsValue::Array(items) => f.debug_list().entries(items.iter()).finish(),
            JsValue::Object(o) => o.fmt(f),
            JsValue::Function(func) => func.fmt(f),
            JsValue::Error(e) => write!(f, "{}", e),
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<i32> for JsValue {
    fn from(n: i32) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<usize> for JsValue {
    fn from(n: usize) -> Self {
        JsValue::Number(n as f64)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(Rc::from(s))
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(Rc::from(s))
    }
}

impl From<JsObject> for JsValue {
    fn from(o: JsObject) -> Self {
        JsValue::Object(o)
    }
}

impl From<JsFunction> for JsValue {
    fn from(f: JsFunction) -> Self {
        JsValue::Function(f)
    }
}

impl From<ScriptError> for JsValue {
    fn from(e: ScriptError) -> Self {
        JsValue::Error(Rc::new(e))
    }
}

impl From<Vec<JsValue>> for JsValue {
    fn from(items: Vec<JsValue>) -> Self {
        JsValue::Array(Rc::new(items))
    }
}

impl From<serde_json::Value> for JsValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JsValue::Null,
            serde_json::Value::Bool(b) => JsValue::Bool(b),
            serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => JsValue::from(s),
            serde_json::Value::Array(items) => {
                JsValue::from(items.into_iter().map(JsValue::from).collect::<Vec<_>>())
            }
            serde_json::Value::Object(map) => {
                let object = JsObject::new();
                for (key, value) in map {
                    object.set(&key, JsValue::from(value));
                }
                JsValue::Object(object)
            }
        }
    }
}

/// Native data attached to a script object.
///
/// The discriminant identifies what kind of resource backs the object.
pub enum NativeBinding {
    /// Object is the script side of a handle wrap
    Handle(WrapId),
    /// Object is a byte buffer
    Buffer(BufferWrap),
}

impl fmt::Debug for NativeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeBinding::Handle(id) => write!(f, "Handle({})", id),
            NativeBinding::Buffer(buf) => write!(f, "Buffer(len={})", buf.len()),
        }
    }
}

struct ObjectInner {
    properties: RefCell<HashMap<String, JsValue>>,
    native: RefCell<Option<NativeBinding>>,
}

/// A script object. Clones share identity.
#[derive(Clone)]
pub struct JsObject(Rc<ObjectInner>);

impl JsObject {
    /// Create an empty object
    pub fn new() -> Self {
        Self(Rc::new(ObjectInner {
            properties: RefCell::new(HashMap::new()),
            native: RefCell::new(None),
        }))
    }

    /// Read a property, `undefined` if absent
    pub fn get(&self, key: &str) -> JsValue {
        self.0
            .properties
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Write a property
    pub fn set(&self, key: &str, value: impl Into<JsValue>) {
        self.0
            .properties
            .borrow_mut()
            .insert(key.to_string(), value.into());
    }

    /// Whether a property is present
    pub fn has(&self, key: &str) -> bool {
        self.0.properties.borrow().contains_key(key)
    }

    /// Read a property that must be a function
    pub fn get_function(&self, key: &str) -> Option<JsFunction> {
        self.get(key).as_function().cloned()
    }

    /// Attach native data. Fails, handing the binding back, if the object
    /// already carries one.
    pub fn set_native(&self, binding: NativeBinding) -> Result<(), NativeBinding> {
        let mut slot = self.0.native.borrow_mut();
        if slot.is_some() {
            return Err(binding);
        }
        *slot = Some(binding);
        Ok(())
    }

    /// Detach and return native data
    pub fn take_native(&self) -> Option<NativeBinding> {
        self.0.native.borrow_mut().take()
    }

    /// Whether native data is attached
    pub fn has_native(&self) -> bool {
        self.0.native.borrow().is_some()
    }

    /// Handle wrap bound to this object, if any
    pub fn handle_id(&self) -> Option<WrapId> {
        match &*self.0.native.borrow() {
            Some(NativeBinding::Handle(id)) => Some(*id),
            _ => None,
        }
    }

    /// Run `f` against the attached buffer, if this object is a buffer
    pub fn with_buffer<R>(&self, f: impl FnOnce(&BufferWrap) -> R) -> Option<R> {
        match &*self.0.native.borrow() {
            Some(NativeBinding::Buffer(buf)) => Some(f(buf)),
            _ => None,
        }
    }

    /// Run `f` against the attached buffer mutably
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut BufferWrap) -> R) -> Option<R> {
        match &mut *self.0.native.borrow_mut() {
            Some(NativeBinding::Buffer(buf)) => Some(f(buf)),
            _ => None,
        }
    }

    /// Identity comparison
    pub fn ptr_eq(a: &JsObject, b: &JsObject) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Non-owning reference, used to observe collection
    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Rc::downgrade(&self.0))
    }
}

impl Default for JsObject {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.0.properties.borrow().keys().cloned().collect();
        f.debug_struct("JsObject")
            .field("keys", &keys)
            .field("native", &*self.0.native.borrow())
            .finish()
    }
}

/// Weak reference to a script object
#[derive(Clone)]
pub struct WeakObject(Weak<ObjectInner>);

impl WeakObject {
    /// Upgrade back to a strong reference while the object is alive
    pub fn upgrade(&self) -> Option<JsObject> {
        self.0.upgrade().map(JsObject)
    }

    /// Whether the engine has collected the object
    pub fn is_collected(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// A callable script function
#[derive(Clone)]
pub struct JsFunction {
    name: Rc<str>,
    body: Rc<NativeFn>,
}

impl JsFunction {
    /// Wrap a closure as a script function
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&Runtime, &JsValue, &[JsValue]) -> CallResult + 'static,
    {
        Self {
            name: Rc::from(name),
            body: Rc::new(body),
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the function directly.
    ///
    /// This bypasses the callback protocol; native code calling into
    /// script from an event should use [`crate::callback::invoke_callback`].
    pub fn call(&self, rt: &Runtime, this: &JsValue, args: &[JsValue]) -> CallResult {
        (self.body)(rt, this, args)
    }

    /// Identity comparison
    pub fn ptr_eq(a: &JsFunction, b: &JsFunction) -> bool {
        Rc::ptr_eq(&a.body, &b.body)
    }
}

impl fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function: {}]", self.name)
    }
}
