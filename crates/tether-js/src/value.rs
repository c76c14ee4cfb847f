//! Value Handles
//!
//! A [`Value`] names one tracked engine value as an (engine, context, id)
//! triple. Holding a handle is free from any thread; every operation on it
//! takes the engine lock and enters the value's own context.

use std::fmt;
use std::sync::Arc;

use rquickjs::convert::Coerced;
use rquickjs::function::{Rest, This};
use rquickjs::{Array, Function, Object, Type, Value as JsValue};
use serde::Serialize;

use crate::engine::{ContextId, EngineShared};
use crate::error::{EngineError, Result};
use crate::registry::ValueId;
use crate::scope::{self, EntryScope};

/// Settlement state of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Handle to a tracked engine value
#[derive(Clone)]
pub struct Value {
    shared: Arc<EngineShared>,
    context: ContextId,
    id: ValueId,
}

macro_rules! predicates {
    ($($(#[$meta:meta])* $name:ident => $check:ident;)*) => {
        $(
            $(#[$meta])*
            pub fn $name(&self) -> bool {
                self.inspect(|value| value.$check())
            }
        )*
    };
}

impl Value {
    pub(crate) fn from_parts(shared: Arc<EngineShared>, context: ContextId, id: ValueId) -> Self {
        Self { shared, context, id }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Drop the engine reference. Releasing again, or releasing after the
    /// context was disposed, does nothing.
    pub fn release(&self) {
        let cell = self.shared.lock();
        let rooted = cell
            .state
            .borrow_mut()
            .contexts
            .get_mut(&self.context)
            .and_then(|slot| slot.values.release(self.id));
        drop(rooted);
    }

    /// Run `f` on the dereferenced value inside its context.
    fn with_value<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(&EntryScope<'js>, JsValue<'js>) -> Result<R> + Send,
        R: Send,
    {
        scope::enter(&self.shared, self.context, |scope| {
            let value = scope.restore(self)?;
            f(scope, value)
        })
    }

    fn inspect(&self, check: impl for<'js> Fn(&JsValue<'js>) -> bool + Send) -> bool {
        self.with_value(move |_, value| Ok(check(&value))).unwrap_or(false)
    }

    predicates! {
        is_undefined => is_undefined;
        is_null => is_null;
        is_boolean => is_bool;
        is_number => is_number;
        is_string => is_string;
        is_symbol => is_symbol;
        is_object => is_object;
        is_function => is_function;
        is_array => is_array;
        is_promise => is_promise;
        /// An `Error` instance
        is_error => is_error;
    }

    /// `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        self.inspect(|value| value.is_null() || value.is_undefined())
    }

    pub fn is_bigint(&self) -> bool {
        self.inspect(|value| value.type_of() == Type::BigInt)
    }

    /// Numeric value after `ToNumber`
    pub fn to_number(&self) -> Result<f64> {
        self.with_value(|scope, value| Ok(scope.trap(value.get::<Coerced<f64>>())?.0))
    }

    pub fn to_int32(&self) -> Result<i32> {
        self.with_value(|scope, value| Ok(scope.trap(value.get::<Coerced<i32>>())?.0))
    }

    pub fn to_boolean(&self) -> Result<bool> {
        self.with_value(|scope, value| Ok(scope.trap(value.get::<Coerced<bool>>())?.0))
    }

    /// String value after `ToString`
    pub fn to_display_string(&self) -> Result<String> {
        self.with_value(|scope, value| Ok(scope.trap(value.get::<Coerced<String>>())?.0))
    }

    /// The string contents. Fails for non-strings.
    pub fn as_string(&self) -> Result<String> {
        self.with_value(|scope, value| match value.as_string() {
            Some(string) => scope.trap(string.to_string()),
            None => Err(type_error("string", &value)),
        })
    }

    /// `JSON.stringify` output, `None` when the value has no JSON form.
    pub fn to_json(&self) -> Result<Option<String>> {
        self.with_value(|scope, value| {
            let json = scope.trap(scope.ctx().json_stringify(value))?;
            json.map(|json| scope.trap(json.to_string())).transpose()
        })
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.with_value(|scope, value| {
            let object = object_of(&value)?;
            let property = scope.trap(object.get::<_, JsValue>(key))?;
            scope.track(property)
        })
    }

    pub fn set(&self, key: &str, property: &Value) -> Result<()> {
        self.with_value(|scope, value| {
            let object = object_of(&value)?;
            let property = scope.restore(property)?;
            scope.trap(object.set(key, property))
        })
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        self.with_value(|scope, value| scope.trap(object_of(&value)?.contains_key(key)))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.with_value(|scope, value| scope.trap(object_of(&value)?.remove(key)))
    }

    pub fn get_index(&self, index: u32) -> Result<Value> {
        self.with_value(|scope, value| {
            let property = scope.trap(object_of(&value)?.get::<_, JsValue>(index))?;
            scope.track(property)
        })
    }

    pub fn set_index(&self, index: u32, property: &Value) -> Result<()> {
        self.with_value(|scope, value| {
            let object = object_of(&value)?;
            let property = scope.restore(property)?;
            scope.trap(object.set(index, property))
        })
    }

    /// Call this function with `this` (undefined when `None`) and `args`.
    pub fn call(&self, this: Option<&Value>, args: &[&Value]) -> Result<Value> {
        self.with_value(|scope, value| {
            let function = function_of(&value)?;
            let this = match this {
                Some(this) => scope.restore(this)?,
                None => JsValue::new_undefined(scope.ctx().clone()),
            };
            let args = args
                .iter()
                .map(|arg| scope.restore(arg))
                .collect::<Result<Vec<_>>>()?;
            let result = scope.trap(function.call::<_, JsValue>((This(this), Rest(args))))?;
            scope.track(result)
        })
    }

    /// `new this(...args)`
    pub fn construct(&self, args: &[&Value]) -> Result<Value> {
        self.with_value(|scope, value| {
            function_of(&value)?;
            let list = scope.trap(Array::new(scope.ctx().clone()))?;
            for (index, arg) in args.iter().enumerate() {
                scope.trap(list.set(index, scope.restore(arg)?))?;
            }
            let reflect: Object = scope.trap(scope.ctx().globals().get("Reflect"))?;
            let construct: Function = scope.trap(reflect.get("construct"))?;
            let result = scope.trap(construct.call::<_, JsValue>((value, list)))?;
            scope.track(result)
        })
    }

    pub fn promise_state(&self) -> Result<PromiseState> {
        self.with_value(|scope, value| {
            let promise = value
                .clone()
                .into_promise()
                .ok_or_else(|| type_error("promise", &value))?;
            Ok(match promise.result::<JsValue>() {
                None => PromiseState::Pending,
                Some(Ok(_)) => PromiseState::Fulfilled,
                Some(Err(_)) => {
                    scope.ctx().catch();
                    PromiseState::Rejected
                }
            })
        })
    }

    /// Fulfillment value or rejection reason. Fails while pending.
    pub fn promise_result(&self) -> Result<Value> {
        self.with_value(|scope, value| {
            let promise = value
                .clone()
                .into_promise()
                .ok_or_else(|| type_error("promise", &value))?;
            match promise.result::<JsValue>() {
                None => Err(EngineError::Type {
                    expected: "settled promise",
                    found: String::from("pending promise"),
                }),
                Some(Ok(result)) => scope.track(result),
                Some(Err(rquickjs::Error::Exception)) => scope.track(scope.ctx().catch()),
                Some(Err(err)) => scope.trap(Err(err)),
            }
        })
    }

    /// `promise.then(on_fulfilled, on_rejected)`
    pub fn then(&self, on_fulfilled: &Value, on_rejected: Option<&Value>) -> Result<Value> {
        self.with_value(|scope, value| {
            let then: Function = scope.trap(promise_object(&value)?.get("then"))?;
            let on_fulfilled = scope.restore(on_fulfilled)?;
            let result = match on_rejected {
                Some(on_rejected) => {
                    let on_rejected = scope.restore(on_rejected)?;
                    then.call::<_, JsValue>((This(value), on_fulfilled, on_rejected))
                }
                None => then.call::<_, JsValue>((This(value), on_fulfilled)),
            };
            let chained = scope.trap(result)?;
            scope.track(chained)
        })
    }

    /// `promise.catch(on_rejected)`
    pub fn catch(&self, on_rejected: &Value) -> Result<Value> {
        self.with_value(|scope, value| {
            let catch: Function = scope.trap(promise_object(&value)?.get("catch"))?;
            let on_rejected = scope.restore(on_rejected)?;
            let chained = scope.trap(catch.call::<_, JsValue>((This(value), on_rejected)))?;
            scope.track(chained)
        })
    }
}

fn type_error(expected: &'static str, value: &JsValue<'_>) -> EngineError {
    EngineError::Type {
        expected,
        found: format!("{:?}", value.type_of()),
    }
}

fn object_of<'js>(value: &JsValue<'js>) -> Result<Object<'js>> {
    value
        .clone()
        .into_object()
        .ok_or_else(|| type_error("object", value))
}

fn promise_object<'js>(value: &JsValue<'js>) -> Result<Object<'js>> {
    if !value.is_promise() {
        return Err(type_error("promise", value));
    }
    object_of(value)
}

fn function_of<'js>(value: &JsValue<'js>) -> Result<Function<'js>> {
    value
        .clone()
        .into_function()
        .ok_or_else(|| type_error("function", value))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.context == other.context && self.id == other.id
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("context", &self.context.get())
            .field("id", &self.id.get())
            .finish()
    }
}
