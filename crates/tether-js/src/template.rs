//! Templates
//!
//! Blueprints that can be stamped into any context of their engine. A
//! function template carries only the host callback reference; the host
//! registry decides what a call does.

use std::sync::Arc;

use rquickjs::{Function, Object, Value as JsValue};

use crate::bridge;
use crate::context::Context;
use crate::engine::{Engine, EngineShared};
use crate::error::{EngineError, Result};
use crate::scope::{self, EntryScope};
use crate::value::Value;

/// Blueprint of a host-backed function
#[derive(Clone)]
pub struct FunctionTemplate {
    shared: Arc<EngineShared>,
    callback_ref: i64,
}

impl FunctionTemplate {
    pub fn new(engine: &Engine, callback_ref: i64) -> Self {
        Self {
            shared: engine.shared.clone(),
            callback_ref,
        }
    }

    pub fn callback_ref(&self) -> i64 {
        self.callback_ref
    }

    /// Instantiate the function in `context`.
    pub fn get_function(&self, context: &Context) -> Result<Value> {
        check_engine(&self.shared, context)?;
        scope::enter(context.shared(), context.id(), |scope| {
            let function = self.instantiate(scope)?;
            scope.track(function.into_value())
        })
    }

    fn instantiate<'js>(&self, scope: &EntryScope<'js>) -> Result<Function<'js>> {
        scope.trap(bridge::new_trampoline(scope.ctx(), scope.shared(), self.callback_ref))
    }
}

/// Property of an [`ObjectTemplate`]
#[derive(Clone)]
pub enum TemplateEntry {
    Value(Value),
    Function(FunctionTemplate),
    Object(ObjectTemplate),
    /// Property backed by host getter and setter calls. Without a setter the
    /// property is read-only.
    Accessor {
        getter: Option<FunctionTemplate>,
        setter: Option<FunctionTemplate>,
    },
}

impl From<Value> for TemplateEntry {
    fn from(value: Value) -> Self {
        TemplateEntry::Value(value)
    }
}

impl From<FunctionTemplate> for TemplateEntry {
    fn from(template: FunctionTemplate) -> Self {
        TemplateEntry::Function(template)
    }
}

impl From<ObjectTemplate> for TemplateEntry {
    fn from(template: ObjectTemplate) -> Self {
        TemplateEntry::Object(template)
    }
}

/// Blueprint of an object, also used to seed a context's global
#[derive(Clone)]
pub struct ObjectTemplate {
    shared: Arc<EngineShared>,
    entries: Vec<(String, TemplateEntry)>,
    call_handler: Option<FunctionTemplate>,
}

impl ObjectTemplate {
    pub fn new(engine: &Engine) -> Self {
        Self {
            shared: engine.shared.clone(),
            entries: Vec::new(),
            call_handler: None,
        }
    }

    /// Add or replace a property.
    pub fn set(&mut self, name: impl Into<String>, entry: impl Into<TemplateEntry>) {
        let name = name.into();
        let entry = entry.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = entry,
            None => self.entries.push((name, entry)),
        }
    }

    /// Add or replace an accessor property.
    pub fn set_accessor(
        &mut self,
        name: impl Into<String>,
        getter: Option<FunctionTemplate>,
        setter: Option<FunctionTemplate>,
    ) {
        self.set(name, TemplateEntry::Accessor { getter, setter });
    }

    /// Make instances callable, forwarding calls to `handler`. Instances then
    /// report `typeof` as "function". Ignored when seeding a context's global.
    pub fn set_call_handler(&mut self, handler: FunctionTemplate) {
        self.call_handler = Some(handler);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create a fresh object from the template in `context`.
    pub fn new_instance(&self, context: &Context) -> Result<Value> {
        check_engine(&self.shared, context)?;
        scope::enter(context.shared(), context.id(), |scope| {
            if let Some(handler) = &self.call_handler {
                let function = handler.instantiate(scope)?;
                self.populate(scope, &function)?;
                return scope.track(function.into_value());
            }
            let object = scope.trap(Object::new(scope.ctx().clone()))?;
            self.populate(scope, &object)?;
            scope.track(object.into_value())
        })
    }

    pub(crate) fn apply_to_global(&self, context: &Context) -> Result<()> {
        check_engine(&self.shared, context)?;
        scope::enter(context.shared(), context.id(), |scope| {
            self.populate(scope, &scope.ctx().globals())
        })
    }

    fn populate<'js>(&self, scope: &EntryScope<'js>, target: &Object<'js>) -> Result<()> {
        for (name, entry) in &self.entries {
            let value = match entry {
                TemplateEntry::Value(value) => scope.restore(value)?,
                TemplateEntry::Function(template) => template.instantiate(scope)?.into_value(),
                TemplateEntry::Object(template) => {
                    let object = scope.trap(Object::new(scope.ctx().clone()))?;
                    template.populate(scope, &object)?;
                    object.into_value()
                }
                TemplateEntry::Accessor { getter, setter } => {
                    define_accessor(scope, target, name, getter.as_ref(), setter.as_ref())?;
                    continue;
                }
            };
            scope.trap(target.set(name.as_str(), value))?;
        }
        Ok(())
    }
}

fn define_accessor<'js>(
    scope: &EntryScope<'js>,
    target: &Object<'js>,
    name: &str,
    getter: Option<&FunctionTemplate>,
    setter: Option<&FunctionTemplate>,
) -> Result<()> {
    let descriptor = scope.trap(Object::new(scope.ctx().clone()))?;
    if let Some(getter) = getter {
        scope.trap(descriptor.set("get", getter.instantiate(scope)?))?;
    }
    if let Some(setter) = setter {
        scope.trap(descriptor.set("set", setter.instantiate(scope)?))?;
    }
    scope.trap(descriptor.set("configurable", true))?;
    scope.trap(descriptor.set("enumerable", true))?;

    let object: Object = scope.trap(scope.ctx().globals().get("Object"))?;
    let define: Function = scope.trap(object.get("defineProperty"))?;
    scope.trap(define.call::<_, JsValue>((target.clone(), name, descriptor)))?;
    Ok(())
}

fn check_engine(shared: &Arc<EngineShared>, context: &Context) -> Result<()> {
    if Arc::ptr_eq(shared, context.shared()) {
        Ok(())
    } else {
        Err(EngineError::ForeignEngine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallbackTable;

    #[test]
    fn test_object_template_seeds_global() {
        let engine = Engine::new().unwrap();
        let table = Arc::new(CallbackTable::new());
        let greet = table.register(|info| {
            let name = info.args[0].as_string()?;
            Ok(Some(info.context.string(&format!("hello {name}"))?))
        });
        engine.set_host(table);

        let mut config = ObjectTemplate::new(&engine);
        config.set("level", engine.number(3.0).unwrap());
        let mut global = ObjectTemplate::new(&engine);
        global.set("greet", engine.new_function_template(greet));
        global.set("config", config);

        let ctx = Context::new(&engine, Some(&global), 0).unwrap();
        let result = ctx.run_script("greet('js') + ' ' + config.level", "t.js").unwrap();
        assert_eq!(result.as_string().unwrap(), "hello js 3");
    }

    #[test]
    fn test_accessor_properties() {
        let engine = Engine::new().unwrap();
        let table = Arc::new(CallbackTable::new());
        let level = Arc::new(parking_lot::Mutex::new(1.0));
        let getter = table.register({
            let level = level.clone();
            move |info| Ok(Some(info.context.number(*level.lock())?))
        });
        let setter = table.register({
            let level = level.clone();
            move |info| {
                *level.lock() = info.args[0].to_number()?;
                Ok(None)
            }
        });
        engine.set_host(table);

        let mut global = ObjectTemplate::new(&engine);
        global.set_accessor(
            "level",
            Some(engine.new_function_template(getter)),
            Some(engine.new_function_template(setter)),
        );
        global.set_accessor("fixed", Some(engine.new_function_template(getter)), None);
        let ctx = Context::new(&engine, Some(&global), 0).unwrap();

        let result = ctx.run_script("level = 4; level * 10", "t.js").unwrap();
        assert_eq!(result.to_number().unwrap(), 40.0);
        assert_eq!(*level.lock(), 4.0);

        let readonly = ctx
            .run_script("Object.getOwnPropertyDescriptor(globalThis, 'fixed').set === undefined", "t.js")
            .unwrap();
        assert!(readonly.to_boolean().unwrap());
    }

    #[test]
    fn test_call_handler_makes_instances_callable() {
        let engine = Engine::new().unwrap();
        let table = Arc::new(CallbackTable::new());
        let double = table.register(|info| {
            let n = info.args[0].to_number()?;
            Ok(Some(info.context.number(n * 2.0)?))
        });
        engine.set_host(table);

        let ctx = Context::new(&engine, None, 0).unwrap();
        let mut template = ObjectTemplate::new(&engine);
        template.set("unit", engine.string("px").unwrap());
        template.set_call_handler(engine.new_function_template(double));

        let instance = template.new_instance(&ctx).unwrap();
        assert!(instance.is_function());
        ctx.global().unwrap().set("scale", &instance).unwrap();
        let result = ctx.run_script("scale(8) + scale.unit", "t.js").unwrap();
        assert_eq!(result.as_string().unwrap(), "16px");
    }

    #[test]
    fn test_new_instance_is_fresh() {
        let engine = Engine::new().unwrap();
        let ctx = Context::new(&engine, None, 0).unwrap();
        let mut template = ObjectTemplate::new(&engine);
        template.set("n", engine.number(1.0).unwrap());
        template.set("n", engine.number(2.0).unwrap());
        assert_eq!(template.len(), 1);

        let a = template.new_instance(&ctx).unwrap();
        let b = template.new_instance(&ctx).unwrap();
        let one = ctx.number(1.0).unwrap();
        a.set("n", &one).unwrap();
        assert_eq!(b.get("n").unwrap().to_number().unwrap(), 2.0);
    }
}
