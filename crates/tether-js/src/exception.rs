//! Exception Translation
//!
//! Converts a pending engine exception into a [`JsError`] with message, throw
//! site and stack. Termination is checked before anything else since the
//! exception QuickJS raises for an interrupt carries no useful detail.

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Object, Value as JsValue};

use crate::engine::EngineShared;
use crate::error::{EngineError, JsError};

pub(crate) fn translate_error(shared: &EngineShared, ctx: &Ctx<'_>, err: rquickjs::Error) -> EngineError {
    match err {
        rquickjs::Error::Exception => translate(shared, ctx.catch()).into(),
        rquickjs::Error::Allocation => {
            shared.near_heap_limit();
            JsError::terminated().into()
        }
        rquickjs::Error::FromJs { from, to, .. } => EngineError::Type {
            expected: to,
            found: from.to_string(),
        },
        _ if shared.is_terminating() => JsError::terminated().into(),
        other => JsError::new(other.to_string()).into(),
    }
}

/// Build the structured error for a caught value.
pub(crate) fn translate(shared: &EngineShared, thrown: JsValue<'_>) -> JsError {
    if shared.is_terminating() {
        return JsError::terminated();
    }
    if is_out_of_memory(&thrown) {
        tracing::warn!("Script exhausted the heap");
        shared.near_heap_limit();
        return JsError::terminated();
    }

    let message = describe(&thrown);
    let stack = thrown
        .as_object()
        .and_then(|obj| string_property(obj, "stack"))
        .filter(|stack| !stack.trim().is_empty());
    let location = stack.as_deref().and_then(throw_site);

    JsError {
        message,
        location,
        stack,
    }
}

/// QuickJS reports a failed allocation as an `InternalError` whose message is
/// exactly "out of memory".
fn is_out_of_memory(thrown: &JsValue<'_>) -> bool {
    let Some(error) = thrown.as_object().filter(|_| thrown.is_error()) else {
        return false;
    };
    string_property(error, "name").as_deref() == Some("InternalError")
        && string_property(error, "message").as_deref() == Some("out of memory")
}

fn string_property(object: &Object<'_>, key: &str) -> Option<String> {
    match object.get::<_, Option<String>>(key) {
        Ok(value) => value,
        Err(err) => {
            if matches!(err, rquickjs::Error::Exception) {
                object.ctx().catch();
            }
            None
        }
    }
}

fn describe(thrown: &JsValue<'_>) -> String {
    match thrown.get::<Coerced<String>>() {
        Ok(Coerced(text)) => text,
        Err(err) => {
            if matches!(err, rquickjs::Error::Exception) {
                thrown.ctx().catch();
            }
            String::from("uncaught exception")
        }
    }
}

/// First frame of `stack` that names a source position, as `file:line[:column]`.
fn throw_site(stack: &str) -> Option<String> {
    stack
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .find_map(|frame| {
            let site = match frame.rfind('(') {
                Some(open) if frame.ends_with(')') => &frame[open + 1..frame.len() - 1],
                _ => frame,
            };
            parse_site(site)
        })
}

fn parse_site(site: &str) -> Option<String> {
    let (rest, last) = site.rsplit_once(':')?;
    let last: u32 = last.parse().ok()?;

    let (file, line, column) = match rest.rsplit_once(':') {
        Some((file, line)) => match line.parse::<u32>() {
            Ok(line) => (file, line, Some(last)),
            Err(_) => (rest, last, None),
        },
        None => (rest, last, None),
    };
    if file.is_empty() {
        return None;
    }

    Some(match column {
        Some(column) => format!("{file}:{line}:{column}"),
        None => format!("{file}:{line}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_frame() {
        let stack = "    at boom (lib.js:3:11)\n    at <eval> (main.js:1:1)\n";
        assert_eq!(throw_site(stack).as_deref(), Some("lib.js:3:11"));
    }

    #[test]
    fn test_frame_without_parens_or_column() {
        assert_eq!(throw_site("    at a.js:4\n").as_deref(), Some("a.js:4"));
        assert_eq!(throw_site("    at mod.js:2:9\n").as_deref(), Some("mod.js:2:9"));
    }

    #[test]
    fn test_native_frames_are_skipped() {
        let stack = "    at map (native)\n    at <eval> (t.js:2:3)\n";
        assert_eq!(throw_site(stack).as_deref(), Some("t.js:2:3"));
        assert_eq!(throw_site("    at map (native)\n"), None);
        assert_eq!(throw_site(""), None);
    }

    #[test]
    fn test_user_error_mentioning_memory_is_not_oom() {
        let engine = crate::Engine::new().unwrap();
        let ctx = engine.new_context(None, 0).unwrap();
        let err = ctx.run_script("throw new Error('cache out of memory')", "cache.js").unwrap_err();
        let js = err.js().unwrap();
        assert_eq!(js.message, "Error: cache out of memory");
        assert!(js.location.as_deref().unwrap_or_default().starts_with("cache.js:1:"));
        assert!(!err.is_terminated());

        let err = ctx.run_script("throw new RangeError('out of memory')", "cache.js").unwrap_err();
        assert!(!err.is_terminated());
    }
}
