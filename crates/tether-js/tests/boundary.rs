//! Boundary tests for tether-js
//!
//! Handle tracking, script results, error translation, termination and heap
//! exhaustion as seen from the host.

use anyhow::Result;
use std::thread;
use std::time::Duration;
use tether_js::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> Result<(Engine, Context)> {
    init_tracing();
    let engine = Engine::new()?;
    let ctx = engine.new_context(None, 1)?;
    Ok((engine, ctx))
}

// ============================================================================
// HANDLE REGISTRY
// ============================================================================

#[test]
fn test_ids_unique_and_retained_count() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let values = (0..50)
        .map(|n| ctx.number(n as f64))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut ids: Vec<u64> = values.iter().map(|v| v.id().get()).collect();
    assert!(ids.iter().all(|&id| id != 0));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
    assert_eq!(ctx.retained_count(), 50);

    for value in &values[..20] {
        value.release();
    }
    assert_eq!(ctx.retained_count(), 30);
    Ok(())
}

#[test]
fn test_double_release_is_isolated() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let first = ctx.string("first")?;
    let kept = ctx.string("kept")?;

    first.release();
    first.release();
    assert_eq!(ctx.retained_count(), 1);

    let later = ctx.string("later")?;
    assert_ne!(later.id(), first.id());
    assert_eq!(later.as_string()?, "later");
    assert_eq!(kept.as_string()?, "kept");
    assert!(matches!(first.as_string(), Err(EngineError::Released(_))));
    Ok(())
}

#[test]
fn test_dispose_clears_all() -> Result<()> {
    let (engine, ctx) = setup()?;
    let before = engine.heap_statistics()?.object_count;
    let objects = (0..200)
        .map(|_| ctx.run_script("({ payload: new Array(16).fill(0) })", "t.js"))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    assert_eq!(ctx.retained_count(), 200);

    ctx.dispose();
    engine.run_gc()?;
    assert_eq!(ctx.retained_count(), 0);
    assert!(engine.heap_statistics()?.object_count <= before + 10);
    assert!(objects.iter().all(|v| !v.is_object()));

    // Releasing after dispose is harmless
    objects[0].release();
    Ok(())
}

#[test]
fn test_teardown_after_operations() -> Result<()> {
    let (engine, ctx) = setup()?;
    let value = ctx.run_script("({ n: 1 })", "t.js")?;
    assert_eq!(value.get("n")?.to_number()?, 1.0);
    assert_eq!(engine.number(2.0)?.to_number()?, 2.0);

    ctx.dispose();
    engine.dispose();
    drop(value);
    drop(ctx);
    drop(engine);

    // Dropping without an explicit dispose frees the runtime as well
    let (engine, ctx) = setup()?;
    ctx.run_script("globalThis.kept = [1, 2, 3]", "t.js")?;
    drop(ctx);
    drop(engine);
    Ok(())
}

#[test]
fn test_values_outlive_other_contexts() -> Result<()> {
    let (engine, ctx) = setup()?;
    let other = engine.new_context(None, 2)?;
    let value = other.run_script("({ n: 5 })", "other.js")?;
    other.dispose();

    assert!(matches!(value.get("n"), Err(EngineError::ContextDisposed(_))));
    assert_eq!(ctx.run_script("2 + 3", "t.js")?.to_number()?, 5.0);
    Ok(())
}

// ============================================================================
// SCRIPTS AND ERRORS
// ============================================================================

#[test]
fn test_round_trip_value() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let result = ctx.run_script("1+1", "t.js")?;
    assert_eq!(result.to_number()?, 2.0);
    assert!(result.id().get() > 0);
    Ok(())
}

#[test]
fn test_exception_path() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let err = ctx.run_script("throw new Error('boom')", "t.js").unwrap_err();
    let js = err.js().expect("script error");

    assert!(js.message.contains("boom"));
    let location = js.location.as_deref().expect("location");
    let column = location.strip_prefix("t.js:1:").expect("line and column");
    assert!(!column.is_empty() && column.chars().all(|c| c.is_ascii_digit()), "location was {location}");
    assert!(js.stack.is_some());
    Ok(())
}

#[test]
fn test_location_names_defining_script() -> Result<()> {
    let (_engine, ctx) = setup()?;
    ctx.run_script("// helpers\n\nfunction lib() {\n  throw new Error('from lib');\n}", "lib.js")?;

    let err = ctx.run_script("lib()", "main.js").unwrap_err();
    let js = err.js().expect("script error");
    let location = js.location.as_deref().expect("location");
    assert!(location.starts_with("lib.js:4:"), "location was {location}");
    assert!(js.stack.as_deref().unwrap_or_default().contains("main.js"));
    Ok(())
}

#[test]
fn test_exception_in_nested_function() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let err = ctx
        .run_script("function inner() {\n  throw new TypeError('deep');\n}\ninner();", "deep.js")
        .unwrap_err();
    let js = err.js().expect("script error");
    assert!(js.message.starts_with("TypeError"));
    assert!(js.location.as_deref().unwrap_or_default().starts_with("deep.js:2"));
    Ok(())
}

#[test]
fn test_thrown_primitive() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let err = ctx.run_script("throw 'plain'", "t.js").unwrap_err();
    let js = err.js().expect("script error");
    assert_eq!(js.message, "plain");
    assert!(js.location.is_none());
    Ok(())
}

#[test]
fn test_syntax_error_path() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let err = ctx.run_script("function (", "t.js").unwrap_err();
    let js = err.js().expect("script error");
    assert!(!js.message.is_empty());
    assert!(js.message.contains("SyntaxError"));
    Ok(())
}

#[test]
fn test_error_serializes() -> Result<()> {
    let (_engine, ctx) = setup()?;
    let err = ctx.run_script("throw new Error('wire')", "t.js").unwrap_err();
    let json = serde_json::to_value(err.js().expect("script error"))?;
    assert!(json["message"].as_str().unwrap_or_default().contains("wire"));
    assert!(json.get("location").is_some());
    Ok(())
}

#[test]
fn test_state_survives_between_runs() -> Result<()> {
    let (_engine, ctx) = setup()?;
    ctx.run_script("var counter = 10;", "a.js")?;
    ctx.run_script("counter += 5;", "b.js")?;
    assert_eq!(ctx.run_script("counter", "c.js")?.to_number()?, 15.0);
    Ok(())
}

// ============================================================================
// TERMINATION AND RESOURCES
// ============================================================================

#[test]
fn test_terminate_from_another_thread() -> Result<()> {
    let (engine, ctx) = setup()?;
    let remote = engine.clone();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        remote.terminate_execution();
    });

    let err = ctx.run_script("while (true) {}", "loop.js").unwrap_err();
    killer.join().expect("killer thread");

    let js = err.js().expect("script error");
    assert_eq!(js.message, TERMINATED_MESSAGE);
    assert!(js.location.is_none());
    assert!(js.stack.is_none());

    assert!(!engine.is_execution_terminating());
    assert_eq!(ctx.run_script("1+1", "t.js")?.to_number()?, 2.0);
    Ok(())
}

#[test]
fn test_idle_termination_request_is_discarded() -> Result<()> {
    let (engine, ctx) = setup()?;
    engine.terminate_execution();
    assert_eq!(ctx.run_script("1+1", "t.js")?.to_number()?, 2.0);
    assert!(!engine.is_execution_terminating());
    Ok(())
}

#[test]
fn test_termination_is_not_catchable() -> Result<()> {
    let (engine, ctx) = setup()?;
    let remote = engine.clone();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.terminate_execution();
    });

    let err = ctx
        .run_script("for (;;) { try { while (true) {} } catch (e) {} }", "loop.js")
        .unwrap_err();
    killer.join().expect("killer thread");
    assert!(err.is_terminated());
    Ok(())
}

#[test]
fn test_heap_exhaustion_terminates_and_recovers() -> Result<()> {
    init_tracing();
    let limit = 8 * 1024 * 1024;
    let engine = Engine::with_config(EngineConfig::default().with_heap_limit(limit))?;
    let ctx = engine.new_context(None, 0)?;

    let err = ctx
        .run_script(
            "(() => { const chunks = []; while (true) { chunks.push(new Float64Array(1 << 17)); } })()",
            "hog.js",
        )
        .unwrap_err();
    assert!(err.is_terminated());
    assert!(!engine.is_execution_terminating());

    assert_eq!(ctx.run_script("[1, 2, 3].length", "t.js")?.to_number()?, 3.0);
    assert_eq!(engine.heap_statistics()?.heap_size_limit, (limit * 2) as u64);
    Ok(())
}

#[test]
fn test_engines_are_independent() -> Result<()> {
    init_tracing();
    let workers: Vec<_> = (0..4)
        .map(|n| {
            thread::spawn(move || -> Result<f64> {
                let engine = Engine::new()?;
                let ctx = engine.new_context(None, n)?;
                Ok(ctx.run_script(&format!("{n} * 10"), "t.js")?.to_number()?)
            })
        })
        .collect();

    for (n, worker) in workers.into_iter().enumerate() {
        let value = worker.join().expect("worker thread")?;
        assert_eq!(value, n as f64 * 10.0);
    }
    Ok(())
}

#[test]
fn test_shared_engine_serializes_threads() -> Result<()> {
    let (engine, ctx) = setup()?;
    ctx.run_script("var total = 0;", "t.js")?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ctx = ctx.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..25 {
                    ctx.run_script("total += 1;", "inc.js")?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread")?;
    }

    assert_eq!(ctx.run_script("total", "t.js")?.to_number()?, 100.0);
    drop(engine);
    Ok(())
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_config_round_trip() -> Result<()> {
    let config = EngineConfig::default()
        .with_heap_limit(32 * 1024 * 1024)
        .with_microtasks(MicrotaskPolicy::Explicit);
    let json = serde_json::to_string(&config)?;
    let back: EngineConfig = serde_json::from_str(&json)?;
    assert_eq!(back, config);

    let partial: EngineConfig = serde_json::from_str(r#"{ "heap_limit": 1024 }"#)?;
    assert_eq!(partial.heap_limit, Some(1024));
    assert_eq!(partial.microtasks, MicrotaskPolicy::Auto);
    Ok(())
}

#[test]
fn test_explicit_microtasks() -> Result<()> {
    init_tracing();
    let engine = Engine::with_config(EngineConfig::default().with_microtasks(MicrotaskPolicy::Explicit))?;
    let ctx = engine.new_context(None, 0)?;

    ctx.run_script("Promise.resolve().then(() => { globalThis.ran = true; })", "t.js")?;
    assert_eq!(ctx.run_script("typeof ran", "t.js")?.as_string()?, "undefined");

    engine.perform_microtask_checkpoint()?;
    assert!(ctx.run_script("ran", "t.js")?.to_boolean()?);
    Ok(())
}
