//! Restricted Lua environment for plugin execution
//!
//! Plugins are trusted code, but they must not be able to take the host down
//! with them: process exit, arbitrary code loading and native modules are
//! removed, memory is capped, and a hook aborts scripts past their deadline.

use mlua::{ FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua, Table, Value, VmState };
use std::time::Instant;

use crate::plugins::api::{
    register_cache_api,
    register_context,
    register_env_api,
    register_exec_api,
    register_http_api,
    register_logging_api,
};
use crate::plugins::entrypoint::InvocationContext;
use crate::plugins::registry::PluginPermissions;

const MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Instructions between deadline checks
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

const REMOVED_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "debug"];
const REMOVED_OS_FUNCTIONS: &[&str] = &["exit", "execute", "remove", "rename", "tmpname", "setlocale"];

/// Create a secure Lua state for one plugin invocation
///
/// This function:
/// - Removes host-threatening functions (os.exit, load, native modules, ...)
/// - Keeps `io` only with the filesystem permission
/// - Sets the memory limit
/// - Registers the host APIs allowed by the plugin's permissions
pub fn create_secure_lua_state(
    ctx: &InvocationContext,
    permissions: &PluginPermissions
) -> mlua::Result<Lua> {
    let lua = Lua::new();
    let globals = lua.globals();

    for name in REMOVED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }

    if let Ok(os) = globals.get::<Table>("os") {
        for name in REMOVED_OS_FUNCTIONS {
            os.set(*name, Value::Nil)?;
        }
    }

    if !permissions.filesystem {
        globals.set("io", Value::Nil)?;
    }

    // Restrict package module to prevent loading native libraries
    if let Ok(package) = globals.get::<Table>("package") {
        package.set("loadlib", Value::Nil)?;
        package.set("cpath", Value::Nil)?;
    }

    lua.set_memory_limit(MEMORY_LIMIT)?;

    register_logging_api(&lua, &ctx.plugin)?;
    register_http_api(&lua, permissions)?;
    register_exec_api(&lua, permissions)?;
    register_cache_api(&lua, &ctx.plugin, &ctx.cache)?;
    register_env_api(&lua, &ctx.env)?;
    register_context(&lua, ctx)?;

    // print() goes to the logger, stdout belongs to the status line
    let log_info = globals.get::<mlua::Function>("log_info")?;
    globals.set("print", log_info)?;

    Ok(lua)
}

/// Message of the error raised into a script that ran past its deadline
pub const DEADLINE_EXCEEDED: &str = "plugin deadline exceeded";

/// Call `function` on its own coroutine, aborting it once `deadline` passes
///
/// Hooks belong to a single Lua thread, so the hook is set on the coroutine
/// that runs the code rather than on the main state.
pub async fn call_with_deadline<R: FromLuaMulti>(
    lua: &Lua,
    function: Function,
    args: impl IntoLuaMulti,
    deadline: Instant
) -> mlua::Result<R> {
    let thread = lua.create_thread(function)?;
    let triggers = HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL);
    thread.set_hook(triggers, move |_lua, _debug| {
        if Instant::now() >= deadline {
            Err(mlua::Error::runtime(DEADLINE_EXCEEDED))
        } else {
            Ok(VmState::Continue)
        }
    })?;
    thread.into_async::<R>(args)?.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::ResultCache;
    use std::time::Duration;

    fn context() -> InvocationContext {
        InvocationContext::new("test", ResultCache::in_memory(false))
    }

    fn is_nil(lua: &Lua, expr: &str) -> bool {
        lua.load(format!("return {} == nil", expr)).eval::<bool>().unwrap()
    }

    #[test]
    fn test_sandbox_blocks_dangerous_functions() {
        let lua = create_secure_lua_state(&context(), &PluginPermissions::default()).unwrap();

        for expr in ["load", "loadfile", "dofile", "debug", "io", "os.exit", "os.execute", "package.loadlib"] {
            assert!(is_nil(&lua, expr), "{expr} should be removed");
        }

        // Harmless os functions stay available
        assert!(!is_nil(&lua, "os.time"));
        assert!(!is_nil(&lua, "os.date"));
    }

    #[test]
    fn test_sandbox_respects_permissions() {
        let restricted = create_secure_lua_state(&context(), &PluginPermissions::default()).unwrap();
        assert!(is_nil(&restricted, "http_get"));
        assert!(is_nil(&restricted, "exec"));

        let permissions = PluginPermissions {
            network: true,
            exec: true,
            filesystem: true,
            ..Default::default()
        };
        let lua = create_secure_lua_state(&context(), &permissions).unwrap();
        assert!(!is_nil(&lua, "http_get"));
        assert!(!is_nil(&lua, "exec"));
        assert!(!is_nil(&lua, "io"));
    }

    #[test]
    fn test_sandbox_provides_safe_apis() {
        let lua = create_secure_lua_state(&context(), &PluginPermissions::default()).unwrap();

        for expr in ["log_info", "log_warn", "log_error", "print", "cache_get", "cache_set", "env_get", "config", "plugin"] {
            assert!(!is_nil(&lua, expr), "{expr} should be available");
        }
    }

    #[tokio::test]
    async fn test_deadline_interrupts_runaway_loop_on_single_thread() {
        let lua = create_secure_lua_state(&context(), &PluginPermissions::default()).unwrap();
        let spin = lua.load("while true do end").into_function().unwrap();

        let started = Instant::now();
        let err = call_with_deadline::<()>(&lua, spin, (), started + Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(err.to_string().contains(DEADLINE_EXCEEDED), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_async_host_calls_work_under_deadline() {
        let lua = create_secure_lua_state(&context(), &PluginPermissions::default()).unwrap();
        let nap = lua
            .create_async_function(|_lua, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms * 2)
            })
            .unwrap();
        lua.globals().set("nap", nap).unwrap();

        let function = lua.load("return nap(10) + 1").into_function().unwrap();
        let value: u64 = call_with_deadline(&lua, function, (), Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, 21);
    }
}
