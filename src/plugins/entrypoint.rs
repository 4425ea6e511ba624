//! The plugin contract: a no-argument entrypoint returning placeholders
//!
//! Lua units are executed in a fresh, restricted state per invocation (see
//! [`crate::plugins::sandbox`]). Built-in plugins and test doubles implement
//! [`Entrypoint`] directly.

use anyhow::Context;
use async_trait::async_trait;
use mlua::{ Function, Table };
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{ Duration, Instant };

use crate::engine::cache::ResultCache;
use crate::engine::result::Placeholders;
use crate::plugins::registry::PluginPermissions;
use crate::plugins::sandbox::{ call_with_deadline, create_secure_lua_state };

/// Everything an entrypoint may use during one invocation
#[derive(Clone)]
pub struct InvocationContext {
    pub plugin: String,
    pub version: String,
    /// The plugin's configuration section, engine-reserved keys removed
    pub settings: toml::Table,
    pub cache: ResultCache,
    /// Environment variables this plugin is allowed to read
    pub env: HashMap<String, String>,
    /// Instant after which the engine has abandoned this invocation
    pub deadline: Instant,
}

impl InvocationContext {
    pub fn new(plugin: impl Into<String>, cache: ResultCache) -> Self {
        Self {
            plugin: plugin.into(),
            version: String::new(),
            settings: toml::Table::new(),
            cache,
            env: HashMap::new(),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key)?.as_str()
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key)?.as_bool()
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings
            .get(key)?
            .as_integer()
            .and_then(|value| u64::try_from(value).ok())
    }
}

#[async_trait]
pub trait Entrypoint: Send + Sync {
    /// Produce this invocation's placeholders. Any error becomes a
    /// `Failed` result at the execution boundary.
    async fn invoke(&self, ctx: InvocationContext) -> anyhow::Result<Placeholders>;

    /// Help text computed by the plugin itself, when metadata has none
    async fn help(&self, _ctx: InvocationContext) -> Option<String> {
        None
    }
}

/// Entrypoint backed by a Lua script defining `register()`
pub struct LuaEntrypoint {
    path: PathBuf,
    code: Arc<str>,
    permissions: PluginPermissions,
}

impl LuaEntrypoint {
    pub fn new(path: PathBuf, code: impl Into<Arc<str>>, permissions: PluginPermissions) -> Self {
        Self {
            path,
            code: code.into(),
            permissions,
        }
    }

    fn chunk_name(&self) -> String {
        format!("@{}", self.path.display())
    }

    /// Build a sandboxed state and run the script's top level
    async fn prepare(&self, ctx: &InvocationContext) -> anyhow::Result<mlua::Lua> {
        let lua = create_secure_lua_state(ctx, &self.permissions).context(
            "Failed to create Lua state"
        )?;
        let chunk = lua
            .load(&*self.code)
            .set_name(self.chunk_name())
            .into_function()
            .context("Failed to compile plugin code")?;

        call_with_deadline::<()>(&lua, chunk, (), ctx.deadline).await.context(
            "Failed to execute plugin code"
        )?;

        Ok(lua)
    }
}

#[async_trait]
impl Entrypoint for LuaEntrypoint {
    async fn invoke(&self, ctx: InvocationContext) -> anyhow::Result<Placeholders> {
        let lua = self.prepare(&ctx).await?;

        let register: Function = lua
            .globals()
            .get("register")
            .map_err(|_| anyhow::anyhow!("Plugin must define a register() function"))?;

        let table: Table = call_with_deadline(&lua, register, (), ctx.deadline).await.context(
            "register() failed"
        )?;

        let mut placeholders = Placeholders::new();
        for pair in table.pairs::<String, String>() {
            let (key, value) = pair.context("register() must return a table of strings")?;
            placeholders.insert(key, value);
        }

        Ok(placeholders)
    }

    async fn help(&self, ctx: InvocationContext) -> Option<String> {
        let lua = self.prepare(&ctx).await.ok()?;
        let get_help: Function = lua.globals().get("get_help").ok()?;
        call_with_deadline::<String>(&lua, get_help, (), ctx.deadline).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(plugin: &str) -> InvocationContext {
        InvocationContext::new(plugin, ResultCache::in_memory(false))
    }

    fn lua(code: &str) -> LuaEntrypoint {
        LuaEntrypoint::new(PathBuf::from("test.lua"), code, PluginPermissions::default())
    }

    #[tokio::test]
    async fn test_register_returns_placeholders() {
        let entry = lua(r#"
function register()
    return { cpu = "42%", load = 1.5, cores = 8 }
end
"#);
        let placeholders = entry.invoke(context("cpu")).await.unwrap();
        assert_eq!(placeholders["cpu"], "42%");
        assert_eq!(placeholders["load"], "1.5");
        assert_eq!(placeholders["cores"], "8");
    }

    #[tokio::test]
    async fn test_missing_register_is_an_error() {
        let entry = lua("local x = 1");
        let err = entry.invoke(context("x")).await.unwrap_err();
        assert!(err.to_string().contains("register()"));
    }

    #[tokio::test]
    async fn test_raised_error_is_contained() {
        let entry = lua(r#"function register() error("no battery") end"#);
        let err = entry.invoke(context("battery")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("no battery"));
    }

    #[tokio::test]
    async fn test_settings_and_plugin_globals() {
        let entry = lua(r#"
function register()
    return { greeting = config.greeting .. " from " .. plugin.name }
end
"#);
        let mut ctx = context("hello");
        ctx.settings.insert("greeting".into(), toml::Value::String("hi".into()));

        let placeholders = entry.invoke(ctx).await.unwrap();
        assert_eq!(placeholders["greeting"], "hi from hello");
    }

    #[tokio::test]
    async fn test_runaway_script_is_interrupted() {
        let entry = lua("function register() while true do end end");
        let mut ctx = context("spin");
        ctx.deadline = Instant::now() + Duration::from_millis(50);

        let started = Instant::now();
        let err = entry.invoke(ctx).await.unwrap_err();
        assert!(format!("{:#}", err).contains("deadline"), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_runaway_top_level_is_interrupted() {
        let entry = lua("while true do end\nfunction register() return {} end");
        let mut ctx = context("spin");
        ctx.deadline = Instant::now() + Duration::from_millis(50);

        let started = Instant::now();
        assert!(entry.invoke(ctx).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_help_from_script() {
        let entry = lua(r#"
function get_help() return "Shows the answer" end
function register() return {} end
"#);
        assert_eq!(entry.help(context("answer")).await.as_deref(), Some("Shows the answer"));
        assert_eq!(lua("function register() return {} end").help(context("x")).await, None);
    }
}
