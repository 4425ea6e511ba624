//! Host APIs exposed to Lua plugins
//!
//! - HTTP client (with domain whitelist enforcement and custom User-Agent)
//! - External commands with a timeout
//! - Result cache access, namespaced by plugin name
//! - Environment variable access
//! - Logging functions
//!
//! Network and exec functions are only registered when the plugin's
//! permissions allow them.

use mlua::{ Lua, LuaSerdeExt, Table };
use once_cell::sync::Lazy;
use std::collections::{ HashMap, HashSet };
use std::time::Duration;

use crate::engine::cache::{ CacheKey, ResultCache };
use crate::engine::result::Placeholders;
use crate::plugins::entrypoint::InvocationContext;
use crate::plugins::registry::PluginPermissions;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_EXEC_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_CACHE_TTL_SECS: f64 = 60.0;

/// Placeholder name under which `cache_set` values are stored
const CACHE_VALUE_KEY: &str = "value";

/// Scopes written from Lua never collide with the engine's own result entries
const LUA_SCOPE_PREFIX: &str = "lua:";

fn lua_cache_key(plugin: &str, scope: &str) -> CacheKey {
    CacheKey::new(plugin, format!("{}{}", LUA_SCOPE_PREFIX, scope))
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder().timeout(HTTP_TIMEOUT).build().unwrap_or_default()
});

/// Register HTTP client API with domain whitelist enforcement
pub fn register_http_api(lua: &Lua, permissions: &PluginPermissions) -> mlua::Result<()> {
    if !permissions.network {
        return Ok(());
    }

    let whitelist: HashSet<String> = permissions.allowed_domains
        .iter()
        .map(|d| d.to_lowercase())
        .collect();

    let user_agent = permissions.user_agent
        .clone()
        .unwrap_or_else(|| format!("ping-status-plugin/{}", env!("CARGO_PKG_VERSION")));

    let http_get = lua.create_async_function(move |lua, url: String| {
        let whitelist = whitelist.clone();
        let user_agent = user_agent.clone();
        async move {
            let domain = extract_domain(&url)?;

            if !whitelist.is_empty() && !whitelist.contains(&domain.to_lowercase()) {
                return Err(
                    mlua::Error::runtime(
                        format!("Domain '{}' is not in the allowed domains whitelist", domain)
                    )
                );
            }

            let response = HTTP_CLIENT.get(&url)
                .header("User-Agent", &user_agent)
                .send().await
                .map_err(|e| mlua::Error::runtime(format!("HTTP request failed: {}", e)))?;

            let status = response.status().as_u16();
            let body = response
                .text().await
                .map_err(|e| mlua::Error::runtime(format!("Failed to read response body: {}", e)))?;

            let result = lua.create_table()?;
            result.set("status", status)?;
            result.set("body", body)?;
            Ok(result)
        }
    })?;

    lua.globals().set("http_get", http_get)?;
    Ok(())
}

/// Register `exec(cmd, args?, timeout_secs?)`
///
/// The child is killed when the timeout fires or the invocation is abandoned.
pub fn register_exec_api(lua: &Lua, permissions: &PluginPermissions) -> mlua::Result<()> {
    if !permissions.exec {
        return Ok(());
    }

    let exec = lua.create_async_function(
        |lua, (cmd, args, timeout_secs): (String, Option<Vec<String>>, Option<f64>)| async move {
            let timeout = seconds(timeout_secs, DEFAULT_EXEC_TIMEOUT_SECS);

            let mut command = tokio::process::Command::new(&cmd);
            command.args(args.unwrap_or_default()).kill_on_drop(true);

            let output = tokio::time
                ::timeout(timeout, command.output()).await
                .map_err(|_| mlua::Error::runtime(format!("'{}' timed out after {:?}", cmd, timeout)))?
                .map_err(|e| mlua::Error::runtime(format!("Failed to run '{}': {}", cmd, e)))?;

            let result = lua.create_table()?;
            result.set("status", output.status.code().unwrap_or(-1))?;
            result.set("stdout", String::from_utf8_lossy(&output.stdout).into_owned())?;
            result.set("stderr", String::from_utf8_lossy(&output.stderr).into_owned())?;
            Ok(result)
        }
    )?;

    lua.globals().set("exec", exec)?;
    Ok(())
}

/// Register `cache_get(scope)` and `cache_set(scope, value, ttl_secs?)`
///
/// Values live in the engine's result cache under `(plugin, "lua:" + scope)`, so they
/// survive across invocations and, when persistence is on, across runs.
pub fn register_cache_api(lua: &Lua, plugin: &str, cache: &ResultCache) -> mlua::Result<()> {
    let get_plugin = plugin.to_string();
    let get_cache = cache.clone();
    let cache_get = lua.create_function(move |_lua, scope: String| {
        let value = get_cache
            .lookup(&lua_cache_key(&get_plugin, &scope))
            .and_then(|entry| entry.placeholders.get(CACHE_VALUE_KEY).cloned());
        Ok(value)
    })?;

    let set_plugin = plugin.to_string();
    let set_cache = cache.clone();
    let cache_set = lua.create_function(
        move |_lua, (scope, value, ttl): (String, String, Option<f64>)| {
            let mut placeholders = Placeholders::new();
            placeholders.insert(CACHE_VALUE_KEY.to_string(), value);
            set_cache.insert(
                lua_cache_key(&set_plugin, &scope),
                placeholders,
                seconds(ttl, DEFAULT_CACHE_TTL_SECS)
            );
            Ok(())
        }
    )?;

    lua.globals().set("cache_get", cache_get)?;
    lua.globals().set("cache_set", cache_set)?;
    Ok(())
}

/// Register logging API
///
/// Plugin messages go through the host logger, tagged with the plugin name.
pub fn register_logging_api(lua: &Lua, plugin: &str) -> mlua::Result<()> {
    let tag = plugin.to_string();
    let log_info_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_info!("[{}] {}", tag, msg);
        Ok(())
    })?;

    let tag = plugin.to_string();
    let log_warn_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_warn!("[{}] {}", tag, msg);
        Ok(())
    })?;

    let tag = plugin.to_string();
    let log_error_fn = lua.create_function(move |_lua, msg: String| {
        crate::log_error!("[{}] {}", tag, msg);
        Ok(())
    })?;

    lua.globals().set("log_info", log_info_fn)?;
    lua.globals().set("log_warn", log_warn_fn)?;
    lua.globals().set("log_error", log_error_fn)?;

    Ok(())
}

/// Register environment variable API
///
/// Plugins only see the variables listed in their `permissions.env_vars`.
pub fn register_env_api(lua: &Lua, env_vars: &HashMap<String, String>) -> mlua::Result<()> {
    let env_vars_for_get = env_vars.clone();
    let env_vars_for_list = env_vars.clone();

    let env_get = lua.create_function(move |_lua, key: String| {
        env_vars_for_get
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                mlua::Error::runtime(
                    format!("Environment variable '{}' not found or not allowed", key)
                )
            })
    })?;

    lua.globals().set("env_get", env_get)?;

    let env_list = lua.create_function(move |_lua, ()| {
        let mut keys: Vec<String> = env_vars_for_list.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    })?;

    lua.globals().set("env_list", env_list)?;

    Ok(())
}

/// Expose `config` (the plugin's settings) and `plugin` (`{name, version}`)
pub fn register_context(lua: &Lua, ctx: &InvocationContext) -> mlua::Result<()> {
    let config = lua.create_table()?;
    for (key, value) in &ctx.settings {
        config.set(key.as_str(), lua.to_value(value)?)?;
    }

    let plugin: Table = lua.create_table()?;
    plugin.set("name", ctx.plugin.as_str())?;
    plugin.set("version", ctx.version.as_str())?;

    lua.globals().set("config", config)?;
    lua.globals().set("plugin", plugin)?;
    Ok(())
}

/// Positive seconds from Lua, or `default`
fn seconds(value: Option<f64>, default: f64) -> Duration {
    let secs = value.filter(|secs| *secs > 0.0).unwrap_or(default);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Extract domain from URL
///
/// # Examples
/// - `https://example.com/path` -> `example.com`
/// - `http://api.example.com:8080/v1` -> `api.example.com`
fn extract_domain(url: &str) -> mlua::Result<String> {
    let parsed = url::Url
        ::parse(url)
        .map_err(|e| mlua::Error::runtime(format!("Invalid URL: {}", e)))?;

    let host = parsed.host_str().ok_or_else(|| mlua::Error::runtime("URL has no host"))?;

    Ok(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://example.com/path").unwrap(), "example.com");
        assert_eq!(extract_domain("http://api.example.com:8080/v1").unwrap(), "api.example.com");
        assert_eq!(extract_domain("https://sub.domain.co.uk").unwrap(), "sub.domain.co.uk");
    }

    #[test]
    fn test_extract_domain_invalid() {
        assert!(extract_domain("not a url").is_err());
        assert!(extract_domain("://no-protocol").is_err());
    }

    #[test]
    fn test_cache_api_shares_engine_cache() {
        let lua = Lua::new();
        let cache = ResultCache::in_memory(false);
        register_cache_api(&lua, "multi-ping", &cache).unwrap();

        lua.load(r#"cache_set("1.1.1.1", "12 ms", 30)"#).exec().unwrap();

        let entry = cache.lookup(&CacheKey::new("multi-ping", "lua:1.1.1.1")).unwrap();
        assert_eq!(entry.placeholders[CACHE_VALUE_KEY], "12 ms");
        assert!(cache.lookup(&CacheKey::new("multi-ping", "1.1.1.1")).is_none());

        let hit: Option<String> = lua.load(r#"return cache_get("1.1.1.1")"#).eval().unwrap();
        assert_eq!(hit.as_deref(), Some("12 ms"));
        let miss: Option<String> = lua.load(r#"return cache_get("8.8.8.8")"#).eval().unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn test_cache_set_keeps_engine_result_entry() {
        let lua = Lua::new();
        let cache = ResultCache::in_memory(false);
        let mut engine_value = Placeholders::new();
        engine_value.insert("weather".to_string(), "sunny".to_string());
        cache.insert(CacheKey::new("weather", ""), engine_value, Duration::from_secs(60));

        register_cache_api(&lua, "weather", &cache).unwrap();
        lua.load(r#"cache_set("", "scratch", 30)"#).exec().unwrap();

        let entry = cache.lookup(&CacheKey::new("weather", "")).unwrap();
        assert_eq!(entry.placeholders["weather"], "sunny");
        assert!(!entry.placeholders.contains_key(CACHE_VALUE_KEY));
        let scratch: Option<String> = lua.load(r#"return cache_get("")"#).eval().unwrap();
        assert_eq!(scratch.as_deref(), Some("scratch"));
    }

    #[test]
    fn test_env_api_only_exposes_given_vars() {
        let lua = Lua::new();
        let vars = HashMap::from([("API_KEY".to_string(), "secret".to_string())]);
        register_env_api(&lua, &vars).unwrap();

        let value: String = lua.load(r#"return env_get("API_KEY")"#).eval().unwrap();
        assert_eq!(value, "secret");
        assert!(lua.load(r#"return env_get("HOME")"#).eval::<String>().is_err());
    }

    #[tokio::test]
    async fn test_http_whitelist_rejects_other_domains() {
        let lua = Lua::new();
        let permissions = PluginPermissions {
            network: true,
            allowed_domains: vec!["api.example.com".into()],
            ..Default::default()
        };
        register_http_api(&lua, &permissions).unwrap();

        let err = lua
            .load(r#"return http_get("https://evil.example.org/")"#)
            .eval_async::<Table>().await
            .unwrap_err();
        assert!(err.to_string().contains("whitelist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_output() {
        let lua = Lua::new();
        let permissions = PluginPermissions { exec: true, ..Default::default() };
        register_exec_api(&lua, &permissions).unwrap();

        let result: Table = lua
            .load(r#"return exec("echo", {"hello"})"#)
            .eval_async().await
            .unwrap();
        assert_eq!(result.get::<i64>("status").unwrap(), 0);
        assert_eq!(result.get::<String>("stdout").unwrap().trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_times_out() {
        let lua = Lua::new();
        let permissions = PluginPermissions { exec: true, ..Default::default() };
        register_exec_api(&lua, &permissions).unwrap();

        let err = lua
            .load(r#"return exec("sleep", {"5"}, 0.1)"#)
            .eval_async::<Table>().await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
