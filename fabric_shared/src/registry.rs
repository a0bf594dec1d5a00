//! Handler registry and dispatch context.
//!
//! Applications register callbacks per command name; the fabric invokes them
//! for inbound frames. Six command names are reserved for the protocol itself
//! and can never be registered.

use std::collections::HashMap;

use anyhow::bail;
use serde_json::Value;

/// Command names owned by the fabric; rejected at registration.
pub const RESERVED_COMMANDS: [&str; 6] = [
    "handshake",
    "discover",
    "broadcast",
    "emit",
    "delivery",
    "error",
];

/// Context passed to application handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// The inbound frame's `data`.
    pub data: Value,
    /// Friendly client name. On the server this is the origin client; on the
    /// client it is the client's own name.
    pub name: Option<String>,
    /// Channel id of the owning connection, when established.
    pub uuid: Option<String>,
}

/// Handler callback. The return value is meaningful only when the inbound
/// frame carried a `delivery` id: it becomes the reply's `data`, with `None`
/// normalized to JSON null.
pub type HandlerFn = Box<dyn Fn(&HandlerContext) -> Option<Value> + Send + Sync>;

/// An ordered collection of handlers for `add_handlers`.
#[derive(Default)]
pub struct HandlerSet {
    entries: Vec<(String, HandlerFn)>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `command`.
    pub fn on<F>(mut self, command: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&HandlerContext) -> Option<Value> + Send + Sync + 'static,
    {
        self.entries.push((command.into(), Box::new(handler)));
        self
    }

    fn into_entries(self) -> Vec<(String, HandlerFn)> {
        self.entries
    }
}

/// Command name → callback map.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one handler, rejecting reserved names and duplicates.
    pub fn register(&mut self, command: impl Into<String>, handler: HandlerFn) -> anyhow::Result<()> {
        let command = command.into();
        if command.is_empty() {
            bail!("handler command name must be non-empty");
        }
        if RESERVED_COMMANDS.contains(&command.as_str()) {
            bail!("'{command}' is a reserved command name");
        }
        if self.handlers.contains_key(&command) {
            bail!("handler for '{command}' already registered");
        }
        self.handlers.insert(command, handler);
        Ok(())
    }

    /// Registers every handler in `set`, failing on the first bad entry.
    pub fn add_set(&mut self, set: HandlerSet) -> anyhow::Result<()> {
        for (command, handler) in set.into_entries() {
            self.register(command, handler)?;
        }
        Ok(())
    }

    /// Invokes the handler for `command`, normalizing a missing return value
    /// to JSON null. Returns `None` when no handler is registered.
    pub fn dispatch(&self, command: &str, ctx: &HandlerContext) -> Option<Value> {
        self.handlers
            .get(command)
            .map(|handler| handler(ctx).unwrap_or(Value::Null))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Registered command names, sorted for stable discovery output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> HandlerContext {
        HandlerContext {
            data: json!({"x": 1}),
            name: Some("c1".into()),
            uuid: Some("abc".into()),
        }
    }

    #[test]
    fn reserved_names_are_rejected() {
        for name in RESERVED_COMMANDS {
            let mut registry = HandlerRegistry::new();
            let err = registry.register(name, Box::new(|_| None)).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{name}: {err}");
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", Box::new(|_| None)).unwrap();
        assert!(registry.register("ping", Box::new(|_| None)).is_err());
    }

    #[test]
    fn dispatch_normalizes_missing_return_to_null() {
        let mut registry = HandlerRegistry::new();
        registry.register("fire", Box::new(|_| None)).unwrap();
        assert_eq!(registry.dispatch("fire", &ctx()), Some(Value::Null));
        assert_eq!(registry.dispatch("unknown", &ctx()), None);
    }

    #[test]
    fn handlers_see_the_context() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "sum",
                Box::new(|ctx| {
                    let a = ctx.data["a"].as_i64().unwrap_or(0);
                    let b = ctx.data["b"].as_i64().unwrap_or(0);
                    Some(json!({"r": a + b}))
                }),
            )
            .unwrap();

        let ctx = HandlerContext {
            data: json!({"a": 1, "b": 2}),
            name: Some("c1".into()),
            uuid: None,
        };
        assert_eq!(registry.dispatch("sum", &ctx), Some(json!({"r": 3})));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register("zeta", Box::new(|_| None)).unwrap();
        registry.register("alpha", Box::new(|_| None)).unwrap();
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }
}
