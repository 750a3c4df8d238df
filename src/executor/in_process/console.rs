//! Console line formatting for values captured from evaluated code

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Type, Value};

/// Placeholder for values that cannot be rendered
pub const UNSERIALIZABLE: &str = "[unserializable]";

/// Format console arguments into one space-separated line
pub fn format_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> String {
    args.iter()
        .map(|value| format_value(ctx, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a single value the way the console shows it
pub fn format_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_else(|_| UNSERIALIZABLE.to_string());
    }
    if value.is_function() {
        return "[Function]".to_string();
    }
    // Errors render as "Name: message", not as an empty JSON object
    if value.type_of() == Type::Exception {
        return coerce(ctx, value);
    }
    if value.is_object() {
        return stringify(ctx, value);
    }
    coerce(ctx, value)
}

/// JS `ToString` conversion
fn coerce<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(Coerced(s)) => s,
        Err(_) => {
            // Drop the pending exception so it cannot resurface later
            let _ = ctx.catch();
            UNSERIALIZABLE.to_string()
        }
    }
}

/// Structural serialization through `JSON.stringify`
fn stringify<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => json
            .to_string()
            .unwrap_or_else(|_| UNSERIALIZABLE.to_string()),
        Ok(None) => UNSERIALIZABLE.to_string(),
        Err(_) => {
            let _ = ctx.catch();
            UNSERIALIZABLE.to_string()
        }
    }
}
