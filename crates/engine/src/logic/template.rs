//! Parameter substitution into mapping logic using minijinja.

use chrono::{DateTime, Utc};
use minijinja::{Environment, Error, ErrorKind, Value};

use super::LogicError;

/// Template engine with the filters mapping logic relies on.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

        env.add_filter("tojson", filter_tojson);
        env.add_filter("quote", filter_quote);
        env.add_filter("strftime", filter_strftime);
        env.add_filter("int", filter_int);

        Self { env }
    }

    /// Render `template` against `context`. Strings without template syntax
    /// are returned unchanged; an undefined variable is an error.
    pub fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, LogicError> {
        if !is_template(template) {
            return Ok(template.to_string());
        }
        let ctx = Value::from_serialize(context);
        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| LogicError::Template(format!("parse error in '{}': {}", template, e)))?;
        tmpl.render(ctx)
            .map_err(|e| LogicError::Template(format!("render error in '{}': {}", template, e)))
    }

    /// Render to a typed value. A template that is one `{{ expr }}` is
    /// evaluated as an expression and keeps its type; otherwise the output
    /// is read as JSON when it parses as JSON and stays a string when not.
    /// Empty output is null.
    pub fn render_to_value(
        &self,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, LogicError> {
        if let Some(expression) = whole_expression(template) {
            return self.eval(expression, template, context);
        }
        let rendered = self.render(template, context)?;
        let trimmed = rendered.trim();
        if trimmed.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(trimmed).unwrap_or(serde_json::Value::String(rendered)))
    }

    fn eval(
        &self,
        expression: &str,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, LogicError> {
        let compiled = self
            .env
            .compile_expression(expression)
            .map_err(|e| LogicError::Template(format!("parse error in '{}': {}", template, e)))?;
        let value = compiled
            .eval(Value::from_serialize(context))
            .map_err(|e| LogicError::Template(format!("render error in '{}': {}", template, e)))?;
        if value.is_undefined() {
            return Err(LogicError::Template(format!(
                "render error in '{}': undefined value",
                template
            )));
        }
        serde_json::to_value(&value)
            .map_err(|e| LogicError::Template(format!("render error in '{}': {}", template, e)))
    }
}

/// Whether `s` contains template syntax.
pub fn is_template(s: &str) -> bool {
    [("{{", "}}"), ("{%", "%}")]
        .iter()
        .any(|(open, close)| s.find(open).is_some_and(|i| s[i..].contains(close)))
}

/// Whether `s` is exactly one `{{ ... }}` expression.
pub fn is_whole_expression(s: &str) -> bool {
    whole_expression(s).is_some()
}

/// The expression inside a template that is exactly one `{{ ... }}`.
fn whole_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let inner = inner.trim_start_matches('-').trim_end_matches('-').trim();
    (!inner.is_empty()).then_some(inner)
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Quote a value as a string literal for filter expressions.
fn filter_quote(value: &Value) -> Result<String, Error> {
    let s = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
    serde_json::to_string(&s)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("quote error: {}", e)))
}

/// Format an RFC 3339 timestamp, e.g. `{{ trigger.instant | strftime("%Y-%m-%d") }}`.
fn filter_strftime(value: &Value, format: &str) -> Result<String, Error> {
    let raw = value.as_str().ok_or_else(|| {
        Error::new(ErrorKind::InvalidOperation, "strftime requires a timestamp string")
    })?;
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("strftime error: {}", e)))?
        .with_timezone(&Utc);
    Ok(parsed.format(format).to_string())
}

/// Truncate numbers and numeric strings to an integer.
fn filter_int(value: &Value) -> Result<i64, Error> {
    let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
    let text = text.trim();
    text.parse::<i64>()
        .or_else(|_| text.parse::<f64>().map(|f| f.trunc() as i64))
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, format!("'{}' is not a number", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_string_untouched() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.render("o.amount > 100", &json!({})).unwrap(), "o.amount > 100");
    }

    #[test]
    fn test_render_params() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "min_amount": 250, "region": "emea" });
        assert_eq!(
            engine
                .render("o.amount > {{ min_amount }} && o.region == {{ region | quote }}", &ctx)
                .unwrap(),
            "o.amount > 250 && o.region == \"emea\""
        );
    }

    #[test]
    fn test_undefined_param_is_error() {
        let engine = TemplateEngine::new();
        let err = engine.render("{{ missing }}", &json!({})).unwrap_err();
        assert!(matches!(err, LogicError::Template(_)));
    }

    #[test]
    fn test_render_to_value_types() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "n": 7, "flag": true, "name": "batch-1" });
        assert_eq!(engine.render_to_value("{{ n }}", &ctx).unwrap(), json!(7));
        assert_eq!(engine.render_to_value("{{ flag }}", &ctx).unwrap(), json!(true));
        assert_eq!(engine.render_to_value("{{ name }}", &ctx).unwrap(), json!("batch-1"));
    }

    #[test]
    fn test_strftime_filter() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "trigger": { "instant": "2024-05-01T10:30:00+00:00" } });
        assert_eq!(
            engine
                .render("{{ trigger.instant | strftime('%Y-%m-%d') }}", &ctx)
                .unwrap(),
            "2024-05-01"
        );
    }

    #[test]
    fn test_render_to_value_keeps_expression_types() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "ids": [1, 2], "ratio": 0.5, "enabled": false, "empty": "" });
        assert_eq!(engine.render_to_value("{{ ids }}", &ctx).unwrap(), json!([1, 2]));
        assert_eq!(engine.render_to_value("{{ ratio * 2 }}", &ctx).unwrap(), json!(1.0));
        assert_eq!(engine.render_to_value("{{- enabled -}}", &ctx).unwrap(), json!(false));
        assert_eq!(engine.render_to_value("{{ empty }}", &ctx).unwrap(), json!(""));
        assert!(engine.render_to_value("{{ missing }}", &ctx).is_err());
    }

    #[test]
    fn test_render_to_value_fallbacks() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "ids": [1, 2], "empty": "" });
        assert_eq!(engine.render_to_value("{{ ids[0] }}{{ ids[1] }}", &ctx).unwrap(), json!(12));
        assert_eq!(engine.render_to_value(" {% if false %}x{% endif %}", &ctx).unwrap(), json!(null));
        assert_eq!(engine.render_to_value("eu-{{ ids[0] }}", &ctx).unwrap(), json!("eu-1"));
    }

    #[test]
    fn test_int_filter() {
        let engine = TemplateEngine::new();
        let ctx = json!({ "limit": "12.9" });
        assert_eq!(engine.render("{{ limit | int }}", &ctx).unwrap(), "12");
        assert!(engine.render("{{ 'abc' | int }}", &ctx).is_err());
    }

    #[test]
    fn test_is_template() {
        assert!(is_template("{% if a %}x{% endif %}"));
        assert!(!is_template("}} before {{"));
    }

    #[test]
    fn test_is_whole_expression() {
        assert!(is_whole_expression("{{ batch_id }}"));
        assert!(!is_whole_expression("prefix {{ batch_id }}"));
        assert!(!is_whole_expression("{{ a }}{{ b }}"));
    }
}
