//! Templating and condition evaluation.
//!
//! Task parameters, loop sources and conditions are Jinja2-style expressions
//! evaluated with `minijinja` against a host's variables.
//!
//! Two environments are kept:
//! - **arguments** render strictly: an undefined variable in a module
//!   argument is an error, never a silently empty string;
//! - **conditions** are null-safe: an undefined variable (or an undefined
//!   attribute or index of a defined one) evaluates to undefined, which is
//!   false in every boolean context, so `when: probe.rc == 0` simply skips
//!   when `probe` was never registered. Comparisons and membership tests are
//!   rewritten so that they are false whenever either operand is undefined.

use minijinja::value::Value;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::trace;

/// Variables visible to a template: a JSON object of name → value.
pub type TemplateVars = serde_json::Map<String, serde_json::Value>;

/// Errors raised while rendering or evaluating templates
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template references a variable that is not defined.
    #[error("undefined variable in '{template}': {message}")]
    Undefined {
        /// Offending template or expression
        template: String,
        /// Engine message
        message: String,
    },

    /// Syntax or evaluation error.
    #[error("template error in '{template}': {message}")]
    Render {
        /// Offending template or expression
        template: String,
        /// Engine message
        message: String,
    },
}

impl TemplateError {
    fn from_engine(template: &str, err: minijinja::Error) -> Self {
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.kind().to_string(),
        };
        if err.kind() == ErrorKind::UndefinedError {
            TemplateError::Undefined {
                template: template.to_string(),
                message,
            }
        } else {
            TemplateError::Render {
                template: template.to_string(),
                message,
            }
        }
    }
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// A whole-string single expression, rendered with its native type.
static SINGLE_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\{\{\s*(.+?)\s*\}\}\s*$").expect("valid single expression regex")
});

/// Jinja2-style template engine used for arguments, loops and conditions
#[derive(Debug)]
pub struct TemplateEngine {
    strict: Environment<'static>,
    lenient: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new engine with the builtin filters and result tests
    pub fn new() -> Self {
        let mut strict = Environment::new();
        strict.set_undefined_behavior(UndefinedBehavior::Strict);
        strict.set_keep_trailing_newline(true);
        Self::add_builtins(&mut strict);

        let mut lenient = Environment::new();
        lenient.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self::add_builtins(&mut lenient);

        Self { strict, lenient }
    }

    fn add_builtins(env: &mut Environment<'static>) {
        env.add_filter("bool", |value: Value| -> bool {
            match value.as_str() {
                Some(s) => matches!(
                    s.trim().to_lowercase().as_str(),
                    "true" | "yes" | "on" | "1" | "y"
                ),
                None => value.is_true(),
            }
        });

        env.add_filter("regex_search", |s: String, pattern: String| -> Option<String> {
            Regex::new(&pattern)
                .ok()
                .and_then(|re| re.find(&s).map(|m| m.as_str().to_string()))
        });

        env.add_filter("to_json", |value: Value| -> String {
            serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
        });

        // Tests over registered results: `when: probe is failed`
        env.add_test("failed", |value: Value| -> bool { result_flag(&value, "failed") });
        env.add_test("failure", |value: Value| -> bool { result_flag(&value, "failed") });
        env.add_test("changed", |value: Value| -> bool { result_flag(&value, "changed") });
        env.add_test("skipped", |value: Value| -> bool { result_flag(&value, "skipped") });
        env.add_test("succeeded", |value: Value| -> bool {
            !value.is_undefined() && !result_flag(&value, "failed")
        });
        env.add_test("success", |value: Value| -> bool {
            !value.is_undefined() && !result_flag(&value, "failed")
        });
    }

    /// Check if a string contains template syntax
    pub fn has_template(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }

    /// Render a template string to text
    pub fn render_str(&self, template: &str, vars: &TemplateVars) -> TemplateResult<String> {
        if !Self::has_template(template) {
            return Ok(template.to_string());
        }
        self.strict
            .render_str(template, Value::from_serialize(vars))
            .map_err(|e| TemplateError::from_engine(template, e))
    }

    /// Evaluate a bare expression (no `{{ }}`) to a value
    pub fn evaluate(&self, expr: &str, vars: &TemplateVars) -> TemplateResult<serde_json::Value> {
        let compiled = self
            .strict
            .compile_expression(expr)
            .map_err(|e| TemplateError::from_engine(expr, e))?;
        let value = compiled
            .eval(Value::from_serialize(vars))
            .map_err(|e| TemplateError::from_engine(expr, e))?;
        if value.is_undefined() {
            return Err(TemplateError::Undefined {
                template: expr.to_string(),
                message: "expression is undefined".to_string(),
            });
        }
        serde_json::to_value(&value).map_err(|e| TemplateError::Render {
            template: expr.to_string(),
            message: e.to_string(),
        })
    }

    /// Render every string inside a JSON value.
    ///
    /// A string that is exactly one `{{ expr }}` keeps the expression's native
    /// type, so `loop: "{{ services }}"` yields a list.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        vars: &TemplateVars,
    ) -> TemplateResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) if Self::has_template(s) => {
                match SINGLE_EXPR.captures(s) {
                    Some(caps) if !caps[1].contains("{{") && !caps[1].contains("}}") => {
                        self.evaluate(&caps[1], vars)
                    }
                    _ => Ok(serde_json::Value::String(self.render_str(s, vars)?)),
                }
            }
            serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, vars))
                    .collect::<TemplateResult<_>>()?,
            )),
            serde_json::Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, v) in map {
                    rendered.insert(self.render_str(key, vars)?, self.render_value(v, vars)?);
                }
                Ok(serde_json::Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a `when`/`failed_when`/`changed_when` expression.
    ///
    /// Undefined values are false: `ghost is defined`, `ghost.rc == 0`,
    /// `'x' in ghost` and a bare `ghost` all evaluate to `false` without error.
    pub fn evaluate_condition(&self, condition: &str, vars: &TemplateVars) -> TemplateResult<bool> {
        let expr = match SINGLE_EXPR.captures(condition) {
            Some(caps) => caps[1].to_string(),
            None => condition.trim().to_string(),
        };
        if expr.is_empty() {
            return Ok(true);
        }

        let guarded = guard_comparisons(&expr);
        let compiled = self
            .lenient
            .compile_expression(&guarded)
            .map_err(|e| TemplateError::from_engine(&expr, e))?;

        match compiled.eval(Value::from_serialize(vars)) {
            Ok(value) => {
                trace!(condition = %expr, result = value.is_true(), "Evaluated condition");
                Ok(value.is_true())
            }
            Err(e) if e.kind() == ErrorKind::UndefinedError => {
                trace!(condition = %expr, "Condition references undefined value, treating as false");
                Ok(false)
            }
            Err(e) => Err(TemplateError::from_engine(&expr, e)),
        }
    }
}

// ============================================================================
// Null-safe comparisons
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Word,
    Str,
    Op,
    Open,
    Close,
    Comma,
}

#[derive(Debug, Clone, Copy)]
struct Tok {
    kind: TokKind,
    start: usize,
    end: usize,
}

const COMPARISON_OPS: &[&str] = &["==", "!=", "<", "<=", ">", ">=", "in"];

/// Rewrite every `lhs <op> rhs` comparison (including `in` and `not in`) into
/// `((lhs) is defined and (rhs) is defined and (lhs) <op> (rhs))`.
///
/// Falls back to the original text when the expression cannot be tokenized,
/// leaving the syntax error to the engine.
fn guard_comparisons(expr: &str) -> String {
    match tokenize(expr) {
        Some(toks) if toks.iter().any(|t| is_comparison(expr, t)) => {
            Guard { src: expr, toks: &toks }
                .rewrite(0, toks.len())
                .unwrap_or_else(|| expr.to_string())
        }
        _ => expr.to_string(),
    }
}

fn is_comparison(src: &str, tok: &Tok) -> bool {
    matches!(tok.kind, TokKind::Op | TokKind::Word) && COMPARISON_OPS.contains(&&src[tok.start..tok.end])
}

fn tokenize(src: &str) -> Option<Vec<Tok>> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'\'' | b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != c {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                if i >= bytes.len() {
                    return None;
                }
                i += 1;
                TokKind::Str
            }
            b'(' | b'[' | b'{' => {
                i += 1;
                TokKind::Open
            }
            b')' | b']' | b'}' => {
                i += 1;
                TokKind::Close
            }
            b',' => {
                i += 1;
                TokKind::Comma
            }
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                TokKind::Word
            }
            _ => {
                let two = bytes.get(i..i + 2);
                i += match two {
                    Some(b"==") | Some(b"!=") | Some(b"<=") | Some(b">=") | Some(b"**")
                    | Some(b"//") => 2,
                    _ => src[i..].chars().next().map_or(1, char::len_utf8),
                };
                TokKind::Op
            }
        };
        toks.push(Tok {
            kind,
            start,
            end: i,
        });
    }
    Some(toks)
}

struct Guard<'a> {
    src: &'a str,
    toks: &'a [Tok],
}

impl Guard<'_> {
    fn text(&self, i: usize) -> &str {
        &self.src[self.toks[i].start..self.toks[i].end]
    }

    fn matching_close(&self, open: usize, hi: usize) -> Option<usize> {
        let mut depth = 0usize;
        for i in open..hi {
            match self.toks[i].kind {
                TokKind::Open => depth += 1,
                TokKind::Close => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Operands end at boolean operators, inline `if`/`else`, commas and a
    /// prefix `not`.
    fn is_boundary(&self, i: usize, seg_start: usize) -> bool {
        let tok = self.toks[i];
        if tok.kind == TokKind::Comma {
            return true;
        }
        if tok.kind != TokKind::Word {
            return false;
        }
        match self.text(i) {
            "and" | "or" | "if" | "else" => true,
            "not" => {
                let next_is_in = i + 1 < self.toks.len() && self.text(i + 1) == "in";
                let after_is = i > seg_start && self.text(i - 1) == "is";
                !next_is_in && !after_is
            }
            _ => false,
        }
    }

    /// Rewrite tokens `lo..hi`, preserving the original spacing.
    fn rewrite(&self, lo: usize, hi: usize) -> Option<String> {
        let mut out = String::new();
        let mut seg_start = lo;
        let mut i = lo;

        while i < hi {
            if self.toks[i].kind == TokKind::Open {
                i = self.matching_close(i, hi)? + 1;
                continue;
            }
            if self.toks[i].kind == TokKind::Close {
                return None;
            }
            if self.is_boundary(i, seg_start) {
                out.push_str(&self.segment(seg_start, i)?);
                out.push_str(self.gap_before(seg_start, i));
                out.push_str(self.text(i));
                out.push_str(self.gap_after(i, hi));
                seg_start = i + 1;
            }
            i += 1;
        }
        out.push_str(&self.segment(seg_start, hi)?);
        Some(out)
    }

    fn gap_before(&self, seg_start: usize, i: usize) -> &str {
        if i > seg_start {
            &self.src[self.toks[i - 1].end..self.toks[i].start]
        } else {
            ""
        }
    }

    fn gap_after(&self, i: usize, hi: usize) -> &str {
        if i + 1 < hi {
            &self.src[self.toks[i].end..self.toks[i + 1].start]
        } else {
            ""
        }
    }

    /// Text of `lo..hi` with nested groups rewritten.
    fn plain(&self, lo: usize, hi: usize) -> Option<String> {
        let mut out = String::new();
        let mut i = lo;
        while i < hi {
            if i > lo {
                out.push_str(&self.src[self.toks[i - 1].end..self.toks[i].start]);
            }
            if self.toks[i].kind == TokKind::Open {
                let close = self.matching_close(i, hi)?;
                out.push_str(self.text(i));
                if close > i + 1 {
                    out.push_str(&self.src[self.toks[i].end..self.toks[i + 1].start]);
                    out.push_str(&self.rewrite(i + 1, close)?);
                    out.push_str(&self.src[self.toks[close - 1].end..self.toks[close].start]);
                }
                out.push_str(self.text(close));
                i = close + 1;
                continue;
            }
            out.push_str(self.text(i));
            i += 1;
        }
        Some(out)
    }

    /// A single operand chain: guard its first top-level comparison.
    fn segment(&self, lo: usize, hi: usize) -> Option<String> {
        let mut i = lo;
        while i < hi {
            if self.toks[i].kind == TokKind::Open {
                i = self.matching_close(i, hi)? + 1;
                continue;
            }
            if is_comparison(self.src, &self.toks[i]) {
                let negated = self.text(i) == "in" && i > lo && self.text(i - 1) == "not";
                let lhs_end = if negated { i - 1 } else { i };
                if lhs_end == lo || i + 1 >= hi {
                    return self.plain(lo, hi);
                }
                let lhs = self.plain(lo, lhs_end)?;
                let rhs = self.plain(i + 1, hi)?;
                let op = if negated { "not in" } else { self.text(i) };
                return Some(format!(
                    "(({lhs}) is defined and ({rhs}) is defined and ({lhs}) {op} ({rhs}))"
                ));
            }
            i += 1;
        }
        self.plain(lo, hi)
    }
}

fn result_flag(value: &Value, flag: &str) -> bool {
    value
        .get_attr(flag)
        .map(|v| v.is_true())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: serde_json::Value) -> TemplateVars {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("vars must be an object"),
        }
    }

    #[test]
    fn test_render_str() {
        let engine = TemplateEngine::new();
        let v = vars(json!({"elk_host": "192.168.0.103"}));
        assert_eq!(
            engine.render_str("hosts: [\"{{ elk_host }}:9200\"]", &v).unwrap(),
            "hosts: [\"192.168.0.103:9200\"]"
        );
    }

    #[test]
    fn test_render_value_keeps_native_types() {
        let engine = TemplateEngine::new();
        let v = vars(json!({"services": ["apache2", "telnet"], "port": 22}));
        assert_eq!(
            engine.render_value(&json!("{{ services }}"), &v).unwrap(),
            json!(["apache2", "telnet"])
        );
        assert_eq!(engine.render_value(&json!("{{ port }}"), &v).unwrap(), json!(22));
        assert_eq!(
            engine
                .render_value(&json!({"port": "{{ port }}/tcp", "n": 1}), &v)
                .unwrap(),
            json!({"port": "22/tcp", "n": 1})
        );
    }

    #[test]
    fn test_render_undefined_argument_is_error() {
        let engine = TemplateEngine::new();
        let err = engine.render_value(&json!("{{ missing }}"), &TemplateVars::new());
        assert!(matches!(err, Err(TemplateError::Undefined { .. })));
        let err = engine.render_str("x {{ missing }} y", &TemplateVars::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_render_default_filter_on_undefined() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine
                .render_str("{{ missing | default('info') }}", &TemplateVars::new())
                .unwrap(),
            "info"
        );
    }

    #[test]
    fn test_conditions() {
        let engine = TemplateEngine::new();
        let v = vars(json!({
            "inventory_hostname": "ubu1",
            "probe": {"rc": 0, "changed": false, "failed": false},
            "ansible_facts": {"packages": {"nginx": [{"version": "1.18"}]}}
        }));

        assert!(engine.evaluate_condition("inventory_hostname == 'ubu1'", &v).unwrap());
        assert!(!engine.evaluate_condition("inventory_hostname == 'ubu2'", &v).unwrap());
        assert!(engine.evaluate_condition("probe.rc == 0 and probe is defined", &v).unwrap());
        assert!(engine.evaluate_condition("'nginx' in ansible_facts.packages", &v).unwrap());
        assert!(engine.evaluate_condition("'apache2' not in ansible_facts.packages", &v).unwrap());
        assert!(engine.evaluate_condition("probe is succeeded", &v).unwrap());
        assert!(!engine.evaluate_condition("probe is changed", &v).unwrap());
        assert!(engine.evaluate_condition("{{ probe.rc == 0 }}", &v).unwrap());
    }

    #[test]
    fn test_undefined_is_false_in_conditions() {
        let engine = TemplateEngine::new();
        let v = vars(json!({"probe": {"results": []}}));

        assert!(!engine.evaluate_condition("ghost is defined", &v).unwrap());
        assert!(engine.evaluate_condition("ghost is not defined", &v).unwrap());
        assert!(!engine.evaluate_condition("ghost", &v).unwrap());
        assert!(!engine.evaluate_condition("ghost.rc == 0", &v).unwrap());
        assert!(!engine.evaluate_condition("probe.results[0].rc == 0", &v).unwrap());
        assert!(!engine.evaluate_condition("ghost == 'x' or ghost.a.b", &v).unwrap());
    }

    #[test]
    fn test_comparisons_with_undefined_are_false() {
        let engine = TemplateEngine::new();
        let v = vars(json!({
            "probe": {"results": [{"skipped": true, "item": "cups"}]},
            "idx": 0,
            "ports": [22, 80]
        }));

        for condition in [
            "ghost != 4",
            "probe.results[0].rc != 4",
            "probe.results[idx].rc != 4",
            "ghost < 3",
            "ghost > 3",
            "ghost <= 3",
            "3 >= ghost",
            "'x' not in ghost",
            "'x' in ghost",
            "ghost not in ports",
            "(ghost != 1) and true",
            "[ghost != 1] | first",
        ] {
            assert!(
                !engine.evaluate_condition(condition, &v).unwrap(),
                "{} should be false",
                condition
            );
        }

        assert!(engine.evaluate_condition("22 in ports and 23 not in ports", &v).unwrap());
        assert!(engine.evaluate_condition("ghost is not defined or ghost != 1", &v).unwrap());
        assert!(engine.evaluate_condition("not ghost == 1", &v).unwrap());
        assert!(engine.evaluate_condition("ports | length != 3", &v).unwrap());
        assert!(engine
            .evaluate_condition("probe.results | selectattr('skipped') | list | length == 1", &v)
            .unwrap());
    }

    #[test]
    fn test_guard_preserves_expression_text() {
        assert_eq!(guard_comparisons("probe is defined"), "probe is defined");
        assert_eq!(
            guard_comparisons("a.rc is defined and a.rc != 4"),
            "a.rc is defined and ((a.rc) is defined and (4) is defined and (a.rc) != (4))"
        );
        assert_eq!(
            guard_comparisons("'x' not in names"),
            "(('x') is defined and (names) is defined and ('x') not in (names))"
        );
        assert_eq!(guard_comparisons("x is not none"), "x is not none");
        assert_eq!(guard_comparisons("(a == 'x)"), "(a == 'x)");
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let engine = TemplateEngine::new();
        assert!(engine
            .evaluate_condition("a ==", &TemplateVars::new())
            .is_err());
    }
}
