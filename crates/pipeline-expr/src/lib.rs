// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Expression compiler and evaluator for the pipeline's filter and
//! enrichment rules.
//!
//! Two evaluation modes share one grammar and one tree-walking evaluator:
//! - **Filter mode** must type-check to a boolean over `{id, source,
//!   timestamp, payload, metadata}`.
//! - **Transform mode** returns a dynamic value over the same variables plus
//!   `source_data` (the record fetched by an enrichment provider).
//!
//! Compilation (`compile`) is pure syntax plus root-identifier resolution
//! against the fixed schema; it never touches an envelope. Evaluation
//! (`evaluate_filter` / `evaluate_transform`) is a deterministic tree walk: no
//! network, file, or clock access beyond the `timestamp` variable already
//! bound in the context.

mod lexer;
mod parser;

use pipeline_error::{ErrorCode, PipelineError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

pub use lexer::LexError;
pub use parser::ParseError;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `in`
    In,
}

/// A node of the compiled expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal value (string, number, bool, null, or array literal).
    Literal(Value),
    /// A bare identifier, resolved against the root variable bindings.
    Ident(String),
    /// Field access `base.name`.
    Field(Box<Expr>, String),
    /// Index access `base[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// Substring/subarray slice `base[start:end]`; either bound may be absent.
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    /// Logical negation `!inner`.
    Not(Box<Expr>),
    /// Arithmetic negation `-inner`.
    Neg(Box<Expr>),
    /// A binary operator application.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// A free function call: `has(x)`, `size(x)`, `indexOf(a, b)`,
    /// `upperAscii(x)`, `lowerAscii(x)`.
    Call(String, Vec<Expr>),
    /// A method-style call: `x.contains(y)`, `x.startsWith(y)`,
    /// `x.endsWith(y)`, `x.matches(y)`.
    MethodCall(Box<Expr>, String, Vec<Expr>),
    /// Ternary conditional `cond ? then : else_`.
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// A compiled, ready-to-evaluate expression.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    root: Expr,
}

impl CompiledExpr {
    /// The original expression source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The fixed root variable schema an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `{id, source, timestamp, payload, metadata}` — filter expressions.
    Filter,
    /// `{id, source, timestamp, payload, metadata, source_data}` —
    /// enrichment transform expressions.
    Transform,
}

impl Schema {
    fn allowed_roots(self) -> &'static [&'static str] {
        match self {
            Schema::Filter => &["id", "source", "timestamp", "payload", "metadata"],
            Schema::Transform => &[
                "id",
                "source",
                "timestamp",
                "payload",
                "metadata",
                "source_data",
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile and validate `source` against `schema`.
///
/// Returns [`ErrorCode::ExprCompileError`] on a syntax error or a reference to
/// an identifier outside the fixed schema. This is the only check a rule
/// repository needs before accepting a new rule — it never touches an
/// envelope.
pub fn validate(source: &str, schema: Schema) -> Result<CompiledExpr, PipelineError> {
    compile(source, schema)
}

/// Compile `source` into a [`CompiledExpr`], checking root-identifier
/// resolution against `schema`.
pub fn compile(source: &str, schema: Schema) -> Result<CompiledExpr, PipelineError> {
    let tokens = lexer::tokenize(source).map_err(|e| {
        PipelineError::new(ErrorCode::ExprCompileError, e.to_string())
            .with_context("source", source)
    })?;
    let root = parser::parse(&tokens).map_err(|e| {
        PipelineError::new(ErrorCode::ExprCompileError, e.to_string())
            .with_context("source", source)
    })?;

    let mut roots = BTreeSet::new();
    collect_root_idents(&root, &mut roots);
    let allowed = schema.allowed_roots();
    for r in &roots {
        if !allowed.contains(&r.as_str()) {
            return Err(PipelineError::new(
                ErrorCode::ExprCompileError,
                format!("unknown identifier '{r}'"),
            )
            .with_context("source", source)
            .with_context("allowed", allowed));
        }
    }

    Ok(CompiledExpr {
        source: source.to_string(),
        root,
    })
}

fn collect_root_idents(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ident(name) => {
            out.insert(name.clone());
        }
        Expr::Field(base, _) | Expr::Not(base) | Expr::Neg(base) => collect_root_idents(base, out),
        Expr::Index(base, idx) => {
            collect_root_idents(base, out);
            collect_root_idents(idx, out);
        }
        Expr::Slice(base, start, end) => {
            collect_root_idents(base, out);
            if let Some(s) = start {
                collect_root_idents(s, out);
            }
            if let Some(e) = end {
                collect_root_idents(e, out);
            }
        }
        Expr::Binary(_, lhs, rhs) => {
            collect_root_idents(lhs, out);
            collect_root_idents(rhs, out);
        }
        Expr::Call(_, args) => {
            for a in args {
                collect_root_idents(a, out);
            }
        }
        Expr::MethodCall(base, _, args) => {
            collect_root_idents(base, out);
            for a in args {
                collect_root_idents(a, out);
            }
        }
        Expr::Ternary(cond, then, else_) => {
            collect_root_idents(cond, out);
            collect_root_idents(then, out);
            collect_root_idents(else_, out);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// The variable bindings available to an expression during evaluation.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    /// Envelope id.
    pub id: &'a str,
    /// Envelope source.
    pub source: &'a str,
    /// Envelope timestamp, bound as an RFC 3339 string.
    pub timestamp: &'a str,
    /// Envelope payload.
    pub payload: &'a Value,
    /// Envelope metadata.
    pub metadata: &'a Value,
    /// The record fetched by an enrichment provider; only bound in transform
    /// mode.
    pub source_data: Option<&'a Value>,
}

impl<'a> EvalContext<'a> {
    fn lookup_root(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "source" => Some(Value::String(self.source.to_string())),
            "timestamp" => Some(Value::String(self.timestamp.to_string())),
            "payload" => Some(self.payload.clone()),
            "metadata" => Some(self.metadata.clone()),
            "source_data" => self.source_data.cloned(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a filter expression; the result must be a boolean.
pub fn evaluate_filter(expr: &CompiledExpr, ctx: &EvalContext<'_>) -> Result<bool, PipelineError> {
    match eval(&expr.root, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(runtime_error(
            expr,
            format!("filter expression must evaluate to a boolean, got {other}"),
        )),
    }
}

/// Evaluate a transform expression; the result may be any value.
pub fn evaluate_transform(
    expr: &CompiledExpr,
    ctx: &EvalContext<'_>,
) -> Result<Value, PipelineError> {
    eval(&expr.root, ctx)
}

fn runtime_error(expr: &CompiledExpr, message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::ExprRuntimeError, message).with_context("source", &expr.source)
}

fn eval(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, PipelineError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => ctx
            .lookup_root(name)
            .ok_or_else(|| rt_err(format!("unbound identifier '{name}'"))),
        Expr::Field(base, name) => {
            let v = eval(base, ctx)?;
            match v.get(name) {
                Some(inner) => Ok(inner.clone()),
                None => Ok(Value::Null),
            }
        }
        Expr::Index(base, idx) => {
            let v = eval(base, ctx)?;
            let i = eval(idx, ctx)?;
            index_value(&v, &i)
        }
        Expr::Slice(base, start, end) => {
            let v = eval(base, ctx)?;
            let s = start.as_deref().map(|e| eval(e, ctx)).transpose()?;
            let e = end.as_deref().map(|e| eval(e, ctx)).transpose()?;
            slice_value(&v, s.as_ref(), e.as_ref())
        }
        Expr::Not(inner) => {
            let v = eval(inner, ctx)?;
            Ok(Value::Bool(!as_bool(&v)?))
        }
        Expr::Neg(inner) => {
            let v = eval(inner, ctx)?;
            Ok(Value::from(-as_number(&v)?))
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
        Expr::Call(name, args) => eval_call(name, args, ctx),
        Expr::MethodCall(base, name, args) => eval_method_call(base, name, args, ctx),
        Expr::Ternary(cond, then, else_) => {
            if as_bool(&eval(cond, ctx)?)? {
                eval(then, ctx)
            } else {
                eval(else_, ctx)
            }
        }
    }
}

fn rt_err(message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::ExprRuntimeError, message)
}

fn as_bool(v: &Value) -> Result<bool, PipelineError> {
    v.as_bool()
        .ok_or_else(|| rt_err(format!("expected boolean, got {v}")))
}

fn as_number(v: &Value) -> Result<f64, PipelineError> {
    v.as_f64()
        .ok_or_else(|| rt_err(format!("expected number, got {v}")))
}

fn as_str(v: &Value) -> Result<&str, PipelineError> {
    v.as_str()
        .ok_or_else(|| rt_err(format!("expected string, got {v}")))
}

fn index_value(base: &Value, idx: &Value) -> Result<Value, PipelineError> {
    match (base, idx) {
        (Value::Array(arr), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| rt_err("array index must be an integer"))?;
            let i = normalize_index(i, arr.len());
            Ok(arr.get(i).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        (other, _) => Err(rt_err(format!("cannot index into {other}"))),
    }
}

fn normalize_index(i: i64, len: usize) -> usize {
    if i < 0 {
        (len as i64 + i).max(0) as usize
    } else {
        i as usize
    }
}

fn slice_value(
    base: &Value,
    start: Option<&Value>,
    end: Option<&Value>,
) -> Result<Value, PipelineError> {
    match base {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (s_idx, e_idx) = slice_bounds(chars.len(), start, end)?;
            Ok(Value::String(chars[s_idx..e_idx].iter().collect()))
        }
        Value::Array(arr) => {
            let (s_idx, e_idx) = slice_bounds(arr.len(), start, end)?;
            Ok(Value::Array(arr[s_idx..e_idx].to_vec()))
        }
        other => Err(rt_err(format!("cannot slice {other}"))),
    }
}

fn slice_bounds(
    len: usize,
    start: Option<&Value>,
    end: Option<&Value>,
) -> Result<(usize, usize), PipelineError> {
    let s = match start {
        Some(v) => normalize_index(as_number(v)? as i64, len),
        None => 0,
    };
    let e = match end {
        Some(v) => normalize_index(as_number(v)? as i64, len),
        None => len,
    };
    let s = s.min(len);
    let e = e.clamp(s, len);
    Ok((s, e))
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, ctx: &EvalContext<'_>) -> Result<Value, PipelineError> {
    // Short-circuit logical operators.
    if matches!(op, BinaryOp::And) {
        if !as_bool(&eval(lhs, ctx)?)? {
            return Ok(Value::Bool(false));
        }
        return Ok(Value::Bool(as_bool(&eval(rhs, ctx)?)?));
    }
    if matches!(op, BinaryOp::Or) {
        if as_bool(&eval(lhs, ctx)?)? {
            return Ok(Value::Bool(true));
        }
        return Ok(Value::Bool(as_bool(&eval(rhs, ctx)?)?));
    }

    let l = eval(lhs, ctx)?;
    let r = eval(rhs, ctx)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt => Ok(Value::Bool(as_number(&l)? < as_number(&r)?)),
        BinaryOp::Le => Ok(Value::Bool(as_number(&l)? <= as_number(&r)?)),
        BinaryOp::Gt => Ok(Value::Bool(as_number(&l)? > as_number(&r)?)),
        BinaryOp::Ge => Ok(Value::Bool(as_number(&l)? >= as_number(&r)?)),
        BinaryOp::Add => numeric_or_string_add(&l, &r),
        BinaryOp::Sub => Ok(Value::from(as_number(&l)? - as_number(&r)?)),
        BinaryOp::Mul => Ok(Value::from(as_number(&l)? * as_number(&r)?)),
        BinaryOp::Div => {
            let denom = as_number(&r)?;
            if denom == 0.0 {
                return Err(rt_err("division by zero"));
            }
            Ok(Value::from(as_number(&l)? / denom))
        }
        BinaryOp::In => Ok(Value::Bool(membership(&l, &r)?)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn numeric_or_string_add(l: &Value, r: &Value) -> Result<Value, PipelineError> {
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    Ok(Value::from(as_number(l)? + as_number(r)?))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    l == r
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, PipelineError> {
    match haystack {
        Value::Array(arr) => Ok(arr.iter().any(|v| values_equal(v, needle))),
        Value::Object(map) => {
            let key = as_str(needle)?;
            Ok(map.contains_key(key))
        }
        Value::String(s) => {
            let needle_str = as_str(needle)?;
            Ok(s.contains(needle_str))
        }
        other => Err(rt_err(format!("'in' requires an array, object, or string, got {other}"))),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<Value, PipelineError> {
    match name {
        "__array" => {
            let mut out = Vec::with_capacity(args.len());
            for a in args {
                out.push(eval(a, ctx)?);
            }
            Ok(Value::Array(out))
        }
        "has" => {
            let [arg] = args else {
                return Err(rt_err("has() takes exactly one argument"));
            };
            Ok(Value::Bool(!matches!(eval(arg, ctx)?, Value::Null)))
        }
        "size" => {
            let [arg] = args else {
                return Err(rt_err("size() takes exactly one argument"));
            };
            let v = eval(arg, ctx)?;
            size_of(&v)
        }
        "indexOf" => {
            let [haystack, needle] = args else {
                return Err(rt_err("indexOf() takes exactly two arguments"));
            };
            let h = eval(haystack, ctx)?;
            let n = eval(needle, ctx)?;
            let s = as_str(&h)?;
            let needle_str = as_str(&n)?;
            Ok(match s.find(needle_str) {
                Some(byte_idx) => Value::from(s[..byte_idx].chars().count() as i64),
                None => Value::from(-1i64),
            })
        }
        "upperAscii" => {
            let [arg] = args else {
                return Err(rt_err("upperAscii() takes exactly one argument"));
            };
            let v = eval(arg, ctx)?;
            Ok(Value::String(as_str(&v)?.to_ascii_uppercase()))
        }
        "lowerAscii" => {
            let [arg] = args else {
                return Err(rt_err("lowerAscii() takes exactly one argument"));
            };
            let v = eval(arg, ctx)?;
            Ok(Value::String(as_str(&v)?.to_ascii_lowercase()))
        }
        other => Err(rt_err(format!("unknown function '{other}'"))),
    }
}

fn size_of(v: &Value) -> Result<Value, PipelineError> {
    match v {
        Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
        Value::Array(a) => Ok(Value::from(a.len() as i64)),
        Value::Object(m) => Ok(Value::from(m.len() as i64)),
        other => Err(rt_err(format!("size() requires a string, array, or object, got {other}"))),
    }
}

fn eval_method_call(
    base: &Expr,
    name: &str,
    args: &[Expr],
    ctx: &EvalContext<'_>,
) -> Result<Value, PipelineError> {
    let base_val = eval(base, ctx)?;
    let base_str = as_str(&base_val)?;
    match name {
        "contains" => {
            let [arg] = args else {
                return Err(rt_err("contains() takes exactly one argument"));
            };
            let needle = eval(arg, ctx)?;
            Ok(Value::Bool(base_str.contains(as_str(&needle)?)))
        }
        "startsWith" => {
            let [arg] = args else {
                return Err(rt_err("startsWith() takes exactly one argument"));
            };
            let needle = eval(arg, ctx)?;
            Ok(Value::Bool(base_str.starts_with(as_str(&needle)?)))
        }
        "endsWith" => {
            let [arg] = args else {
                return Err(rt_err("endsWith() takes exactly one argument"));
            };
            let needle = eval(arg, ctx)?;
            Ok(Value::Bool(base_str.ends_with(as_str(&needle)?)))
        }
        "matches" => {
            let [arg] = args else {
                return Err(rt_err("matches() takes exactly one argument"));
            };
            let pattern = eval(arg, ctx)?;
            let re = regex::Regex::new(as_str(&pattern)?)
                .map_err(|e| rt_err(format!("invalid regex: {e}")))?;
            Ok(Value::Bool(re.is_match(base_str)))
        }
        other => Err(rt_err(format!("unknown method '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(payload: &'a Value, metadata: &'a Value) -> EvalContext<'a> {
        EvalContext {
            id: "m1",
            source: "svc",
            timestamp: "2026-01-01T00:00:00Z",
            payload,
            metadata,
            source_data: None,
        }
    }

    #[test]
    fn equality_on_payload_field() {
        let payload = json!({"status": "active"});
        let metadata = json!({});
        let expr = compile("payload.status == 'active'", Schema::Filter).unwrap();
        assert!(evaluate_filter(&expr, &ctx(&payload, &metadata)).unwrap());
    }

    #[test]
    fn logical_and_or_not() {
        let payload = json!({"a": true, "b": false});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert!(!evaluate_filter(
            &compile("payload.a && payload.b", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
        assert!(evaluate_filter(
            &compile("payload.a || payload.b", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
        assert!(evaluate_filter(&compile("!payload.b", Schema::Filter).unwrap(), &c).unwrap());
    }

    #[test]
    fn ordering_on_numerics() {
        let payload = json!({"count": 5});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert!(evaluate_filter(&compile("payload.count > 3", Schema::Filter).unwrap(), &c).unwrap());
        assert!(!evaluate_filter(&compile("payload.count < 3", Schema::Filter).unwrap(), &c).unwrap());
    }

    #[test]
    fn string_contains_starts_ends_matches() {
        let payload = json!({"name": "hello-world"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert!(evaluate_filter(
            &compile("payload.name.contains('world')", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
        assert!(evaluate_filter(
            &compile("payload.name.startsWith('hello')", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
        assert!(evaluate_filter(
            &compile("payload.name.endsWith('world')", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
        assert!(evaluate_filter(
            &compile("payload.name.matches('^hello.*')", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
    }

    #[test]
    fn size_index_of_case_functions() {
        let payload = json!({"name": "Hello"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert_eq!(
            evaluate_transform(&compile("size(payload.name)", Schema::Transform).unwrap(), &c).unwrap(),
            json!(5)
        );
        assert_eq!(
            evaluate_transform(
                &compile("indexOf(payload.name, 'llo')", Schema::Transform).unwrap(),
                &c
            )
            .unwrap(),
            json!(2)
        );
        assert_eq!(
            evaluate_transform(&compile("upperAscii(payload.name)", Schema::Transform).unwrap(), &c)
                .unwrap(),
            json!("HELLO")
        );
        assert_eq!(
            evaluate_transform(&compile("lowerAscii(payload.name)", Schema::Transform).unwrap(), &c)
                .unwrap(),
            json!("hello")
        );
    }

    #[test]
    fn membership_in_array() {
        let payload = json!({"status": "active"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert!(evaluate_filter(
            &compile("payload.status in ['active', 'pending']", Schema::Filter).unwrap(),
            &c
        )
        .unwrap());
    }

    #[test]
    fn field_presence_has() {
        let payload = json!({"status": "active"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert!(evaluate_filter(&compile("has(payload.status)", Schema::Filter).unwrap(), &c).unwrap());
        assert!(!evaluate_filter(&compile("has(payload.missing)", Schema::Filter).unwrap(), &c).unwrap());
    }

    #[test]
    fn arithmetic_and_ternary() {
        let payload = json!({"count": 3});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert_eq!(
            evaluate_transform(&compile("payload.count * 2 + 1", Schema::Transform).unwrap(), &c)
                .unwrap(),
            json!(7.0)
        );
        assert_eq!(
            evaluate_transform(
                &compile("payload.count > 2 ? 'big' : 'small'", Schema::Transform).unwrap(),
                &c
            )
            .unwrap(),
            json!("big")
        );
    }

    #[test]
    fn substring_slice() {
        let payload = json!({"name": "hello-world"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        assert_eq!(
            evaluate_transform(&compile("payload.name[0:5]", Schema::Transform).unwrap(), &c).unwrap(),
            json!("hello")
        );
        assert_eq!(
            evaluate_transform(&compile("payload.name[6:]", Schema::Transform).unwrap(), &c).unwrap(),
            json!("world")
        );
    }

    #[test]
    fn missing_field_is_null_not_error() {
        let payload = json!({"status": "active"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        let v = evaluate_transform(&compile("payload.nonexistent", Schema::Transform).unwrap(), &c)
            .unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn runtime_error_on_null_comparison() {
        let payload = json!({"status": "active"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        let err = evaluate_filter(
            &compile("payload.nonexistent.field == 'x'", Schema::Filter).unwrap(),
            &c,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExprRuntimeError);
    }

    #[test]
    fn compile_rejects_unknown_identifier() {
        let err = compile("bogus == 1", Schema::Filter).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExprCompileError);
    }

    #[test]
    fn compile_rejects_source_data_in_filter_schema() {
        let err = compile("source_data == 1", Schema::Filter).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExprCompileError);
    }

    #[test]
    fn transform_schema_allows_source_data() {
        let payload = json!({});
        let metadata = json!({});
        let source_data = json!({"name": "John"});
        let mut c = ctx(&payload, &metadata);
        c.source_data = Some(&source_data);
        let expr = compile("source_data.name", Schema::Transform).unwrap();
        assert_eq!(evaluate_transform(&expr, &c).unwrap(), json!("John"));
    }

    #[test]
    fn compile_rejects_syntax_error() {
        let err = compile("payload.status ==", Schema::Filter).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExprCompileError);
    }

    #[test]
    fn filter_must_return_boolean() {
        let payload = json!({"name": "x"});
        let metadata = json!({});
        let c = ctx(&payload, &metadata);
        let err = evaluate_filter(&compile("payload.name", Schema::Filter).unwrap(), &c).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExprRuntimeError);
    }

    proptest::proptest! {
        #[test]
        fn equality_is_reflexive_for_numbers(n in -1000i64..1000) {
            let payload = json!({"n": n});
            let metadata = json!({});
            let c = ctx(&payload, &metadata);
            let expr = compile("payload.n == payload.n", Schema::Filter).unwrap();
            proptest::prop_assert!(evaluate_filter(&expr, &c).unwrap());
        }
    }
}
