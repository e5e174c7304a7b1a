//! Filter and set expressions.
//!
//! Mapping entries may carry a boolean filter (`id > 5 && status != 'draft'`)
//! and per-column set expressions (`name.upperAscii()`). Both are compiled
//! once per mapping refresh against an [`Environment`] describing the source
//! columns and evaluated per change against a row of [`Value`]s. The engine
//! sits behind [`ExpressionEngine`], so a different evaluator can be plugged
//! in.
//!
//! [`CelEngine`] evaluates [CEL](https://github.com/google/cel-spec) through
//! `cel-interpreter`, with its standard functions plus `lowerAscii`,
//! `upperAscii` and `trim`. Every identifier an expression reads must be a
//! declared column or `now`, the evaluation timestamp.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cel_interpreter::extractors::This;
use cel_interpreter::{Context, Program as CelProgram, Value as CelValue};
use chrono::{DateTime, Utc};

use crate::error::{Result, StreamerError};
use crate::value::{Row, Value, ValueType};

/// Name of the injected current-timestamp variable.
pub const NOW: &str = "now";

/// Typed variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, ValueType>,
}

impl Environment {
    /// An environment holding only `now`.
    pub fn new() -> Self {
        let mut env = Self::default();
        env.declare(NOW, ValueType::Timestamp);
        env
    }

    pub fn declare(&mut self, name: &str, ty: ValueType) {
        self.vars.insert(name.to_string(), ty);
    }

    pub fn with(mut self, name: &str, ty: ValueType) -> Self {
        self.declare(name, ty);
        self
    }

    pub fn get(&self, name: &str) -> Option<ValueType> {
        self.vars.get(name).copied()
    }
}

/// Values an expression is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    row: &'a Row,
    now: DateTime<Utc>,
}

impl<'a> Bindings<'a> {
    pub fn new(row: &'a Row, now: DateTime<Utc>) -> Self {
        Self { row, now }
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        match self.row.get(name) {
            Some(v) => Some(v.clone()),
            None if name == NOW => Some(Value::Timestamp(self.now)),
            None => None,
        }
    }
}

/// A compiled expression.
pub trait Program: Send + Sync + fmt::Debug {
    fn eval(&self, bindings: &Bindings<'_>) -> Result<Value>;
}

/// Compiles expression text against an environment.
pub trait ExpressionEngine: Send + Sync {
    fn compile(&self, source: &str, env: &Environment) -> Result<Arc<dyn Program>>;
}

/// CEL through `cel-interpreter`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CelEngine;

impl ExpressionEngine for CelEngine {
    fn compile(&self, source: &str, env: &Environment) -> Result<Arc<dyn Program>> {
        let program = CelProgram::compile(source)
            .map_err(|e| StreamerError::Expression(format!("{e}")))?;

        let references = program.references();
        let mut unknown: Vec<&str> = references
            .variables()
            .into_iter()
            .filter(|name| env.get(name).is_none())
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(StreamerError::Expression(format!(
                "undeclared reference to {}",
                unknown.join(", ")
            )));
        }

        let columns = references
            .variables()
            .into_iter()
            .map(str::to_string)
            .collect();
        Ok(Arc::new(Compiled {
            source: source.to_string(),
            program,
            columns,
        }))
    }
}

struct Compiled {
    source: String,
    program: CelProgram,
    columns: Vec<String>,
}

impl fmt::Debug for Compiled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compiled").field("source", &self.source).finish()
    }
}

impl Program for Compiled {
    fn eval(&self, bindings: &Bindings<'_>) -> Result<Value> {
        let mut ctx = context();
        // absent columns (unchanged TOAST) stay unbound and fail at eval
        for name in &self.columns {
            if let Some(value) = bindings.lookup(name) {
                ctx.add_variable_from_value(name.as_str(), to_cel(value));
            }
        }
        let out = self
            .program
            .execute(&ctx)
            .map_err(|e| StreamerError::Expression(format!("{e} (in `{}`)", self.source)))?;
        from_cel(out).map_err(|e| match e {
            StreamerError::Expression(msg) => {
                StreamerError::Expression(format!("{msg} (in `{}`)", self.source))
            }
            other => other,
        })
    }
}

fn context() -> Context<'static> {
    let mut ctx = Context::default();
    ctx.add_function("lowerAscii", |This(s): This<Arc<String>>| s.to_lowercase());
    ctx.add_function("upperAscii", |This(s): This<Arc<String>>| s.to_uppercase());
    ctx.add_function("trim", |This(s): This<Arc<String>>| s.trim().to_string());
    ctx
}

fn to_cel(value: Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(b),
        Value::Int(i) => CelValue::Int(i),
        Value::Float(f) => CelValue::Float(f),
        Value::String(s) => CelValue::String(Arc::new(s)),
        Value::Bytes(b) => CelValue::Bytes(Arc::new(b)),
        Value::Timestamp(t) => CelValue::Timestamp(t.fixed_offset()),
    }
}

fn from_cel(value: CelValue) -> Result<Value> {
    Ok(match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::Bool(b),
        CelValue::Int(i) => Value::Int(i),
        CelValue::UInt(u) => Value::Int(i64::try_from(u).map_err(|_| {
            StreamerError::Expression(format!("result {u} does not fit a bigint"))
        })?),
        CelValue::Float(f) => Value::Float(f),
        CelValue::String(s) => Value::String(s.as_str().to_string()),
        CelValue::Bytes(b) => Value::Bytes(b.as_slice().to_vec()),
        CelValue::Timestamp(t) => Value::Timestamp(t.with_timezone(&Utc)),
        other => {
            return Err(StreamerError::Expression(format!(
                "unsupported result {other:?}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn env() -> Environment {
        Environment::new()
            .with("id", ValueType::Int)
            .with("name", ValueType::String)
            .with("price", ValueType::Float)
            .with("created", ValueType::Timestamp)
            .with("active", ValueType::Bool)
    }

    fn row(id: i64, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), Value::Int(id));
        r.insert("name".into(), Value::String(name.into()));
        r.insert("price".into(), Value::Float(2.5));
        r.insert("active".into(), Value::Bool(true));
        r
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn run(src: &str, row: &Row) -> Result<Value> {
        CelEngine.compile(src, &env())?.eval(&Bindings::new(row, now()))
    }

    // ==================== compile tests ====================

    #[test]
    fn unknown_column_is_compile_error() {
        let err = CelEngine.compile("idd > 5 || zz", &env()).unwrap_err();
        assert!(matches!(err, StreamerError::Expression(_)));
        assert!(err.to_string().contains("idd, zz"), "{err}");
    }

    #[test]
    fn syntax_errors_fail_compile() {
        assert!(CelEngine.compile("id > ", &env()).is_err());
        assert!(CelEngine.compile("(id", &env()).is_err());
        assert!(CelEngine.compile("id > 5 && active", &env()).is_ok());
    }

    // ==================== evaluation tests ====================

    #[test]
    fn evaluates_filters() {
        assert_eq!(run("id > 5", &row(6, "a")).unwrap(), Value::Bool(true));
        assert_eq!(run("id > 5", &row(5, "a")).unwrap(), Value::Bool(false));
        assert_eq!(
            run("name in ['a', 'b'] && price < 3.0", &row(1, "b")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            run("name.startsWith('ab') || name.matches('^z+$')", &row(1, "zzz")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn evaluates_transforms() {
        assert_eq!(
            run("name.upperAscii() + '-' + string(id * 2)", &row(21, "x")).unwrap(),
            Value::String("X-42".into())
        );
        assert_eq!(
            run("trim(name).lowerAscii()", &row(1, "  AbC ")).unwrap(),
            Value::String("abc".into())
        );
        assert_eq!(run("active ? 1 : 0", &row(5, "x")).unwrap(), Value::Int(1));
        assert_eq!(run("size(name)", &row(5, "xyz")).unwrap(), Value::Int(3));
    }

    #[test]
    fn now_is_injected() {
        assert_eq!(run("now", &row(1, "a")).unwrap(), Value::Timestamp(now()));
        assert_eq!(
            run("now > timestamp('2024-01-01T00:00:00Z')", &row(1, "a")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn runtime_errors_are_reported() {
        let err = run("name + 1", &row(1, "a")).unwrap_err();
        assert!(err.to_string().contains("name + 1"), "{err}");
        // column declared but absent from the change (unchanged TOAST)
        let err = run("created > now", &row(1, "a")).unwrap_err();
        assert!(err.to_string().contains("created"), "{err}");
        assert!(run("[id, 2]", &row(1, "a")).is_err());
    }
}
