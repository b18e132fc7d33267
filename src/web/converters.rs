//! Typed conversion of captured route arguments.
//!
//! A [`Converter`] holds an ordered list of target types. Conversion is
//! attempted in declaration order and the first type that accepts the input
//! wins; when none does, an optional default is returned, and without a
//! default the conversion fails into the endpoint's error pipeline.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A converted argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str(""),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
        }
    }
}

/// A conversion target, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Int,
    Float,
    Bool,
    Str,
}

impl Target {
    fn apply(self, raw: &str) -> Option<Value> {
        match self {
            Target::Int => raw.parse().ok().map(Value::Int),
            Target::Float => raw.parse().ok().map(Value::Float),
            Target::Bool => raw.parse().ok().map(Value::Bool),
            Target::Str => Some(Value::Str(raw.to_owned())),
        }
    }
}

/// User-supplied cache wrapped around a converter.
///
/// Consulted before conversion; stores after a successful conversion.
pub trait ConverterCache {
    fn lookup(&self, raw: &str) -> Option<Value>;
    fn store(&self, raw: &str, value: &Value);
}

/// A simple unbounded memoization cache.
#[derive(Default)]
pub struct MemoCache {
    map: RefCell<HashMap<String, Value>>,
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("entries", &self.map.borrow().len())
            .finish()
    }
}

impl MemoCache {
    pub fn new() -> MemoCache {
        MemoCache::default()
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }
}

impl ConverterCache for MemoCache {
    fn lookup(&self, raw: &str) -> Option<Value> {
        self.map.borrow().get(raw).cloned()
    }

    fn store(&self, raw: &str, value: &Value) {
        self.map.borrow_mut().insert(raw.to_owned(), value.clone());
    }
}

/// Converts one captured route argument.
#[derive(Clone)]
pub struct Converter {
    targets: Vec<Target>,
    default: Option<Value>,
    cache: Option<Rc<dyn ConverterCache>>,
}

impl Converter {
    /// Conversion is attempted against `targets` in order.
    pub fn new<I: IntoIterator<Item = Target>>(targets: I) -> Converter {
        Converter {
            targets: targets.into_iter().collect(),
            default: None,
            cache: None,
        }
    }

    /// The identity converter: hands the raw string through.
    pub fn identity() -> Converter {
        Converter::new([Target::Str])
    }

    /// Value returned when no target accepts the input.
    pub fn or_default(mut self, value: Value) -> Converter {
        self.default = Some(value);
        self
    }

    /// Wraps the converter with a user-supplied cache.
    pub fn cached(mut self, cache: Rc<dyn ConverterCache>) -> Converter {
        self.cache = Some(cache);
        self
    }

    /// Derives the converter for a placeholder from its template converter
    /// name: `{x:int}` already names the target type; everything else
    /// captures a string.
    pub(crate) fn from_template(converter: &str) -> Converter {
        match converter.to_ascii_lowercase().as_str() {
            "int" => Converter::new([Target::Int]),
            _ => Converter::identity(),
        }
    }

    pub fn convert(&self, raw: &str) -> crate::Result<Value> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(raw) {
                return Ok(hit);
            }
        }
        for target in &self.targets {
            if let Some(value) = target.apply(raw) {
                if let Some(cache) = &self.cache {
                    cache.store(raw, &value);
                }
                return Ok(value);
            }
        }
        if let Some(default) = &self.default {
            return Ok(default.clone());
        }
        Err(crate::Error::new_user_convert(ConversionFailure {
            raw: raw.to_owned(),
            targets: self.targets.clone(),
        }))
    }
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("targets", &self.targets)
            .field("default", &self.default)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// No target accepted the input and no default was available.
#[derive(Debug)]
pub struct ConversionFailure {
    raw: String,
    targets: Vec<Target>,
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot convert {:?} to any of the types {:?}",
            self.raw, self.targets
        )
    }
}

impl std::error::Error for ConversionFailure {}
