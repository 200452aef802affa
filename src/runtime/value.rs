//! Uniform runtime value model.
//!
//! The interpreter, dispatcher, and field store all traffic in `Value`, so
//! `box`/`unbox.any`/`castclass` become checked coercions rather than layout
//! changes. Object identity is `Arc` identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::runtime::lock;

pub type ObjRef = Arc<Instance>;
pub type ArrRef = Arc<Mutex<Vec<Value>>>;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i32),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Obj(ObjRef),
    Arr(ArrRef),
    /// Result of `ldtoken` on a type: the type's full name.
    TypeHandle(Arc<str>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Obj(o) => &o.type_name,
            Value::Arr(_) => "object[]",
            Value::TypeHandle(_) => "<type>",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => f.write_str(s),
            Value::Obj(o) => f.write_str(&o.type_name),
            Value::Arr(a) => write!(f, "object[{}]", lock(a).len()),
            Value::TypeHandle(t) => write!(f, "typeof({t})"),
        }
    }
}

/// Identity-based equality for `ceq`: primitives by value, strings by
/// content, objects by reference.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => Arc::ptr_eq(x, y),
        (Value::Arr(x), Value::Arr(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// A live object: a component or any other class instance.
#[derive(Debug)]
pub struct Instance {
    pub type_name: String,
    fields: Mutex<HashMap<String, Value>>,
}

impl Instance {
    /// Fresh instance with the declared instance fields zeroed.
    pub fn new(type_name: impl Into<String>, declared: &[(String, String)]) -> ObjRef {
        let mut fields = HashMap::new();
        for (name, ty) in declared {
            fields.insert(name.clone(), zero_value(ty));
        }
        Arc::new(Instance { type_name: type_name.into(), fields: Mutex::new(fields) })
    }

    pub fn get_field(&self, name: &str) -> Value {
        lock(&self.fields).get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_field(&self, name: &str, value: Value) {
        lock(&self.fields).insert(name.to_string(), value);
    }
}

/// Whether a type name denotes a value type in the image's type system.
pub fn is_value_type(name: &str) -> bool {
    matches!(name, "int" | "float" | "bool")
}

/// Default value of a declared type: zero for value types, null for
/// reference types.
pub fn zero_value(type_name: &str) -> Value {
    match type_name {
        "int" => Value::Int(0),
        "float" => Value::Float(0.0),
        "bool" => Value::Bool(false),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values() {
        assert!(matches!(zero_value("int"), Value::Int(0)));
        assert!(matches!(zero_value("bool"), Value::Bool(false)));
        assert!(matches!(zero_value("string"), Value::Null));
        assert!(matches!(zero_value("Game.Player"), Value::Null));
    }

    #[test]
    fn object_identity_eq() {
        let a = Instance::new("C", &[]);
        let b = Instance::new("C", &[]);
        assert!(value_eq(&Value::Obj(a.clone()), &Value::Obj(a.clone())));
        assert!(!value_eq(&Value::Obj(a), &Value::Obj(b)));
    }

    #[test]
    fn instance_fields_zeroed() {
        let obj = Instance::new("C", &[("hp".to_string(), "int".to_string())]);
        assert!(matches!(obj.get_field("hp"), Value::Int(0)));
        obj.set_field("hp", Value::Int(3));
        assert!(matches!(obj.get_field("hp"), Value::Int(3)));
    }

    #[test]
    fn display_matches_print_expectations() {
        assert_eq!(Value::Int(1).to_string(), "1");
        assert_eq!(Value::str("h").to_string(), "h");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }
}
