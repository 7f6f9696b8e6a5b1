use std::collections::BTreeMap;
use std::fmt;

use crate::component::Component;


///////////////////////////////////////////////////////////////////////////////////////////////////
// VALUE
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Dynamic value stored in properties and carried by event fields.
#[derive(Clone)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  List(Vec<Value>),
  Dict(BTreeMap<String, Value>),
  /// Components compare by identity.
  Component(Component)
}


impl Value {
  /// Name of the variant, used in error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null         => "null",
      Value::Bool(_)      => "bool",
      Value::Int(_)       => "int",
      Value::Float(_)     => "float",
      Value::Str(_)       => "string",
      Value::List(_)      => "list",
      Value::Dict(_)      => "dict",
      Value::Component(_) => "component"
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Loose truth value: empty containers, zero and null are false.
  pub fn truthy(&self) -> bool {
    match self {
      Value::Null         => false,
      Value::Bool(b)      => *b,
      Value::Int(i)       => *i != 0,
      Value::Float(f)     => *f != 0.0,
      Value::Str(s)       => !s.is_empty(),
      Value::List(l)      => !l.is_empty(),
      Value::Dict(d)      => !d.is_empty(),
      Value::Component(_) => true
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _              => None
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _             => None
    }
  }

  /// Integers are widened.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(f) => Some(*f),
      Value::Int(i)   => Some(*i as f64),
      _               => None
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _             => None
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(l) => Some(l),
      _              => None
    }
  }

  pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
    match self {
      Value::Dict(d) => Some(d),
      _              => None
    }
  }

  pub fn as_component(&self) -> Option<&Component> {
    match self {
      Value::Component(c) => Some(c),
      _                   => None
    }
  }
}


impl Default for Value {
  fn default() -> Self {
    Value::Null
  }
}


impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Null, Value::Null)                 => true,
      (Value::Bool(a), Value::Bool(b))           => a == b,
      (Value::Int(a), Value::Int(b))             => a == b,
      (Value::Float(a), Value::Float(b))         => a == b,
      (Value::Str(a), Value::Str(b))             => a == b,
      (Value::List(a), Value::List(b))           => a == b,
      (Value::Dict(a), Value::Dict(b))           => a == b,
      (Value::Component(a), Value::Component(b)) => a.ptr_eq(b),
      _                                          => false
    }
  }
}


impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Null         => write!(f, "null"),
      Value::Bool(b)      => write!(f, "{:?}", b),
      Value::Int(i)       => write!(f, "{:?}", i),
      Value::Float(x)     => write!(f, "{:?}", x),
      Value::Str(s)       => write!(f, "{:?}", s),
      Value::List(l)      => f.debug_list().entries(l).finish(),
      Value::Dict(d)      => f.debug_map().entries(d).finish(),
      Value::Component(c) => write!(f, "<{}>", c.id())
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// CONVERSIONS
///////////////////////////////////////////////////////////////////////////////////////////////////

impl From<bool> for Value {
  fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<i32> for Value {
  fn from(i: i32) -> Self { Value::Int(i64::from(i)) }
}

impl From<u32> for Value {
  fn from(i: u32) -> Self { Value::Int(i64::from(i)) }
}

impl From<usize> for Value {
  fn from(i: usize) -> Self { Value::Int(i as i64) }
}

impl From<f64> for Value {
  fn from(x: f64) -> Self { Value::Float(x) }
}

impl From<f32> for Value {
  fn from(x: f32) -> Self { Value::Float(f64::from(x)) }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self { Value::Str(s.to_string()) }
}

impl From<String> for Value {
  fn from(s: String) -> Self { Value::Str(s) }
}

impl From<Component> for Value {
  fn from(c: Component) -> Self { Value::Component(c) }
}

impl From<&Component> for Value {
  fn from(c: &Component) -> Self { Value::Component(c.clone()) }
}

impl From<BTreeMap<String, Value>> for Value {
  fn from(d: BTreeMap<String, Value>) -> Self { Value::Dict(d) }
}

impl<T> From<Vec<T>> for Value
where
  T: Into<Value>
{
  fn from(items: Vec<T>) -> Self {
    Value::List(items.into_iter().map(Into::into).collect())
  }
}

impl<T> From<Option<T>> for Value
where
  T: Into<Value>
{
  fn from(option: Option<T>) -> Self {
    option.map_or(Value::Null, Into::into)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  #[test]
  fn conversions_pick_the_expected_variant() {
    assert_eq!(Value::from(3), Value::Int(3));
    assert_eq!(Value::from("a"), Value::Str("a".to_string()));
    assert_eq!(Value::from(vec![1, 2]), Value::List(vec![Value::Int(1), Value::Int(2)]));
    assert_eq!(Value::from(None::<i64>), Value::Null);
    assert_eq!(Value::from(Some(2.5)), Value::Float(2.5));
  }

  #[test]
  fn numbers_of_different_variants_are_not_equal() {
    assert_ne!(Value::Int(1), Value::Float(1.0));
    assert_eq!(Value::Int(1).as_float(), Some(1.0));
  }

  #[test]
  fn truthiness() {
    assert!(!Value::Null.truthy());
    assert!(!Value::from("").truthy());
    assert!(!Value::List(vec![]).truthy());
    assert!(Value::from(-1).truthy());
    assert!(Value::from("x").truthy());
  }
}
