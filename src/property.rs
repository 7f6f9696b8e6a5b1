use std::fmt;
use std::rc::Rc;

use crate::error::{EventError, Result};
use crate::value::Value;


/// Extra validation step run after a property's kind has coerced the candidate.
pub type Validator = Rc<dyn Fn(&Value) -> Result<Value>>;


///////////////////////////////////////////////////////////////////////////////////////////////////
// PROPERTY KIND
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Type constraint of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
  Any,
  Bool,
  /// `null`, `true` or `false`.
  TriState,
  Int,
  Float,
  String,
  /// A list that can only be replaced as a whole.
  Tuple,
  List,
  Dict,
  /// `null` or a component.
  Component,
  /// One of a set of strings, matched case-insensitively.
  Enum(Vec<String>)
}


impl PropertyKind {
  /// Value used when a property is declared without a default.
  pub fn default_value(&self) -> Value {
    match self {
      PropertyKind::Any | PropertyKind::TriState | PropertyKind::Component => Value::Null,
      PropertyKind::Bool                        => Value::Bool(false),
      PropertyKind::Int                         => Value::Int(0),
      PropertyKind::Float                       => Value::Float(0.0),
      PropertyKind::String                      => Value::Str(String::new()),
      PropertyKind::Tuple | PropertyKind::List  => Value::List(Vec::new()),
      PropertyKind::Dict                        => Value::Dict(Default::default()),
      PropertyKind::Enum(options)               => options.first().cloned().map_or(Value::Null, Value::Str)
    }
  }

  /// Coerces a candidate into a value of this kind.
  fn coerce(&self, name: &str, candidate: &Value) -> Result<Value> {
    let mismatch = || {
      EventError::validation(name, format!("expected {}, got {}", self.describe(), candidate.type_name()))
    };

    match (self, candidate) {
      (PropertyKind::Any, v)                         => Ok(v.clone()),

      (PropertyKind::Bool, v)                        => Ok(Value::Bool(v.truthy())),

      (PropertyKind::TriState, Value::Null)          => Ok(Value::Null),
      (PropertyKind::TriState, v)                    => Ok(Value::Bool(v.truthy())),

      (PropertyKind::Int, Value::Int(i))             => Ok(Value::Int(*i)),
      (PropertyKind::Int, Value::Bool(b))            => Ok(Value::Int(i64::from(*b))),
      (PropertyKind::Int, Value::Float(x)) if x.is_finite() => Ok(Value::Int(x.trunc() as i64)),
      (PropertyKind::Int, Value::Str(s))             => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
        EventError::validation(name, format!("cannot convert {:?} to int", s))
      }),

      (PropertyKind::Float, Value::Float(x))         => Ok(Value::Float(*x)),
      (PropertyKind::Float, Value::Int(i))           => Ok(Value::Float(*i as f64)),
      (PropertyKind::Float, Value::Bool(b))          => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
      (PropertyKind::Float, Value::Str(s))           => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
        EventError::validation(name, format!("cannot convert {:?} to float", s))
      }),

      (PropertyKind::String, Value::Str(s))          => Ok(Value::Str(s.clone())),

      (PropertyKind::Tuple, Value::List(l))
      | (PropertyKind::List, Value::List(l))         => Ok(Value::List(l.clone())),

      (PropertyKind::Dict, Value::Dict(d))           => Ok(Value::Dict(d.clone())),

      (PropertyKind::Component, Value::Null)         => Ok(Value::Null),
      (PropertyKind::Component, Value::Component(c)) => Ok(Value::Component(c.clone())),

      (PropertyKind::Enum(options), Value::Str(s))   => options.iter()
        .find(|option| option.eq_ignore_ascii_case(s))
        .map(|option| Value::Str(option.clone()))
        .ok_or_else(|| EventError::validation(name, format!("{:?} is not one of {:?}", s, options))),

      _ => Err(mismatch())
    }
  }

  fn describe(&self) -> &'static str {
    match self {
      PropertyKind::Any       => "any value",
      PropertyKind::Bool      => "a bool",
      PropertyKind::TriState  => "null or a bool",
      PropertyKind::Int       => "an int",
      PropertyKind::Float     => "a float",
      PropertyKind::String    => "a string",
      PropertyKind::Tuple     => "a tuple",
      PropertyKind::List      => "a list",
      PropertyKind::Dict      => "a dict",
      PropertyKind::Component => "null or a component",
      PropertyKind::Enum(_)   => "an enum string"
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// PROPERTY
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Declaration of a property slot on a component type.
#[derive(Clone)]
pub struct Property {
  name     : String,
  kind     : PropertyKind,
  default  : Value,
  settable : bool,
  doc      : String,
  validator: Option<Validator>
}


impl Property {
  pub fn new(name: &str, kind: PropertyKind) -> Self {
    Property {
      name     : name.to_string(),
      default  : kind.default_value(),
      kind     : kind,
      settable : false,
      doc      : String::new(),
      validator: None
    }
  }

  pub fn any(name: &str) -> Self { Property::new(name, PropertyKind::Any) }
  pub fn bool(name: &str) -> Self { Property::new(name, PropertyKind::Bool) }
  pub fn tri_state(name: &str) -> Self { Property::new(name, PropertyKind::TriState) }
  pub fn int(name: &str) -> Self { Property::new(name, PropertyKind::Int) }
  pub fn float(name: &str) -> Self { Property::new(name, PropertyKind::Float) }
  pub fn string(name: &str) -> Self { Property::new(name, PropertyKind::String) }
  pub fn tuple(name: &str) -> Self { Property::new(name, PropertyKind::Tuple) }
  pub fn list(name: &str) -> Self { Property::new(name, PropertyKind::List) }
  pub fn dict(name: &str) -> Self { Property::new(name, PropertyKind::Dict) }
  pub fn component(name: &str) -> Self { Property::new(name, PropertyKind::Component) }

  pub fn enumeration(name: &str, options: &[&str]) -> Self {
    Property::new(name, PropertyKind::Enum(options.iter().map(|o| o.to_string()).collect()))
  }

  /// Sets the default value. It is validated when the component type is built.
  pub fn default(mut self, value: impl Into<Value>) -> Self {
    self.default = value.into();
    self
  }

  /// Generates a `set_<name>` action for this property.
  pub fn settable(mut self) -> Self {
    self.settable = true;
    self
  }

  pub fn doc(mut self, doc: &str) -> Self {
    self.doc = doc.to_string();
    self
  }

  /// Adds a validation step on top of the kind's coercion.
  pub fn validate_with<F>(mut self, validator: F) -> Self
  where
    F: Fn(&Value) -> Result<Value> + 'static
  {
    self.validator = Some(Rc::new(validator));
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> &PropertyKind {
    &self.kind
  }

  pub fn default_value(&self) -> &Value {
    &self.default
  }

  pub fn is_settable(&self) -> bool {
    self.settable
  }

  pub fn documentation(&self) -> &str {
    &self.doc
  }

  /// Name of the generated setter action.
  pub fn setter_name(&self) -> String {
    format!("set_{}", self.name)
  }

  /// Returns the value to store for the given candidate, or why it was rejected.
  pub fn validate(&self, candidate: &Value) -> Result<Value> {
    let value = self.kind.coerce(&self.name, candidate)?;
    match &self.validator {
      Some(validator) => validator(&value),
      None            => Ok(value)
    }
  }

  /// Whether the current value can be mutated with insert, replace and remove.
  pub(crate) fn allows_in_place(&self, current: &Value) -> bool {
    match self.kind {
      PropertyKind::List | PropertyKind::Dict => true,
      PropertyKind::Any                       => matches!(current, Value::List(_) | Value::Dict(_)),
      _                                       => false
    }
  }

  /// Validates the default, turning it into its stored form.
  pub(crate) fn checked(mut self) -> Result<Self> {
    if let PropertyKind::Enum(options) = &self.kind {
      if options.is_empty() {
        return Err(EventError::state(format!("enum property `{}` needs at least one option", self.name)));
      }
    }
    self.default = self.validate(&self.default)?;
    Ok(self)
  }
}


impl fmt::Debug for Property {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Property")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("default", &self.default)
      .field("settable", &self.settable)
      .finish()
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  #[test]
  fn kinds_coerce_compatible_values() {
    assert_eq!(Property::int("n").validate(&Value::from(2.9)).unwrap(), Value::Int(2));
    assert_eq!(Property::int("n").validate(&Value::from(" 12 ")).unwrap(), Value::Int(12));
    assert_eq!(Property::float("x").validate(&Value::from(3)).unwrap(), Value::Float(3.0));
    assert_eq!(Property::bool("b").validate(&Value::from("yes")).unwrap(), Value::Bool(true));
    assert_eq!(Property::tri_state("t").validate(&Value::Null).unwrap(), Value::Null);
  }

  #[test]
  fn kinds_reject_incompatible_values() {
    assert!(Property::string("s").validate(&Value::from(1)).is_err());
    assert!(Property::int("n").validate(&Value::from("abc")).is_err());
    assert!(Property::int("n").validate(&Value::Float(f64::NAN)).is_err());
    assert!(Property::list("l").validate(&Value::from("abc")).is_err());
    assert!(Property::component("c").validate(&Value::from(1)).is_err());
  }

  #[test]
  fn enum_matches_case_insensitively_and_keeps_declared_spelling() {
    let prop = Property::enumeration("align", &["Left", "Center", "Right"]);

    assert_eq!(prop.default_value(), &Value::from("Left"));
    assert_eq!(prop.validate(&Value::from("CENTER")).unwrap(), Value::from("Center"));
    assert!(prop.validate(&Value::from("middle")).is_err());
    assert!(Property::enumeration("empty", &[]).checked().is_err());
  }

  #[test]
  fn custom_validator_runs_after_coercion() {
    let prop = Property::int("age").validate_with(|v| match v.as_int() {
      Some(age) if age >= 0 => Ok(v.clone()),
      _                     => Err(EventError::validation("age", "must not be negative"))
    });

    assert_eq!(prop.validate(&Value::from(4.5)).unwrap(), Value::Int(4));
    assert!(prop.validate(&Value::from(-1)).is_err());
  }

  #[test]
  fn invalid_default_is_caught_at_check_time() {
    assert!(Property::string("name").default(3).checked().is_err());
    assert_eq!(Property::int("n").default("7").checked().unwrap().default_value(), &Value::Int(7));
  }
}
