use std::fmt;
use std::str::FromStr;

use crate::error::{EventError, Result};


/// Whether `name` is an ASCII identifier.
pub fn is_identifier(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
    _ => false
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// SEGMENT
///////////////////////////////////////////////////////////////////////////////////////////////////

/// How a path segment expands into objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fanout {
  /// `name`: the value itself.
  Single,
  /// `name*`: every element of the list.
  Each,
  /// `name**`: every element, and their same-named sub-lists, recursively.
  Recursive
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
  pub name  : String,
  pub fanout: Fanout
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// CONNECTION STRING
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A parsed connection string, e.g. `"!children**.text:mylabel"`.
///
/// * a leading `!` silences the warning for event types unknown to the target;
/// * dot-separated segments form a path walked from the owning component;
/// * the last segment names the event type;
/// * a trailing `:label` sets the delivery order key and allows selective disconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
  raw       : String,
  force     : bool,
  label     : Option<String>,
  path      : Vec<Segment>,
  event_type: String
}


impl ConnectionString {
  pub fn parse(raw: &str) -> Result<Self> {
    let invalid = |reason: String| EventError::connection(raw, reason);

    if raw.is_empty() {
      return Err(invalid("connection strings must be non-empty".to_string()));
    }

    let (force, rest) = match raw.strip_prefix('!') {
      Some(rest) => (true, rest),
      None       => (false, raw)
    };

    let (path, label) = match rest.split_once(':') {
      Some((_, ""))        => return Err(invalid("the label after `:` is empty".to_string())),
      Some((path, label))  => (path, Some(label.to_string())),
      None                 => (rest, None)
    };

    if path.is_empty() {
      return Err(invalid("missing event type".to_string()));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
      let name  = part.trim_end_matches('*');
      let stars = part.len() - name.len();

      let fanout = match stars {
        0 => Fanout::Single,
        1 => Fanout::Each,
        2 => Fanout::Recursive,
        _ => return Err(invalid(format!("`{}` has more than two `*`", part)))
      };

      if !is_identifier(name) {
        return Err(invalid(format!("`{}` is not a valid identifier", name)));
      }

      segments.push(Segment { name: name.to_string(), fanout: fanout });
    }

    // `split` always yields at least one part
    let last = match segments.pop() {
      Some(last) => last,
      None       => return Err(invalid("missing event type".to_string()))
    };
    if last.fanout != Fanout::Single {
      return Err(invalid(format!("the event type `{}` cannot fan out", last.name)));
    }

    Ok(ConnectionString {
      raw       : raw.to_string(),
      force     : force,
      label     : label,
      path      : segments,
      event_type: last.name
    })
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }

  pub fn is_forced(&self) -> bool {
    self.force
  }

  pub fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  /// Segments leading to the objects that emit the event. Empty for direct connections.
  pub fn path(&self) -> &[Segment] {
    &self.path
  }

  pub fn event_type(&self) -> &str {
    &self.event_type
  }

  /// Whether the event type is subscribed on the owning component itself.
  pub fn is_direct(&self) -> bool {
    self.path.is_empty()
  }

  /// Delivery order key: the label when present, else the reaction's name.
  pub fn sort_key<'a>(&'a self, reaction_name: &'a str) -> &'a str {
    self.label().unwrap_or(reaction_name)
  }
}


impl FromStr for ConnectionString {
  type Err = EventError;

  fn from_str(s: &str) -> Result<Self> {
    ConnectionString::parse(s)
  }
}


impl fmt::Display for ConnectionString {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&self.raw)
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  #[test]
  fn bare_name_is_a_direct_connection() {
    let connection = ConnectionString::parse("foo").unwrap();

    assert!(connection.is_direct());
    assert!(!connection.is_forced());
    assert_eq!(connection.event_type(), "foo");
    assert_eq!(connection.label(), None);
    assert_eq!(connection.sort_key("handler"), "handler");
  }

  #[test]
  fn all_decorations_are_parsed() {
    let connection = ConnectionString::parse("!foo.children**.items*.text:my label").unwrap();

    assert!(connection.is_forced());
    assert_eq!(connection.label(), Some("my label"));
    assert_eq!(connection.sort_key("handler"), "my label");
    assert_eq!(connection.event_type(), "text");
    assert_eq!(connection.path(), &[
      Segment { name: "foo".to_string(),      fanout: Fanout::Single },
      Segment { name: "children".to_string(), fanout: Fanout::Recursive },
      Segment { name: "items".to_string(),    fanout: Fanout::Each }
    ]);
  }

  #[test]
  fn malformed_strings_are_rejected() {
    for raw in &["", "!", ":label", "foo:", "foo..bar", "foo.1bar", "foo***.bar", "foo*", "a-b", "foo.bar*"] {
      assert!(ConnectionString::parse(raw).is_err(), "{:?} should be rejected", raw);
    }
  }

  #[test]
  fn identifiers() {
    assert!(is_identifier("_private"));
    assert!(is_identifier("name2"));
    assert!(!is_identifier("2name"));
    assert!(!is_identifier(""));
    assert!(!is_identifier("naïve"));
  }
}
