use thiserror::Error;


///////////////////////////////////////////////////////////////////////////////////////////////////
// EVENT ERROR
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Errors raised by the event system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
  /// A property validator rejected a candidate value. The stored value is left untouched.
  #[error("invalid value for property `{property}`: {reason}")]
  Validation {
    property: String,
    reason  : String
  },

  /// Mutation outside of an action, mutation of a disposed component,
  /// or a name declared twice on a component type.
  #[error("{0}")]
  State(String),

  /// Unknown property, action, emitter or attribute, or a write to a read-only slot.
  #[error("{0}")]
  Attribute(String),

  /// A connection string could not be parsed or resolved.
  #[error("invalid connection string `{connection}`: {reason}")]
  Connection {
    connection: String,
    reason    : String
  },

  /// An in-place mutation got an index or objects it cannot apply.
  #[error("invalid mutation: {0}")]
  Mutation(String),

  /// Failure reported by a user-provided action, emitter or reaction body.
  #[error("{0}")]
  Custom(String),

  /// All failures collected while a batch kept going.
  #[error("{} failure(s) while processing a batch", .0.len())]
  Batch(Vec<EventError>)
}


/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EventError>;


impl EventError {
  pub fn validation(property: &str, reason: impl Into<String>) -> Self {
    EventError::Validation { property: property.to_string(), reason: reason.into() }
  }

  pub fn state(message: impl Into<String>) -> Self {
    EventError::State(message.into())
  }

  pub fn attribute(message: impl Into<String>) -> Self {
    EventError::Attribute(message.into())
  }

  pub fn connection(connection: &str, reason: impl Into<String>) -> Self {
    EventError::Connection { connection: connection.to_string(), reason: reason.into() }
  }

  pub fn mutation(message: impl Into<String>) -> Self {
    EventError::Mutation(message.into())
  }

  /// Builds an error from inside an action, emitter or reaction body.
  pub fn custom(message: impl Into<String>) -> Self {
    EventError::Custom(message.into())
  }

  /// Flattens nested batch errors into a single list.
  pub fn into_failures(self) -> Vec<EventError> {
    match self {
      EventError::Batch(failures) => failures.into_iter().flat_map(EventError::into_failures).collect(),
      other                       => vec![other]
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  #[test]
  fn batch_errors_flatten() {
    let nested = EventError::Batch(vec![
      EventError::state("a"),
      EventError::Batch(vec![EventError::custom("b"), EventError::attribute("c")])
    ]);

    assert_eq!(nested.to_string(), "2 failure(s) while processing a batch");
    assert_eq!(nested.into_failures(), vec![
      EventError::state("a"),
      EventError::custom("b"),
      EventError::attribute("c")
    ]);
  }

  #[test]
  fn validation_message_names_the_property() {
    let error = EventError::validation("name", "expected a string, got int");
    assert_eq!(error.to_string(), "invalid value for property `name`: expected a string, got int");
  }
}
