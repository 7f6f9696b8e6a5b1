use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EventError, Result};
use crate::event::Event;
use crate::value::Value;


///////////////////////////////////////////////////////////////////////////////////////////////////
// MUTATION
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The way a property changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
  /// The whole value was replaced.
  Set,
  /// Items were inserted at an index (or keys added to a dict).
  Insert,
  /// Items were overwritten starting at an index (or keys updated in a dict).
  Replace,
  /// A number of items was removed at an index (or a list of keys dropped from a dict).
  Remove
}


impl Mutation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Mutation::Set     => "set",
      Mutation::Insert  => "insert",
      Mutation::Replace => "replace",
      Mutation::Remove  => "remove"
    }
  }
}


impl fmt::Display for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(self.as_str())
  }
}


impl FromStr for Mutation {
  type Err = EventError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "set"     => Ok(Mutation::Set),
      "insert"  => Ok(Mutation::Insert),
      "replace" => Ok(Mutation::Replace),
      "remove"  => Ok(Mutation::Remove),
      other     => Err(EventError::mutation(format!("unknown mutation kind `{}`", other)))
    }
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// LIST MUTATIONS
///////////////////////////////////////////////////////////////////////////////////////////////////

fn expect_items<'a>(mutation: Mutation, objects: &'a Value) -> Result<&'a [Value]> {
  objects.as_list().ok_or_else(|| {
    EventError::mutation(format!("`{}` expects a list of items, got {}", mutation, objects.type_name()))
  })
}


fn out_of_range(mutation: Mutation, index: usize, span: usize, len: usize) -> EventError {
  EventError::mutation(format!(
    "`{}` of {} item(s) at index {} does not fit a list of length {}", mutation, span, index, len
  ))
}


/// Applies an in-place mutation to a list.
///
/// `objects` is the list of items for `set`, `insert` and `replace`, and the number of items to
/// drop for `remove`. The list is left untouched when the mutation does not fit.
pub fn mutate_array(list: &mut Vec<Value>, mutation: Mutation, index: usize, objects: &Value) -> Result<()> {
  match mutation {
    Mutation::Set => {
      *list = expect_items(mutation, objects)?.to_vec();
    },

    Mutation::Insert => {
      let items = expect_items(mutation, objects)?;
      if index > list.len() {
        return Err(out_of_range(mutation, index, items.len(), list.len()));
      }
      list.splice(index..index, items.iter().cloned());
    },

    Mutation::Replace => {
      let items = expect_items(mutation, objects)?;
      let end = match index.checked_add(items.len()) {
        Some(end) if end <= list.len() => end,
        _ => return Err(out_of_range(mutation, index, items.len(), list.len()))
      };
      list[index..end].clone_from_slice(items);
    },

    Mutation::Remove => {
      let count = match objects.as_int() {
        Some(count) if count >= 0 => count as usize,
        _ => return Err(EventError::mutation(format!("`remove` expects a count, got {:?}", objects)))
      };
      let end = match index.checked_add(count) {
        Some(end) if end <= list.len() => end,
        _ => return Err(out_of_range(mutation, index, count, list.len()))
      };
      list.drain(index..end);
    }
  }

  Ok(())
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// DICT MUTATIONS
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Applies an in-place mutation to a dict.
///
/// `insert` and `replace` both update the given keys, `remove` drops every key of a list
/// (missing keys are ignored) and `set` replaces the whole content.
pub fn mutate_dict(dict: &mut BTreeMap<String, Value>, mutation: Mutation, objects: &Value) -> Result<()> {
  match mutation {
    Mutation::Set | Mutation::Insert | Mutation::Replace => {
      let entries = objects.as_dict().ok_or_else(|| {
        EventError::mutation(format!("`{}` on a dict expects a dict, got {}", mutation, objects.type_name()))
      })?;

      if mutation == Mutation::Set {
        dict.clear();
      }
      dict.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
    },

    Mutation::Remove => {
      let keys = expect_items(mutation, objects)?;
      let mut names = Vec::with_capacity(keys.len());
      for key in keys {
        match key.as_str() {
          Some(name) => names.push(name),
          None       => return Err(EventError::mutation(format!("dict keys are strings, got {:?}", key)))
        }
      }
      for name in names {
        dict.remove(name);
      }
    }
  }

  Ok(())
}


/// Replays a property-change event onto a local copy of the property's value.
///
/// Useful for reactions that mirror a list or dict owned by another component.
pub fn apply_event(target: &mut Value, event: &Event) -> Result<()> {
  let mutation = event.mutation().ok_or_else(|| {
    EventError::mutation(format!("event `{}` does not describe a mutation", event.event_type()))
  })?;

  if mutation == Mutation::Set {
    *target = event.new_value().cloned().unwrap_or(Value::Null);
    return Ok(());
  }

  let objects = event.objects().cloned().unwrap_or(Value::Null);
  match (target, event.index()) {
    (Value::List(list), Some(index)) => mutate_array(list, mutation, index, &objects),
    (Value::Dict(dict), None)        => mutate_dict(dict, mutation, &objects),
    (other, _)                       => Err(EventError::mutation(format!(
      "cannot replay `{}` of event `{}` onto a {}", mutation, event.event_type(), other.type_name()
    )))
  }
}


///////////////////////////////////////////////////////////////////////////////////////////////////
// TESTS
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
  use super::*;


  fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::Int(*v)).collect()
  }

  #[test]
  fn list_mutations_follow_index_semantics() {
    let mut list = ints(&[1, 2, 3]);

    mutate_array(&mut list, Mutation::Insert, 1, &Value::from(vec![9, 8])).unwrap();
    assert_eq!(list, ints(&[1, 9, 8, 2, 3]));

    mutate_array(&mut list, Mutation::Replace, 3, &Value::from(vec![7, 6])).unwrap();
    assert_eq!(list, ints(&[1, 9, 8, 7, 6]));

    mutate_array(&mut list, Mutation::Remove, 0, &Value::from(2)).unwrap();
    assert_eq!(list, ints(&[8, 7, 6]));

    mutate_array(&mut list, Mutation::Set, 0, &Value::from(vec![5])).unwrap();
    assert_eq!(list, ints(&[5]));
  }

  #[test]
  fn list_mutations_out_of_range_leave_the_list_alone() {
    let mut list = ints(&[1, 2]);

    assert!(mutate_array(&mut list, Mutation::Insert, 3, &Value::from(vec![0])).is_err());
    assert!(mutate_array(&mut list, Mutation::Replace, 1, &Value::from(vec![0, 0])).is_err());
    assert!(mutate_array(&mut list, Mutation::Remove, 1, &Value::from(2)).is_err());
    assert!(mutate_array(&mut list, Mutation::Remove, 0, &Value::from(-1)).is_err());
    assert_eq!(list, ints(&[1, 2]));
  }

  #[test]
  fn huge_indices_are_out_of_range() {
    let mut list = ints(&[1, 2]);

    let removed  = mutate_array(&mut list, Mutation::Remove, usize::MAX, &Value::from(1));
    let replaced = mutate_array(&mut list, Mutation::Replace, usize::MAX, &Value::from(vec![0]));
    assert!(matches!(removed, Err(EventError::Mutation(_))));
    assert!(matches!(replaced, Err(EventError::Mutation(_))));
    assert_eq!(list, ints(&[1, 2]));
  }

  #[test]
  fn dict_mutations_update_and_drop_keys() {
    let mut dict = BTreeMap::new();
    dict.insert("a".to_string(), Value::from(1));

    let mut update = BTreeMap::new();
    update.insert("b".to_string(), Value::from(2));
    mutate_dict(&mut dict, Mutation::Insert, &Value::Dict(update)).unwrap();
    assert_eq!(dict.len(), 2);

    mutate_dict(&mut dict, Mutation::Remove, &Value::from(vec!["a", "missing"])).unwrap();
    assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["b"]);

    assert!(mutate_dict(&mut dict, Mutation::Remove, &Value::from(vec![1])).is_err());
  }

  #[test]
  fn mutation_names_parse() {
    assert_eq!("replace".parse::<Mutation>().unwrap(), Mutation::Replace);
    assert!("append".parse::<Mutation>().is_err());
  }
}
