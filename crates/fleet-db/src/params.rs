//! A small closed set of bindable values.
//!
//! [`crate::db::Db`] binds query parameters through this enum rather than
//! through generic `Encode`/`Type` bounds so the same call site works
//! against either backend pool without duplicating bind logic per
//! dialect at every query call.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Param {
    Text(String),
    Int(i64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Null,
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_owned())
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<Uuid> for Param {
    fn from(v: Uuid) -> Self {
        Param::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(v: DateTime<Utc>) -> Self {
        Param::Timestamp(v)
    }
}

impl From<serde_json::Value> for Param {
    fn from(v: serde_json::Value) -> Self {
        Param::Json(v)
    }
}

impl<T> From<Option<T>> for Param
where
    Param: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => Param::from(inner),
            None => Param::Null,
        }
    }
}

/// Build a `Vec<Param>` from a list of values implementing `Into<Param>`.
///
/// ```ignore
/// let p = params![task_id, status.to_string(), now];
/// ```
#[macro_export]
macro_rules! params {
    ($($value:expr),* $(,)?) => {
        vec![$(::std::convert::Into::<$crate::params::Param>::into($value)),*]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_becomes_null() {
        let p: Param = Option::<String>::None.into();
        assert!(matches!(p, Param::Null));
    }

    #[test]
    fn option_some_unwraps_inner_variant() {
        let p: Param = Some(5i32).into();
        assert!(matches!(p, Param::Int(5)));
    }

    #[test]
    fn params_macro_builds_vec() {
        let id = Uuid::nil();
        let v = params![id, "name", 3i64, true];
        assert_eq!(v.len(), 4);
        assert!(matches!(v[0], Param::Uuid(_)));
        assert!(matches!(v[1], Param::Text(_)));
        assert!(matches!(v[2], Param::Int(3)));
        assert!(matches!(v[3], Param::Bool(true)));
    }
}
