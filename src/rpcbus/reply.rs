use serde::{Deserialize, Serialize};

/// Body of a reply published by a handler: the business result or its error message.
///
/// With the JSON codec this is `{"ok": <value>}` or `{"err": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply<T> {
    Ok(T),
    Err(String),
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for Reply<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Err(e.to_string()),
        }
    }
}
