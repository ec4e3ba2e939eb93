//! Structured persistence document.
//!
//! The request system persists into an opaque tree of named fields with
//! typed leaves (integers, strings, lists, nested documents). The concrete
//! encoding is the caller's business; in memory the tree is a
//! [`serde_json::Value`] object.

use crate::RegistryError;
use serde_json::{Map, Value};

/// A persisted document node.
pub type Document = Value;

/// Create an empty compound (named-field) document.
pub fn compound() -> Document {
    Value::Object(Map::new())
}

/// Typed accessors over a compound document.
///
/// Every accessor names the missing or mistyped field in its
/// [`RegistryError::MalformedDocument`] so load failures point at the
/// offending part of the tree.
pub trait DocumentExt {
    fn field(&self, name: &str) -> Result<&Document, RegistryError>;
    fn opt_field(&self, name: &str) -> Option<&Document>;
    fn get_str(&self, name: &str) -> Result<&str, RegistryError>;
    fn get_i64(&self, name: &str) -> Result<i64, RegistryError>;
    fn get_list(&self, name: &str) -> Result<&Vec<Document>, RegistryError>;
    fn get_compound(&self, name: &str) -> Result<&Document, RegistryError>;
    fn put(&mut self, name: &str, value: impl Into<Document>);
}

fn malformed(field: &str, reason: &str) -> RegistryError {
    RegistryError::MalformedDocument {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl DocumentExt for Document {
    fn field(&self, name: &str) -> Result<&Document, RegistryError> {
        self.opt_field(name)
            .ok_or_else(|| malformed(name, "missing field"))
    }

    fn opt_field(&self, name: &str) -> Option<&Document> {
        self.as_object()
            .and_then(|map| map.get(name))
            .filter(|value| !value.is_null())
    }

    fn get_str(&self, name: &str) -> Result<&str, RegistryError> {
        self.field(name)?
            .as_str()
            .ok_or_else(|| malformed(name, "expected string"))
    }

    fn get_i64(&self, name: &str) -> Result<i64, RegistryError> {
        self.field(name)?
            .as_i64()
            .ok_or_else(|| malformed(name, "expected integer"))
    }

    fn get_list(&self, name: &str) -> Result<&Vec<Document>, RegistryError> {
        self.field(name)?
            .as_array()
            .ok_or_else(|| malformed(name, "expected list"))
    }

    fn get_compound(&self, name: &str) -> Result<&Document, RegistryError> {
        let value = self.field(name)?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(malformed(name, "expected compound"))
        }
    }

    fn put(&mut self, name: &str, value: impl Into<Document>) {
        if !self.is_object() {
            *self = compound();
        }
        if let Value::Object(map) = self {
            map.insert(name.to_string(), value.into());
        }
    }
}
