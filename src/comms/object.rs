//! Raw class objects as delivered by the notification service.
//!
//! The sink never touches backend types directly: it reads properties
//! through [`EventObject`], which the WMI backend implements over
//! `IWbemClassObject` and [`ClassObject`] implements in memory.  Property
//! reads are fallible and typed loosely on purpose, mirroring `VARIANT`.

use std::collections::BTreeMap;

use crate::constants::PROP_CLASS;
use crate::error::ErrorCode;

/// A property value read from an event object.
pub enum Property {
    Str(String),
    I32(i32),
    U32(u32),
    Object(Box<dyn EventObject>),
    Null,
    /// Any other variant type, identified by its type tag.
    Other(u16),
}

impl Property {
    /// Short type label used in diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            Property::Str(_) => "string".into(),
            Property::I32(_) => "i32".into(),
            Property::U32(_) => "u32".into(),
            Property::Object(_) => "object".into(),
            Property::Null => "null".into(),
            Property::Other(tag) => format!("variant type {tag}"),
        }
    }
}

/// Read access to one raw event object.
pub trait EventObject {
    /// Read a property by name.  Missing properties fail with
    /// `WBEM_E_NOT_FOUND`.
    fn get(&self, name: &str) -> Result<Property, ErrorCode>;
}

/// Owned value stored in a [`ClassObject`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    I32(i32),
    U32(u32),
    Object(ClassObject),
    Null,
    Other(u16),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<ClassObject> for Value {
    fn from(obj: ClassObject) -> Self {
        Value::Object(obj)
    }
}

/// In-memory class object.  `__CLASS` is answered from the class name.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassObject {
    class:      String,
    properties: BTreeMap<String, Value>,
}

impl ClassObject {
    pub fn new(class: impl Into<String>) -> Self {
        Self { class: class.into(), properties: BTreeMap::new() }
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

impl EventObject for ClassObject {
    fn get(&self, name: &str) -> Result<Property, ErrorCode> {
        if name == PROP_CLASS {
            return Ok(Property::Str(self.class.clone()));
        }
        let value = self.properties.get(name).ok_or(ErrorCode::WBEM_E_NOT_FOUND)?;
        Ok(match value {
            Value::Str(s) => Property::Str(s.clone()),
            Value::I32(v) => Property::I32(*v),
            Value::U32(v) => Property::U32(*v),
            Value::Object(obj) => Property::Object(Box::new(obj.clone())),
            Value::Null => Property::Null,
            Value::Other(tag) => Property::Other(*tag),
        })
    }
}
