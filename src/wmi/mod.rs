//! Remote object broker access
//!
//! The traits in this module are the seam between the marshaling layer and a
//! concrete transport. [`com`] talks to the local WMI service over COM;
//! [`memory`] is an in-process broker used by tests and offline tooling.
//! Callers work with the owning wrappers [`Service`], [`Instance`] and
//! [`Enumerator`], which release their remote handle exactly once.

#[cfg(windows)]
pub mod com;
pub mod enumerator;
pub mod instance;
pub mod memory;
pub mod safearray;
pub mod service;

pub use enumerator::Enumerator;
pub use instance::Instance;
pub use service::Service;

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::variant::{CimType, ObjectRef, Variant};
use crate::Result;

/// System property holding an object's full path
pub const PATH_PROPERTY: &str = "__PATH";
/// System property holding an object's class name
pub const CLASS_PROPERTY: &str = "__CLASS";

/// Account used for remote connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Opens connections to a namespace
pub trait Connector {
    fn connect(
        &self,
        server: Option<&str>,
        namespace: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Connection>>;
}

/// One live session with the broker
#[cfg_attr(test, mockall::automock)]
pub trait Connection {
    fn exec_query(&self, wql: &str) -> Result<Box<dyn RawEnum>>;

    fn create_instance_enum(&self, class_name: &str) -> Result<Box<dyn RawEnum>>;

    /// Fetch a class definition or instance by path. `Ok(None)` if the broker
    /// does not recognize the path.
    fn get_object(&self, path: &str) -> Result<Option<ObjectRef>>;

    /// Invoke `method` on the object at `path`. The input parameter object
    /// is consumed and released by the call.
    fn exec_method(
        &self,
        path: &str,
        method: &str,
        in_params: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>>;
}

/// A remote object handle: class definition, instance, or parameter object
pub trait RawObject {
    /// Read one property with its declared type
    fn get(&self, name: &str) -> Result<(Variant, CimType)>;

    fn put(&self, name: &str, value: &Variant) -> Result<()>;

    /// Take a complete snapshot of every property, system properties included
    fn properties(&self) -> Result<PropertyBag>;

    /// Create a blank instance; only meaningful on a class definition
    fn spawn_instance(&self) -> Result<ObjectRef>;

    fn clone_object(&self) -> Result<ObjectRef>;

    /// Input and output parameter templates of a method; either may be absent
    fn method_signature(&self, method: &str) -> Result<(Option<ObjectRef>, Option<ObjectRef>)>;

    /// CIM text rendering of the object, as accepted by methods taking embedded instances as strings
    fn object_text(&self) -> Result<String>;

    fn as_any(&self) -> &dyn Any;
}

/// Forward-only cursor over query results
pub trait RawEnum {
    /// Next object, or `Ok(None)` once the result set is exhausted
    fn next(&mut self) -> Result<Option<ObjectRef>>;
}

/// One property in a [`PropertyBag`]
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: Variant,
    pub cim_type: CimType,
}

/// Ordered name to value mapping taken from one enumeration pass over an object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    properties: Vec<Property>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Variant, cim_type: CimType) {
        self.properties.push(Property {
            name: name.into(),
            value,
            cim_type,
        });
    }

    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.property(name).map(|p| &p.value)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Render non-system properties as JSON for display
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .properties
            .iter()
            .filter(|p| !p.name.starts_with("__"))
            .map(|p| (p.name.clone(), variant_to_json(&p.value)))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn variant_to_json(value: &Variant) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Variant::Null => Value::Null,
        Variant::Bool(b) => Value::Bool(b.as_bool()),
        Variant::I1(v) => Value::from(*v),
        Variant::I2(v) => Value::from(*v),
        Variant::I4(v) => Value::from(*v),
        Variant::I8(v) => Value::from(*v),
        Variant::UI1(v) => Value::from(*v),
        Variant::UI2(v) => Value::from(*v),
        Variant::UI4(v) => Value::from(*v),
        Variant::UI8(v) => Value::from(*v),
        Variant::R4(v) => Value::from(*v),
        Variant::R8(v) => Value::from(*v),
        Variant::String(s) => Value::String(s.clone()),
        Variant::Object(obj) => obj
            .properties()
            .map(|bag| bag.to_json())
            .unwrap_or(Value::Null),
        Variant::Array(array) => Value::Array(array.items().iter().map(variant_to_json).collect()),
    }
}

impl IntoIterator for PropertyBag {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.properties.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::CimBase;

    #[test]
    fn test_property_bag_lookup_preserves_order_and_case() {
        let mut bag = PropertyBag::new();
        bag.push("ElementName", Variant::String("vm1".into()), CimType::scalar(CimBase::String));
        bag.push("EnabledState", Variant::I4(2), CimType::scalar(CimBase::UInt16));

        assert_eq!(bag.names().collect::<Vec<_>>(), vec!["ElementName", "EnabledState"]);
        assert_eq!(bag.get("EnabledState"), Some(&Variant::I4(2)));
        assert!(bag.get("elementname").is_none());
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_property_bag_json_skips_system_properties() {
        let mut bag = PropertyBag::new();
        bag.push(PATH_PROPERTY, Variant::String("p".into()), CimType::scalar(CimBase::String));
        bag.push("Name", Variant::String("x".into()), CimType::scalar(CimBase::String));
        bag.push("Dedicated", Variant::string_array(["a"]), CimType::array_of(CimBase::String));

        let json = bag.to_json();
        assert_eq!(json["Name"], "x");
        assert_eq!(json["Dedicated"][0], "a");
        assert!(json.get(PATH_PROPERTY).is_none());
    }
}
