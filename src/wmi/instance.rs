//! Owning wrapper around one remote object handle

use std::fmt;
use std::rc::Rc;

use super::{PropertyBag, CLASS_PROPERTY, PATH_PROPERTY};
use crate::mapper::{self, WmiRecord};
use crate::variant::{CimType, FromVariant, ObjectRef, ToVariant, Variant};
use crate::{Error, Result};

/// A live handle to a remote class definition or instance.
///
/// Properties are not cached: every `get`/`put` is a round trip, except for
/// [`Instance::properties`] which returns a snapshot. Dropping the instance
/// releases the handle.
pub struct Instance {
    raw: ObjectRef,
}

impl Instance {
    pub fn from_raw(raw: ObjectRef) -> Self {
        Self { raw }
    }

    pub(crate) fn raw(&self) -> &ObjectRef {
        &self.raw
    }

    pub(crate) fn into_raw(self) -> ObjectRef {
        self.raw
    }

    /// Object path, or `None` for an instance that was spawned but never committed
    pub fn path(&self) -> Result<Option<String>> {
        let (value, _) = self.raw.get(PATH_PROPERTY)?;
        Option::<String>::from_variant(&value)
    }

    /// Object path, failing for uncommitted instances
    pub fn require_path(&self) -> Result<String> {
        self.path()?
            .ok_or_else(|| Error::NotFound("object has no path; it was never committed".into()))
    }

    pub fn class_name(&self) -> Result<String> {
        let (value, _) = self.raw.get(CLASS_PROPERTY)?;
        String::from_variant(&value)
    }

    pub fn get(&self, name: &str) -> Result<Variant> {
        self.raw.get(name).map(|(value, _)| value)
    }

    /// Read a property together with its declared type
    pub fn get_typed(&self, name: &str) -> Result<(Variant, CimType)> {
        self.raw.get(name)
    }

    pub fn get_as<T: FromVariant>(&self, name: &str) -> Result<T> {
        T::from_variant(&self.get(name)?)
    }

    pub fn get_as_string(&self, name: &str) -> Result<String> {
        self.get_as(name)
    }

    /// Read any integer-valued property, including 64-bit values sent as text
    pub fn get_as_uint(&self, name: &str) -> Result<u64> {
        match self.get(name)? {
            Variant::I1(v) => Ok(v as u8 as u64),
            Variant::I2(v) => Ok(v as u16 as u64),
            Variant::I4(v) => Ok(v as u32 as u64),
            Variant::I8(v) => Ok(v as u64),
            other => u64::from_variant(&other),
        }
    }

    pub fn cim_type_of(&self, name: &str) -> Result<CimType> {
        self.raw.get(name).map(|(_, cim_type)| cim_type)
    }

    pub fn is_reference_property(&self, name: &str) -> Result<bool> {
        Ok(self.cim_type_of(name)?.is_reference())
    }

    pub fn put<T: ToVariant + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.put_variant(name, &value.to_variant())
    }

    pub fn put_variant(&self, name: &str, value: &Variant) -> Result<()> {
        tracing::trace!(property = %name, value = ?value, "put property");
        self.raw.put(name, value)
    }

    /// Snapshot of every property, system properties included
    pub fn properties(&self) -> Result<PropertyBag> {
        self.raw.properties()
    }

    pub fn property_names(&self) -> Result<Vec<String>> {
        Ok(self.properties()?.names().map(str::to_string).collect())
    }

    /// Spawn a blank instance from this class definition
    pub fn spawn_instance(&self) -> Result<Instance> {
        self.raw.spawn_instance().map(Instance::from_raw)
    }

    pub fn clone_instance(&self) -> Result<Instance> {
        self.raw.clone_object().map(Instance::from_raw)
    }

    /// Input and output parameter templates for `method`
    pub fn method_signature(&self, method: &str) -> Result<(Option<Instance>, Option<Instance>)> {
        let (input, output) = self.raw.method_signature(method)?;
        Ok((input.map(Instance::from_raw), output.map(Instance::from_raw)))
    }

    /// A fresh input parameter object for `method`, or `None` if it takes no inputs
    pub fn method_parameters(&self, method: &str) -> Result<Option<Instance>> {
        let (input, _) = self.raw.method_signature(method)?;
        input
            .map(|template| template.spawn_instance().map(Instance::from_raw))
            .transpose()
    }

    /// CIM text rendering, used to pass instances as string parameters
    pub fn cim_text(&self) -> Result<String> {
        self.raw.object_text()
    }

    /// Populate a record from this instance
    pub fn get_all<R: WmiRecord>(&self) -> Result<R> {
        mapper::read_all(self)
    }

    /// Write a record's fields onto this instance
    pub fn put_all<R: WmiRecord>(&self, record: &R) -> Result<()> {
        mapper::write_all(self, record)
    }

    /// Release the handle now
    pub fn close(self) {
        drop(self);
    }
}

impl ToVariant for Instance {
    fn to_variant(&self) -> Variant {
        Variant::Object(Rc::clone(&self.raw))
    }
}

impl FromVariant for Instance {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Object(raw) => Ok(Instance::from_raw(Rc::clone(raw))),
            other => Err(Error::conversion(other.type_name(), "embedded instance")),
        }
    }

    fn is_object_handle() -> bool {
        true
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path().ok().flatten();
        let class = self.class_name().ok();
        f.debug_struct("Instance")
            .field("class", &class)
            .field("path", &path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::CimBase;
    use crate::wmi::memory::{ClassDef, MemoryBroker};

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.define_class(
            ClassDef::new("Msvm_Widget")
                .property("Name", CimType::scalar(CimBase::String))
                .property("Size", CimType::scalar(CimBase::UInt64))
                .property("Count", CimType::scalar(CimBase::UInt32))
                .property("Parent", CimType::scalar(CimBase::Reference)),
        );
        broker
    }

    #[test]
    fn test_spawned_instance_has_no_path() {
        let broker = broker();
        let class = Instance::from_raw(broker.class_object("Msvm_Widget").unwrap());
        let widget = class.spawn_instance().unwrap();

        assert_eq!(widget.path().unwrap(), None);
        assert!(widget.require_path().is_err());
        assert_eq!(widget.class_name().unwrap(), "Msvm_Widget");
    }

    #[test]
    fn test_get_and_put() {
        let broker = broker();
        let path = broker.insert_instance("Msvm_Widget", [("Name", Variant::String("w".into()))]).unwrap();
        let widget = Instance::from_raw(broker.object(&path).unwrap());

        widget.put("Size", &u64::MAX).unwrap();
        widget.put("Count", &u32::MAX).unwrap();
        assert_eq!(widget.get_as_string("Name").unwrap(), "w");
        assert_eq!(widget.get_as_uint("Size").unwrap(), u64::MAX);
        assert_eq!(widget.get_as_uint("Count").unwrap(), u32::MAX as u64);
        assert_eq!(widget.path().unwrap(), Some(path));
        assert!(widget.is_reference_property("Parent").unwrap());
        assert!(!widget.is_reference_property("Name").unwrap());
    }

    #[test]
    fn test_clone_is_independent() {
        let broker = broker();
        let path = broker.insert_instance("Msvm_Widget", [("Name", Variant::String("w".into()))]).unwrap();
        let widget = Instance::from_raw(broker.object(&path).unwrap());
        let copy = widget.clone_instance().unwrap();

        copy.put("Name", "other").unwrap();
        assert_eq!(widget.get_as_string("Name").unwrap(), "w");
        assert_eq!(copy.get_as_string("Name").unwrap(), "other");
    }

    #[test]
    fn test_embedded_round_trip() {
        let broker = broker();
        let path = broker.insert_instance("Msvm_Widget", [("Name", Variant::String("w".into()))]).unwrap();
        let widget = Instance::from_raw(broker.object(&path).unwrap());

        let embedded = Instance::from_variant(&widget.to_variant()).unwrap();
        assert_eq!(embedded.get_as_string("Name").unwrap(), "w");
        assert!(Instance::from_variant(&Variant::I4(1)).is_err());
    }
}
