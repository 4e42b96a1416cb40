//! Property bag mapper
//!
//! Maps native record types to and from an instance's property bag through a
//! field table built once per record type. Each entry pairs a wire property
//! name with typed accessors, so no per-call type inspection happens.
//! Embedded sub-records contribute their entries to the parent table, which
//! flattens them into the same bag.
//!
//! ```ignore
//! impl WmiRecord for DataItem {
//!     fn table() -> &'static FieldTable<Self> {
//!         static TABLE: OnceLock<FieldTable<DataItem>> = OnceLock::new();
//!         TABLE.get_or_init(|| {
//!             FieldTable::builder()
//!                 .path(|r: &mut DataItem| &mut r.path)
//!                 .property("Name", |r: &DataItem| &r.name, |r: &mut DataItem| &mut r.name)
//!                 .build()
//!         })
//!     }
//! }
//! ```

use tracing::trace;

use crate::variant::{FromVariant, ToVariant, Variant};
use crate::wmi::Instance;
use crate::Result;

/// A native type that maps onto a remote class's properties
pub trait WmiRecord: Default + 'static {
    fn table() -> &'static FieldTable<Self>;
}

type Encode<R> = Box<dyn Fn(&R) -> Option<Variant> + Send + Sync>;
type Decode<R> = Box<dyn Fn(&mut R, &Variant) -> Result<()> + Send + Sync>;
type SetIdentity<R> = Box<dyn Fn(&mut R, String) + Send + Sync>;

struct Field<R> {
    name: &'static str,
    /// `None` when the value is suppressed on write
    encode: Encode<R>,
    decode: Decode<R>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IdentityKind {
    Path,
    Class,
}

struct Identity<R> {
    kind: IdentityKind,
    set: SetIdentity<R>,
}

/// Field-to-property table for one record type
pub struct FieldTable<R> {
    fields: Vec<Field<R>>,
    identity: Vec<Identity<R>>,
}

impl<R: 'static> FieldTable<R> {
    pub fn builder() -> FieldTableBuilder<R> {
        FieldTableBuilder {
            table: FieldTable {
                fields: Vec::new(),
                identity: Vec::new(),
            },
        }
    }

    /// Wire property names, embedded records included, in table order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }
}

pub struct FieldTableBuilder<R> {
    table: FieldTable<R>,
}

impl<R: 'static> FieldTableBuilder<R> {
    /// Field receiving the object path on read; never written
    pub fn path<F>(self, field: F) -> Self
    where
        F: Fn(&mut R) -> &mut String + Send + Sync + 'static,
    {
        self.identity(IdentityKind::Path, field)
    }

    /// Field receiving the class name on read; never written
    pub fn class<F>(self, field: F) -> Self
    where
        F: Fn(&mut R) -> &mut String + Send + Sync + 'static,
    {
        self.identity(IdentityKind::Class, field)
    }

    fn identity<F>(mut self, kind: IdentityKind, field: F) -> Self
    where
        F: Fn(&mut R) -> &mut String + Send + Sync + 'static,
    {
        self.table.identity.push(Identity {
            kind,
            set: Box::new(move |record, value| *field(record) = value),
        });
        self
    }

    pub fn property<T, G, M>(mut self, name: &'static str, get: G, get_mut: M) -> Self
    where
        T: ToVariant + FromVariant,
        G: Fn(&R) -> &T + Send + Sync + 'static,
        M: Fn(&mut R) -> &mut T + Send + Sync + 'static,
    {
        self.table.fields.push(Field {
            name,
            encode: Box::new(move |record| {
                let value = get(record);
                if value.is_write_suppressed() {
                    None
                } else {
                    Some(value.to_variant())
                }
            }),
            decode: Box::new(move |record, wire| {
                *get_mut(record) = T::from_variant(wire)?;
                Ok(())
            }),
        });
        self
    }

    /// Flatten an embedded record's fields into this table
    pub fn embed<E, G, M>(mut self, get: G, get_mut: M) -> Self
    where
        E: WmiRecord,
        G: Fn(&R) -> &E + Copy + Send + Sync + 'static,
        M: Fn(&mut R) -> &mut E + Copy + Send + Sync + 'static,
    {
        let inner = E::table();
        for field in &inner.fields {
            self.table.fields.push(Field {
                name: field.name,
                encode: Box::new(move |record| (field.encode)(get(record))),
                decode: Box::new(move |record, wire| (field.decode)(get_mut(record), wire)),
            });
        }
        for identity in &inner.identity {
            self.table.identity.push(Identity {
                kind: identity.kind,
                set: Box::new(move |record, value| (identity.set)(get_mut(record), value)),
            });
        }
        self
    }

    pub fn build(self) -> FieldTable<R> {
        self.table
    }
}

/// Write every non-identity field of `record` onto `instance`.
///
/// Fields the remote class does not declare are skipped, as are suppressed
/// values (empty strings, `None`), which leaves them at the remote default.
pub fn write_all<R: WmiRecord>(instance: &Instance, record: &R) -> Result<()> {
    let declared = instance.properties()?;
    for field in &R::table().fields {
        if !declared.contains(field.name) {
            trace!(property = field.name, "not declared by remote class, skipping");
            continue;
        }
        let Some(value) = (field.encode)(record) else {
            trace!(property = field.name, "empty value, leaving remote default");
            continue;
        };
        instance.put_variant(field.name, &value)?;
    }
    Ok(())
}

/// Build a record from one snapshot of `instance`'s properties
pub fn read_all<R: WmiRecord>(instance: &Instance) -> Result<R> {
    let table = R::table();
    let bag = instance.properties()?;
    let mut record = R::default();

    for field in &table.fields {
        if let Some(value) = bag.get(field.name) {
            (field.decode)(&mut record, value)?;
        }
    }

    if !table.identity.is_empty() {
        let path = instance.path()?.unwrap_or_default();
        let class = instance.class_name()?;
        for identity in &table.identity {
            let value = match identity.kind {
                IdentityKind::Path => path.clone(),
                IdentityKind::Class => class.clone(),
            };
            (identity.set)(&mut record, value);
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{CimBase, CimDateTime, CimType};
    use crate::wmi::memory::{Call, ClassDef, MemoryBroker};
    use std::sync::OnceLock;

    #[derive(Debug, Default, PartialEq)]
    struct Element {
        path: String,
        instance_id: String,
        element_name: String,
    }

    impl WmiRecord for Element {
        fn table() -> &'static FieldTable<Self> {
            static TABLE: OnceLock<FieldTable<Element>> = OnceLock::new();
            TABLE.get_or_init(|| {
                FieldTable::builder()
                    .path(|r: &mut Element| &mut r.path)
                    .property("InstanceID", |r: &Element| &r.instance_id, |r: &mut Element| &mut r.instance_id)
                    .property("ElementName", |r: &Element| &r.element_name, |r: &mut Element| &mut r.element_name)
                    .build()
            })
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Disk {
        element: Element,
        class: String,
        size: u64,
        dedicated: Vec<u16>,
        created: CimDateTime,
        owner: Option<String>,
        only_local: u32,
    }

    impl WmiRecord for Disk {
        fn table() -> &'static FieldTable<Self> {
            static TABLE: OnceLock<FieldTable<Disk>> = OnceLock::new();
            TABLE.get_or_init(|| {
                FieldTable::builder()
                    .embed(|r: &Disk| &r.element, |r: &mut Disk| &mut r.element)
                    .class(|r: &mut Disk| &mut r.class)
                    .property("Size", |r: &Disk| &r.size, |r: &mut Disk| &mut r.size)
                    .property("Dedicated", |r: &Disk| &r.dedicated, |r: &mut Disk| &mut r.dedicated)
                    .property("Created", |r: &Disk| &r.created, |r: &mut Disk| &mut r.created)
                    .property("Owner", |r: &Disk| &r.owner, |r: &mut Disk| &mut r.owner)
                    .property("OnlyLocal", |r: &Disk| &r.only_local, |r: &mut Disk| &mut r.only_local)
                    .build()
            })
        }
    }

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.define_class(
            ClassDef::new("Msvm_Disk")
                .property("InstanceID", CimType::scalar(CimBase::String))
                .property("ElementName", CimType::scalar(CimBase::String))
                .property("Size", CimType::scalar(CimBase::UInt64))
                .property("Dedicated", CimType::array_of(CimBase::UInt16))
                .property("Created", CimType::scalar(CimBase::DateTime))
                .property("Owner", CimType::scalar(CimBase::String))
                .property("Extra", CimType::scalar(CimBase::String)),
        );
        broker
    }

    #[test]
    fn test_embedded_fields_are_flattened() {
        let names: Vec<_> = Disk::table().names().collect();
        assert_eq!(
            names,
            vec!["InstanceID", "ElementName", "Size", "Dedicated", "Created", "Owner", "OnlyLocal"]
        );
    }

    #[test]
    fn test_write_then_read() {
        let broker = broker();
        let class = Instance::from_raw(broker.class_object("Msvm_Disk").unwrap());
        let disk = class.spawn_instance().unwrap();

        let created = CimDateTime::parse("20240102030405.000000+060").unwrap();
        let record = Disk {
            element: Element {
                path: "ignored".into(),
                instance_id: "disk-1".into(),
                element_name: String::new(),
            },
            class: "ignored".into(),
            size: u64::MAX,
            dedicated: vec![2, 3],
            created,
            owner: None,
            only_local: 7,
        };
        broker.clear_calls();
        disk.put_all(&record).unwrap();

        let puts: Vec<_> = broker
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Put(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(puts, vec!["InstanceID", "Size", "Dedicated", "Created"]);

        let back: Disk = disk.get_all().unwrap();
        assert_eq!(back.element.instance_id, "disk-1");
        assert_eq!(back.element.element_name, "");
        assert_eq!(back.element.path, "");
        assert_eq!(back.class, "Msvm_Disk");
        assert_eq!(back.size, u64::MAX);
        assert_eq!(back.dedicated, vec![2, 3]);
        assert_eq!(back.created, created);
        assert_eq!(back.owner, None);
        assert_eq!(back.only_local, 0);
    }

    #[test]
    fn test_read_fills_identity() {
        let broker = broker();
        let path = broker
            .insert_instance("Msvm_Disk", [("ElementName", Variant::String("boot".into()))])
            .unwrap();
        let disk: Disk = Instance::from_raw(broker.object(&path).unwrap()).get_all().unwrap();

        assert_eq!(disk.element.path, path);
        assert_eq!(disk.element.element_name, "boot");
        assert!(disk.created.is_unset());
    }

    #[test]
    fn test_read_conversion_failure_propagates() {
        let broker = broker();
        let path = broker
            .insert_instance("Msvm_Disk", [("Size", Variant::String("lots".into()))])
            .unwrap();
        let result: Result<Disk> = Instance::from_raw(broker.object(&path).unwrap()).get_all();
        assert!(matches!(result, Err(crate::Error::TypeConversion { .. })));
    }
}
