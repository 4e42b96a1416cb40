//! Tagged wire values exchanged with the WMI broker
//!
//! A [`Variant`] is what travels over the wire: an automation-style tagged
//! value. A [`CimType`] is what the remote class *declares* for a property or
//! parameter. The two are related but not identical; WMI carries `uint32` in
//! a signed 32-bit slot and both 64-bit integer kinds as decimal text.

mod codec;
mod datetime;

pub use codec::{ArrayElement, FromVariant, ToVariant};
pub use datetime::{CimDateTime, WINDOWS_EPOCH_UNIX_SECONDS};

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::wmi::RawObject;
use crate::{Error, Result};

/// Shared handle to a remote object, as carried inside an embedded-object variant
pub type ObjectRef = Rc<dyn RawObject>;

/// Automation boolean. `TRUE` is all bits set; any non-zero pattern reads as true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantBool(pub i16);

impl VariantBool {
    pub const TRUE: VariantBool = VariantBool(-1);
    pub const FALSE: VariantBool = VariantBool(0);

    pub fn as_bool(self) -> bool {
        self.0 != 0
    }
}

impl From<bool> for VariantBool {
    fn from(value: bool) -> Self {
        if value {
            VariantBool::TRUE
        } else {
            VariantBool::FALSE
        }
    }
}

/// Element tag of a scalar variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    Bool,
    I1,
    I2,
    I4,
    I8,
    UI1,
    UI2,
    UI4,
    UI8,
    R4,
    R8,
    String,
    Object,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::Bool => "VT_BOOL",
            VarType::I1 => "VT_I1",
            VarType::I2 => "VT_I2",
            VarType::I4 => "VT_I4",
            VarType::I8 => "VT_I8",
            VarType::UI1 => "VT_UI1",
            VarType::UI2 => "VT_UI2",
            VarType::UI4 => "VT_UI4",
            VarType::UI8 => "VT_UI8",
            VarType::R4 => "VT_R4",
            VarType::R8 => "VT_R8",
            VarType::String => "VT_BSTR",
            VarType::Object => "VT_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A tagged wire value
#[derive(Clone)]
pub enum Variant {
    Null,
    Bool(VariantBool),
    I1(i8),
    I2(i16),
    I4(i32),
    I8(i64),
    UI1(u8),
    UI2(u16),
    UI4(u32),
    UI8(u64),
    R4(f32),
    R8(f64),
    /// Text; UTF-16 on the wire, UTF-8 here. Also carries datetimes,
    /// object paths and 64-bit integers.
    String(String),
    /// Embedded instance
    Object(ObjectRef),
    Array(VariantArray),
}

impl Variant {
    /// Scalar tag, or `None` for null and arrays
    pub fn var_type(&self) -> Option<VarType> {
        Some(match self {
            Variant::Null | Variant::Array(_) => return None,
            Variant::Bool(_) => VarType::Bool,
            Variant::I1(_) => VarType::I1,
            Variant::I2(_) => VarType::I2,
            Variant::I4(_) => VarType::I4,
            Variant::I8(_) => VarType::I8,
            Variant::UI1(_) => VarType::UI1,
            Variant::UI2(_) => VarType::UI2,
            Variant::UI4(_) => VarType::UI4,
            Variant::UI8(_) => VarType::UI8,
            Variant::R4(_) => VarType::R4,
            Variant::R8(_) => VarType::R8,
            Variant::String(_) => VarType::String,
            Variant::Object(_) => VarType::Object,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Wire tag name used in conversion errors, e.g. `VT_ARRAY|VT_BSTR`
    pub fn type_name(&self) -> String {
        match self {
            Variant::Null => "VT_NULL".to_string(),
            Variant::Array(array) => format!("VT_ARRAY|{}", array.element_type()),
            other => other
                .var_type()
                .map(|t| t.to_string())
                .unwrap_or_default(),
        }
    }

    /// Build a string array variant. Unlike the generic codec, zero strings
    /// still produce a zero-length wire array.
    pub fn string_array<I, S>(items: I) -> Variant
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Variant::Array(VariantArray {
            element: VarType::String,
            items: items.into_iter().map(|s| Variant::String(s.into())).collect(),
        })
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        use Variant::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a.as_bool() == b.as_bool(),
            (I1(a), I1(b)) => a == b,
            (I2(a), I2(b)) => a == b,
            (I4(a), I4(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (UI1(a), UI1(b)) => a == b,
            (UI2(a), UI2(b)) => a == b,
            (UI4(a), UI4(b)) => a == b,
            (UI8(a), UI8(b)) => a == b,
            (R4(a), R4(b)) => a == b,
            (R8(a), R8(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Object(a), Object(b)) => {
                Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
            }
            (Array(a), Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => f.write_str("Null"),
            Variant::Bool(v) => write!(f, "Bool({})", v.as_bool()),
            Variant::I1(v) => write!(f, "I1({})", v),
            Variant::I2(v) => write!(f, "I2({})", v),
            Variant::I4(v) => write!(f, "I4({})", v),
            Variant::I8(v) => write!(f, "I8({})", v),
            Variant::UI1(v) => write!(f, "UI1({})", v),
            Variant::UI2(v) => write!(f, "UI2({})", v),
            Variant::UI4(v) => write!(f, "UI4({})", v),
            Variant::UI8(v) => write!(f, "UI8({})", v),
            Variant::R4(v) => write!(f, "R4({})", v),
            Variant::R8(v) => write!(f, "R8({})", v),
            Variant::String(v) => write!(f, "String({:?})", v),
            Variant::Object(_) => f.write_str("Object(..)"),
            Variant::Array(a) => f.debug_tuple("Array").field(a).finish(),
        }
    }
}

/// Homogeneous wire array. Nested arrays and null elements are not representable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantArray {
    element: VarType,
    items: Vec<Variant>,
}

impl VariantArray {
    pub fn new(element: VarType, items: Vec<Variant>) -> Result<Self> {
        if let Some(bad) = items.iter().find(|v| v.var_type() != Some(element)) {
            return Err(Error::conversion(bad.type_name(), format!("array element {}", element)));
        }
        Ok(Self { element, items })
    }

    pub fn empty(element: VarType) -> Self {
        Self { element, items: Vec::new() }
    }

    pub fn element_type(&self) -> VarType {
        self.element
    }

    pub fn items(&self) -> &[Variant] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Base kind of a declared CIM property or parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CimBase {
    Empty,
    SInt8,
    UInt8,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
    SInt64,
    UInt64,
    Real32,
    Real64,
    Boolean,
    String,
    DateTime,
    Reference,
    Char16,
    Object,
}

const CIM_FLAG_ARRAY: i32 = 0x2000;

/// Declared type of a property or method parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CimType {
    pub base: CimBase,
    pub array: bool,
}

impl CimType {
    pub const fn scalar(base: CimBase) -> Self {
        Self { base, array: false }
    }

    pub const fn array_of(base: CimBase) -> Self {
        Self { base, array: true }
    }

    pub fn is_reference(&self) -> bool {
        self.base == CimBase::Reference
    }

    pub fn is_object(&self) -> bool {
        self.base == CimBase::Object
    }

    /// Decode a raw `CIMTYPE` value
    pub fn from_raw(raw: i32) -> Self {
        let base = match raw & !CIM_FLAG_ARRAY {
            16 => CimBase::SInt8,
            17 => CimBase::UInt8,
            2 => CimBase::SInt16,
            18 => CimBase::UInt16,
            3 => CimBase::SInt32,
            19 => CimBase::UInt32,
            20 => CimBase::SInt64,
            21 => CimBase::UInt64,
            4 => CimBase::Real32,
            5 => CimBase::Real64,
            11 => CimBase::Boolean,
            8 => CimBase::String,
            101 => CimBase::DateTime,
            102 => CimBase::Reference,
            103 => CimBase::Char16,
            13 => CimBase::Object,
            _ => CimBase::Empty,
        };
        Self { base, array: raw & CIM_FLAG_ARRAY != 0 }
    }

    pub fn to_raw(&self) -> i32 {
        let base = match self.base {
            CimBase::Empty => 0,
            CimBase::SInt8 => 16,
            CimBase::UInt8 => 17,
            CimBase::SInt16 => 2,
            CimBase::UInt16 => 18,
            CimBase::SInt32 => 3,
            CimBase::UInt32 => 19,
            CimBase::SInt64 => 20,
            CimBase::UInt64 => 21,
            CimBase::Real32 => 4,
            CimBase::Real64 => 5,
            CimBase::Boolean => 11,
            CimBase::String => 8,
            CimBase::DateTime => 101,
            CimBase::Reference => 102,
            CimBase::Char16 => 103,
            CimBase::Object => 13,
        };
        if self.array {
            base | CIM_FLAG_ARRAY
        } else {
            base
        }
    }

    /// Automation tag the broker uses to carry a value of this declared type
    pub fn wire_type(&self) -> Option<VarType> {
        Some(match self.base {
            CimBase::Empty => return None,
            CimBase::SInt8 | CimBase::SInt16 | CimBase::Char16 => VarType::I2,
            CimBase::UInt8 => VarType::UI1,
            CimBase::UInt16 | CimBase::SInt32 | CimBase::UInt32 => VarType::I4,
            CimBase::SInt64 | CimBase::UInt64 => VarType::String,
            CimBase::Real32 => VarType::R4,
            CimBase::Real64 => VarType::R8,
            CimBase::Boolean => VarType::Bool,
            CimBase::String | CimBase::DateTime | CimBase::Reference => VarType::String,
            CimBase::Object => VarType::Object,
        })
    }

    /// Whether `value` is an acceptable wire representation of this type
    pub fn accepts(&self, value: &Variant) -> bool {
        match (value, self.array) {
            (Variant::Null, _) => true,
            (Variant::Array(a), true) => self.wire_type() == Some(a.element_type()),
            (Variant::Array(_), false) | (_, true) => false,
            (scalar, false) => scalar.var_type() == self.wire_type(),
        }
    }
}

impl fmt::Display for CimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.base)?;
        if self.array {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cim_type_raw_round_trip() {
        for raw in [16, 17, 2, 18, 3, 19, 20, 21, 4, 5, 11, 8, 101, 102, 103, 13] {
            assert_eq!(CimType::from_raw(raw).to_raw(), raw);
            assert_eq!(CimType::from_raw(raw | 0x2000).to_raw(), raw | 0x2000);
        }
        let t = CimType::from_raw(0x2000 | 18);
        assert_eq!(t, CimType::array_of(CimBase::UInt16));
        assert!(CimType::from_raw(102).is_reference());
    }

    #[test]
    fn test_wire_acceptance() {
        let uint16 = CimType::scalar(CimBase::UInt16);
        assert!(uint16.accepts(&Variant::I4(5)));
        assert!(uint16.accepts(&Variant::Null));
        assert!(!uint16.accepts(&Variant::UI2(5)));

        let strings = CimType::array_of(CimBase::String);
        assert!(strings.accepts(&Variant::string_array(["a"])));
        assert!(!strings.accepts(&Variant::String("a".into())));
    }

    #[test]
    fn test_array_must_be_homogeneous() {
        let err = VariantArray::new(VarType::I4, vec![Variant::I4(1), Variant::String("2".into())]);
        assert!(matches!(err, Err(Error::TypeConversion { .. })));
        assert!(VariantArray::new(VarType::I4, vec![Variant::I4(1)]).is_ok());
    }

    #[test]
    fn test_bool_patterns() {
        assert!(VariantBool(1).as_bool());
        assert!(VariantBool::TRUE.as_bool());
        assert!(!VariantBool::FALSE.as_bool());
        assert_eq!(Variant::Bool(VariantBool(1)), Variant::Bool(VariantBool::TRUE));
        assert_eq!(Variant::string_array(Vec::<String>::new()).type_name(), "VT_ARRAY|VT_BSTR");
    }
}
