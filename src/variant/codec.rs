//! Type-directed conversion between Rust values and wire variants
//!
//! Encoding follows the automation variant mapping WMI expects:
//!
//! | CIM type | wire tag |
//! |---|---|
//! | sint8, sint16 | `VT_I2` |
//! | sint32, uint16, uint32 | `VT_I4` |
//! | uint8 | `VT_UI1` |
//! | sint64, uint64 | `VT_BSTR` (decimal text) |
//! | real32 / real64 | `VT_R4` / `VT_R8` |
//!
//! The 64-bit rule is a protocol limitation: automation variants have no
//! numeric slot WMI accepts for 64-bit values. Decoding accepts decimal or
//! `0x` hexadecimal text for those, as the broker may send either.
//!
//! Decoding is driven by the destination type, so a `u16` field accepts the
//! wider `VT_I4` tag the broker actually sends. A null variant decodes to the
//! destination's empty value.

use super::{Variant, VariantArray, VarType, VariantBool};
use crate::{Error, Result};

/// Encode a Rust value as a wire variant
pub trait ToVariant {
    fn to_variant(&self) -> Variant;

    /// Whether the property bag mapper should leave this value to the
    /// remote default instead of writing it. Empty strings and `None`.
    fn is_write_suppressed(&self) -> bool {
        false
    }

    /// Encoding used when the value is explicitly present inside `Some`.
    /// Sequences override this so an empty one stays a zero-length array.
    fn to_present_variant(&self) -> Variant {
        self.to_variant()
    }
}

/// Decode a wire variant into a Rust value
pub trait FromVariant: Sized {
    fn from_variant(value: &Variant) -> Result<Self>;

    /// Whether the target is an object handle, so a reference-typed value
    /// should be resolved to the object it names before decoding
    fn is_object_handle() -> bool {
        false
    }
}

/// Scalar types that can be packed into a wire array
pub trait ArrayElement: ToVariant {
    const WIRE: VarType;
    /// An empty sequence of this element encodes as null rather than a zero-length array
    const EMPTY_IS_NULL: bool = false;
}

impl<T: ToVariant + ?Sized> ToVariant for &T {
    fn to_variant(&self) -> Variant {
        (**self).to_variant()
    }

    fn is_write_suppressed(&self) -> bool {
        (**self).is_write_suppressed()
    }

    fn to_present_variant(&self) -> Variant {
        (**self).to_present_variant()
    }
}

impl ToVariant for Variant {
    fn to_variant(&self) -> Variant {
        self.clone()
    }
}

impl FromVariant for Variant {
    fn from_variant(value: &Variant) -> Result<Self> {
        Ok(value.clone())
    }
}

impl ToVariant for bool {
    fn to_variant(&self) -> Variant {
        Variant::Bool(VariantBool::from(*self))
    }
}

impl ArrayElement for bool {
    const WIRE: VarType = VarType::Bool;
}

impl FromVariant for bool {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Null => Ok(false),
            Variant::Bool(b) => Ok(b.as_bool()),
            other => Ok(wire_integer(other, "bool")? != 0),
        }
    }
}

macro_rules! encode_integer {
    ($($t:ty => $tag:ident as $wire:ty),* $(,)?) => {$(
        impl ToVariant for $t {
            fn to_variant(&self) -> Variant {
                Variant::$tag(*self as $wire)
            }
        }

        impl ArrayElement for $t {
            const WIRE: VarType = VarType::$tag;
        }
    )*};
}

encode_integer! {
    i8 => I2 as i16,
    i16 => I2 as i16,
    i32 => I4 as i32,
    u8 => UI1 as u8,
    u16 => I4 as i32,
    // uint32 shares the signed slot; the bit pattern is preserved
    u32 => I4 as i32,
}

macro_rules! encode_wide_integer {
    ($($t:ty),*) => {$(
        impl ToVariant for $t {
            fn to_variant(&self) -> Variant {
                Variant::String(self.to_string())
            }
        }

        impl ArrayElement for $t {
            const WIRE: VarType = VarType::String;
        }
    )*};
}

encode_wide_integer!(i64, u64);

/// Widen any integer-bearing variant, including 64-bit decimal text
fn wire_integer(value: &Variant, target: &str) -> Result<i128> {
    let n = match value {
        Variant::I1(v) => *v as i128,
        Variant::I2(v) => *v as i128,
        Variant::I4(v) => *v as i128,
        Variant::I8(v) => *v as i128,
        Variant::UI1(v) => *v as i128,
        Variant::UI2(v) => *v as i128,
        Variant::UI4(v) => *v as i128,
        Variant::UI8(v) => *v as i128,
        Variant::String(s) => {
            return parse_c_integer(s).ok_or_else(|| Error::conversion(format!("VT_BSTR {:?}", s), target))
        }
        other => return Err(Error::conversion(other.type_name(), target)),
    };
    Ok(n)
}

fn parse_c_integer(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

macro_rules! decode_integer {
    ($($t:ty $(, reinterpret $tag:ident)?);* $(;)?) => {$(
        impl FromVariant for $t {
            fn from_variant(value: &Variant) -> Result<Self> {
                match value {
                    Variant::Null => Ok(0),
                    $(Variant::$tag(v) => Ok(*v as $t),)?
                    other => {
                        let n = wire_integer(other, stringify!($t))?;
                        <$t>::try_from(n).map_err(|_| {
                            Error::conversion(format!("{} {}", other.type_name(), n), stringify!($t))
                        })
                    }
                }
            }
        }
    )*};
}

decode_integer! {
    i8;
    i16;
    i32;
    i64;
    u8, reinterpret I1;
    u16, reinterpret I2;
    u32, reinterpret I4;
    u64, reinterpret I8;
}

impl ToVariant for f32 {
    fn to_variant(&self) -> Variant {
        Variant::R4(*self)
    }
}

impl ArrayElement for f32 {
    const WIRE: VarType = VarType::R4;
}

impl ToVariant for f64 {
    fn to_variant(&self) -> Variant {
        Variant::R8(*self)
    }
}

impl ArrayElement for f64 {
    const WIRE: VarType = VarType::R8;
}

impl FromVariant for f64 {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Null => Ok(0.0),
            Variant::R4(v) => Ok(*v as f64),
            Variant::R8(v) => Ok(*v),
            Variant::String(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::conversion(format!("VT_BSTR {:?}", s), "f64")),
            other => Ok(wire_integer(other, "f64")? as f64),
        }
    }
}

impl FromVariant for f32 {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::R4(v) => Ok(*v),
            other => f64::from_variant(other).map(|v| v as f32),
        }
    }
}

impl ToVariant for str {
    fn to_variant(&self) -> Variant {
        Variant::String(self.to_string())
    }

    fn is_write_suppressed(&self) -> bool {
        self.is_empty()
    }
}

impl ToVariant for String {
    fn to_variant(&self) -> Variant {
        Variant::String(self.clone())
    }

    fn is_write_suppressed(&self) -> bool {
        self.is_empty()
    }
}

impl ArrayElement for String {
    const WIRE: VarType = VarType::String;
    const EMPTY_IS_NULL: bool = true;
}

impl ArrayElement for &str {
    const WIRE: VarType = VarType::String;
    const EMPTY_IS_NULL: bool = true;
}

impl FromVariant for String {
    fn from_variant(value: &Variant) -> Result<Self> {
        Ok(match value {
            Variant::Null => String::new(),
            Variant::String(s) => s.clone(),
            Variant::Bool(b) => b.as_bool().to_string(),
            Variant::R4(v) => v.to_string(),
            Variant::R8(v) => v.to_string(),
            Variant::Object(_) | Variant::Array(_) => {
                return Err(Error::conversion(value.type_name(), "String"))
            }
            other => wire_integer(other, "String")?.to_string(),
        })
    }
}

impl<T: ToVariant> ToVariant for Option<T> {
    fn to_variant(&self) -> Variant {
        match self {
            Some(v) => v.to_present_variant(),
            None => Variant::Null,
        }
    }

    fn is_write_suppressed(&self) -> bool {
        match self {
            Some(v) => v.is_write_suppressed(),
            None => true,
        }
    }
}

impl<T: FromVariant> FromVariant for Option<T> {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Null => Ok(None),
            other => T::from_variant(other).map(Some),
        }
    }

    fn is_object_handle() -> bool {
        T::is_object_handle()
    }
}

impl<T: ArrayElement> ToVariant for [T] {
    fn to_variant(&self) -> Variant {
        if self.is_empty() && T::EMPTY_IS_NULL {
            return Variant::Null;
        }
        self.to_present_variant()
    }

    fn to_present_variant(&self) -> Variant {
        let items = self.iter().map(ToVariant::to_variant).collect();
        Variant::Array(VariantArray { element: T::WIRE, items })
    }
}

impl<T: ArrayElement> ToVariant for Vec<T> {
    fn to_variant(&self) -> Variant {
        self.as_slice().to_variant()
    }

    fn to_present_variant(&self) -> Variant {
        self.as_slice().to_present_variant()
    }
}

impl<T: FromVariant> FromVariant for Vec<T> {
    fn from_variant(value: &Variant) -> Result<Self> {
        match value {
            Variant::Null => Ok(Vec::new()),
            // one bad element fails the whole array
            Variant::Array(array) => array.items().iter().map(T::from_variant).collect(),
            other => Err(Error::conversion(other.type_name(), "array")),
        }
    }
}
