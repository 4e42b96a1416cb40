//! Element layout of arrays handed to the automation runtime
//!
//! The runtime has typed constructors for most element types but none for
//! signed bytes or single-precision floats. Those are widened to the next
//! type it can build; the provider coerces them back to the declared type on
//! write.

use crate::variant::{VarType, Variant, VariantArray};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum AutomationArray {
    Strings(Vec<String>),
    Bools(Vec<bool>),
    /// Built from a raw buffer
    Bytes(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F64(Vec<f64>),
}

impl AutomationArray {
    pub fn from_array(array: &VariantArray) -> Result<Self> {
        fn collect<T>(array: &VariantArray, f: impl Fn(&Variant) -> Option<T>) -> Result<Vec<T>> {
            array
                .items()
                .iter()
                .map(|v| f(v).ok_or_else(|| Error::conversion(v.type_name(), "array element")))
                .collect()
        }

        Ok(match array.element_type() {
            VarType::String => Self::Strings(collect(array, |v| v.as_str().map(str::to_string))?),
            VarType::Bool => Self::Bools(collect(array, |v| match v {
                Variant::Bool(b) => Some(b.as_bool()),
                _ => None,
            })?),
            VarType::UI1 => Self::Bytes(collect(array, |v| match v {
                Variant::UI1(n) => Some(*n),
                _ => None,
            })?),
            VarType::I1 => Self::I16(collect(array, |v| match v {
                Variant::I1(n) => Some(i16::from(*n)),
                _ => None,
            })?),
            VarType::I2 => Self::I16(collect(array, |v| match v {
                Variant::I2(n) => Some(*n),
                _ => None,
            })?),
            VarType::I4 => Self::I32(collect(array, |v| match v {
                Variant::I4(n) => Some(*n),
                _ => None,
            })?),
            VarType::I8 => Self::I64(collect(array, |v| match v {
                Variant::I8(n) => Some(*n),
                _ => None,
            })?),
            VarType::UI2 => Self::U16(collect(array, |v| match v {
                Variant::UI2(n) => Some(*n),
                _ => None,
            })?),
            VarType::UI4 => Self::U32(collect(array, |v| match v {
                Variant::UI4(n) => Some(*n),
                _ => None,
            })?),
            VarType::UI8 => Self::U64(collect(array, |v| match v {
                Variant::UI8(n) => Some(*n),
                _ => None,
            })?),
            VarType::R4 => Self::F64(collect(array, |v| match v {
                Variant::R4(n) => Some(f64::from(*n)),
                _ => None,
            })?),
            VarType::R8 => Self::F64(collect(array, |v| match v {
                Variant::R8(n) => Some(*n),
                _ => None,
            })?),
            VarType::Object => {
                return Err(Error::conversion(format!("VT_ARRAY|{}", VarType::Object), "automation array"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{ArrayElement, ToVariant};

    fn layout<T: ArrayElement>(items: Vec<T>) -> AutomationArray {
        match items.to_variant() {
            Variant::Array(array) => AutomationArray::from_array(&array).unwrap(),
            other => panic!("not an array: {other:?}"),
        }
    }

    #[test]
    fn test_byte_arrays_use_a_buffer() {
        assert_eq!(layout(vec![0u8, 7, 255]), AutomationArray::Bytes(vec![0, 7, 255]));
        let empty = VariantArray::empty(VarType::UI1);
        assert_eq!(AutomationArray::from_array(&empty).unwrap(), AutomationArray::Bytes(vec![]));
    }

    #[test]
    fn test_signed_bytes_and_singles_are_widened() {
        let signed = VariantArray::new(VarType::I1, vec![Variant::I1(-128), Variant::I1(5)]).unwrap();
        assert_eq!(AutomationArray::from_array(&signed).unwrap(), AutomationArray::I16(vec![-128, 5]));

        let singles = VariantArray::new(VarType::R4, vec![Variant::R4(1.5), Variant::R4(-0.25)]).unwrap();
        assert_eq!(AutomationArray::from_array(&singles).unwrap(), AutomationArray::F64(vec![1.5, -0.25]));
        assert_eq!(layout(vec![2.5f32]), AutomationArray::F64(vec![2.5]));
    }

    #[test]
    fn test_common_layouts() {
        assert_eq!(
            layout(vec!["a".to_string(), "b".to_string()]),
            AutomationArray::Strings(vec!["a".into(), "b".into()])
        );
        assert_eq!(layout(vec![true, false]), AutomationArray::Bools(vec![true, false]));
        assert_eq!(layout(vec![3u16]), AutomationArray::I32(vec![3]));
    }

    #[test]
    fn test_object_arrays_are_rejected() {
        let objects = VariantArray::empty(VarType::Object);
        assert!(matches!(
            AutomationArray::from_array(&objects),
            Err(Error::TypeConversion { .. })
        ));
    }
}
