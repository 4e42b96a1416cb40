//! WBEM over COM
//!
//! COM is initialized once per process by [`initialize`], which every
//! connect calls; [`shutdown`] tears it down explicitly. Handles are released
//! when their wrapper drops.

use std::any::Any;
use std::ffi::c_void;
use std::rc::Rc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use windows::core::{Interface, BSTR, HSTRING, IUnknown, PCWSTR, VARIANT};
use windows::Win32::Foundation::{BOOL, RPC_E_TOO_LATE};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket, CoTaskMemFree,
    CoUninitialize, CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::{
    InitVariantFromBooleanArray, InitVariantFromBuffer, InitVariantFromDoubleArray, InitVariantFromInt16Array,
    InitVariantFromInt32Array, InitVariantFromInt64Array, InitVariantFromStringArray,
    InitVariantFromUInt16Array, InitVariantFromUInt32Array, InitVariantFromUInt64Array,
    VariantGetBooleanElem, VariantGetDoubleElem, VariantGetElementCount, VariantGetInt32Elem,
    VariantGetInt64Elem, VariantGetStringElem, VariantGetUInt32Elem, VariantGetUInt64Elem, VARENUM,
    VT_ARRAY, VT_BOOL, VT_BSTR, VT_DISPATCH, VT_EMPTY, VT_I1, VT_I2, VT_I4, VT_I8, VT_NULL, VT_R4,
    VT_R8, VT_UI1, VT_UI2, VT_UI4, VT_UI8, VT_UNKNOWN,
};
use windows::Win32::System::Wmi::{
    IEnumWbemClassObject, IWbemClassObject, IWbemContext, IWbemLocator, IWbemObjectTextSrc,
    IWbemServices, WbemLocator, WbemObjectTextSrc, WBEM_E_INVALID_OBJECT_PATH, WBEM_E_NOT_FOUND,
    WBEM_FLAG_FORWARD_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY, WBEM_GENERIC_FLAG_TYPE, WBEM_INFINITE,
    WMI_OBJ_TEXT_CIM_DTD_2_0,
};

use super::safearray::AutomationArray;
use super::{Connection, Connector, Credentials, PropertyBag, RawEnum, RawObject};
use crate::variant::{CimType, ObjectRef, VarType, Variant, VariantArray, VariantBool};
use crate::{Error, Result};

static COM_STATE: Mutex<bool> = Mutex::new(false);

/// Initialize COM and process security. Safe to call repeatedly.
pub fn initialize() -> Result<()> {
    let mut initialized = COM_STATE.lock();
    if *initialized {
        return Ok(());
    }
    unsafe {
        CoInitializeEx(None, COINIT_MULTITHREADED).ok()?;
        let security = CoInitializeSecurity(
            None,
            -1,
            None,
            None,
            RPC_C_AUTHN_LEVEL_DEFAULT,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
            None,
        );
        // the host process may already have chosen security settings
        if let Err(e) = security {
            if e.code() != RPC_E_TOO_LATE {
                CoUninitialize();
                return Err(e.into());
            }
        }
    }
    *initialized = true;
    debug!("COM initialized");
    Ok(())
}

/// Undo [`initialize`]. No-op if COM was never initialized.
pub fn shutdown() {
    let mut initialized = COM_STATE.lock();
    if *initialized {
        unsafe { CoUninitialize() };
        *initialized = false;
        debug!("COM shut down");
    }
}

/// Connects through the local WBEM locator
#[derive(Debug, Default, Clone, Copy)]
pub struct ComConnector;

impl Connector for ComConnector {
    fn connect(
        &self,
        server: Option<&str>,
        namespace: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Connection>> {
        initialize()?;
        let resource = match server {
            Some(host) => format!(r"\\{}\{}", host, namespace),
            None => namespace.to_string(),
        };
        let (user, password) = match credentials {
            Some(c) => (BSTR::from(c.user.as_str()), BSTR::from(c.password.as_str())),
            None => (BSTR::new(), BSTR::new()),
        };

        let services = unsafe {
            let locator: IWbemLocator = CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)?;
            let services = locator.ConnectServer(
                &BSTR::from(resource.as_str()),
                &user,
                &password,
                &BSTR::new(),
                0,
                &BSTR::new(),
                None::<&IWbemContext>,
            )?;
            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                None,
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )?;
            services
        };
        Ok(Box::new(ComConnection { services }))
    }
}

struct ComConnection {
    services: IWbemServices,
}

fn enum_flags() -> WBEM_GENERIC_FLAG_TYPE {
    WBEM_GENERIC_FLAG_TYPE(WBEM_FLAG_FORWARD_ONLY.0 | WBEM_FLAG_RETURN_IMMEDIATELY.0)
}

fn wide(text: &str) -> HSTRING {
    HSTRING::from(text)
}

impl Connection for ComConnection {
    fn exec_query(&self, wql: &str) -> Result<Box<dyn RawEnum>> {
        let inner = unsafe {
            self.services
                .ExecQuery(&BSTR::from("WQL"), &BSTR::from(wql), enum_flags(), None::<&IWbemContext>)?
        };
        Ok(Box::new(ComEnum { inner }))
    }

    fn create_instance_enum(&self, class_name: &str) -> Result<Box<dyn RawEnum>> {
        let inner = unsafe {
            self.services
                .CreateInstanceEnum(&BSTR::from(class_name), enum_flags(), None::<&IWbemContext>)?
        };
        Ok(Box::new(ComEnum { inner }))
    }

    fn get_object(&self, path: &str) -> Result<Option<ObjectRef>> {
        let mut object: Option<IWbemClassObject> = None;
        let fetched = unsafe {
            self.services.GetObject(
                &BSTR::from(path),
                WBEM_GENERIC_FLAG_TYPE(0),
                None::<&IWbemContext>,
                Some(&mut object),
                None,
            )
        };
        match fetched {
            Ok(()) => Ok(object.map(ComObject::wrap)),
            Err(e) if e.code().0 == WBEM_E_NOT_FOUND.0 || e.code().0 == WBEM_E_INVALID_OBJECT_PATH.0 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exec_method(
        &self,
        path: &str,
        method: &str,
        in_params: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>> {
        let in_object = in_params.as_deref().map(ComObject::of).transpose()?;
        let mut out: Option<IWbemClassObject> = None;
        unsafe {
            self.services.ExecMethod(
                &BSTR::from(path),
                &BSTR::from(method),
                WBEM_GENERIC_FLAG_TYPE(0),
                None::<&IWbemContext>,
                in_object.map(|o| &o.inner),
                Some(&mut out),
                None,
            )?;
        }
        Ok(out.map(ComObject::wrap))
    }
}

struct ComEnum {
    inner: IEnumWbemClassObject,
}

impl RawEnum for ComEnum {
    fn next(&mut self) -> Result<Option<ObjectRef>> {
        let mut objects = [None];
        let mut returned = 0u32;
        unsafe {
            self.inner
                .Next(WBEM_INFINITE.0, &mut objects, &mut returned)
                .ok()?;
        }
        let [object] = objects;
        Ok(if returned == 0 { None } else { object.map(ComObject::wrap) })
    }
}

/// Wraps one `IWbemClassObject`
pub struct ComObject {
    inner: IWbemClassObject,
}

impl ComObject {
    fn wrap(inner: IWbemClassObject) -> ObjectRef {
        Rc::new(ComObject { inner })
    }

    fn of(object: &dyn RawObject) -> Result<&ComObject> {
        object
            .as_any()
            .downcast_ref::<ComObject>()
            .ok_or_else(|| Error::conversion("foreign object handle", "IWbemClassObject"))
    }
}

/// Ends a property enumeration on every exit path
struct EnumerationGuard<'a>(&'a IWbemClassObject);

impl Drop for EnumerationGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.0.EndEnumeration() } {
            warn!(error = %e, "failed to end property enumeration");
        }
    }
}

impl RawObject for ComObject {
    fn get(&self, name: &str) -> Result<(Variant, CimType)> {
        let mut value = VARIANT::default();
        let mut cim_type = 0i32;
        unsafe {
            self.inner
                .Get(PCWSTR(wide(name).as_ptr()), 0, &mut value, Some(&mut cim_type), None)?;
        }
        Ok((from_com(&value)?, CimType::from_raw(cim_type)))
    }

    fn put(&self, name: &str, value: &Variant) -> Result<()> {
        let name = wide(name);
        match to_com(value)? {
            Some(com) => unsafe { self.inner.Put(PCWSTR(name.as_ptr()), 0, &com, 0)? },
            None => unsafe { self.inner.Put(PCWSTR(name.as_ptr()), 0, std::ptr::null(), 0)? },
        }
        Ok(())
    }

    fn properties(&self) -> Result<PropertyBag> {
        let mut bag = PropertyBag::new();
        unsafe {
            self.inner.BeginEnumeration(0)?;
            let _guard = EnumerationGuard(&self.inner);
            loop {
                let mut name = BSTR::new();
                let mut value = VARIANT::default();
                let mut cim_type = 0i32;
                self.inner
                    .Next(0, &mut name, &mut value, Some(&mut cim_type), None)?;
                // WBEM_S_NO_MORE_DATA leaves the name empty
                if name.is_empty() {
                    break;
                }
                bag.push(name.to_string(), from_com(&value)?, CimType::from_raw(cim_type));
            }
        }
        Ok(bag)
    }

    fn spawn_instance(&self) -> Result<ObjectRef> {
        let spawned = unsafe { self.inner.SpawnInstance(0)? };
        Ok(ComObject::wrap(spawned))
    }

    fn clone_object(&self) -> Result<ObjectRef> {
        let copy = unsafe { self.inner.Clone()? };
        Ok(ComObject::wrap(copy))
    }

    fn method_signature(&self, method: &str) -> Result<(Option<ObjectRef>, Option<ObjectRef>)> {
        let mut input: Option<IWbemClassObject> = None;
        let mut output: Option<IWbemClassObject> = None;
        unsafe {
            self.inner
                .GetMethod(PCWSTR(wide(method).as_ptr()), 0, &mut input, &mut output)?;
        }
        Ok((input.map(ComObject::wrap), output.map(ComObject::wrap)))
    }

    fn object_text(&self) -> Result<String> {
        let text = unsafe {
            let source: IWbemObjectTextSrc =
                CoCreateInstance(&WbemObjectTextSrc, None, CLSCTX_INPROC_SERVER)?;
            source.GetText(
                0,
                &self.inner,
                WMI_OBJ_TEXT_CIM_DTD_2_0.0 as u32,
                None::<&IWbemContext>,
            )?
        };
        Ok(text.to_string())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn from_com(value: &VARIANT) -> Result<Variant> {
    let vt = value.vt();
    if vt.0 & VT_ARRAY.0 != 0 {
        return array_from_com(value, VARENUM(vt.0 & !VT_ARRAY.0));
    }

    Ok(match vt {
        VT_EMPTY | VT_NULL => Variant::Null,
        VT_BOOL => Variant::Bool(VariantBool::from(bool::try_from(value)?)),
        VT_I1 => Variant::I1(i32::try_from(value)? as i8),
        VT_I2 => Variant::I2(i32::try_from(value)? as i16),
        VT_I4 => Variant::I4(i32::try_from(value)?),
        VT_I8 => Variant::I8(i64::try_from(value)?),
        VT_UI1 => Variant::UI1(u32::try_from(value)? as u8),
        VT_UI2 => Variant::UI2(u32::try_from(value)? as u16),
        VT_UI4 => Variant::UI4(u32::try_from(value)?),
        VT_UI8 => Variant::UI8(u64::try_from(value)?),
        VT_R4 => Variant::R4(f64::try_from(value)? as f32),
        VT_R8 => Variant::R8(f64::try_from(value)?),
        VT_BSTR => Variant::String(BSTR::try_from(value)?.to_string()),
        VT_UNKNOWN | VT_DISPATCH => {
            let unknown = IUnknown::try_from(value)?;
            Variant::Object(ComObject::wrap(unknown.cast::<IWbemClassObject>()?))
        }
        other => return Err(Error::conversion(format!("VARTYPE {}", other.0), "Variant")),
    })
}

fn array_from_com(value: &VARIANT, element: VARENUM) -> Result<Variant> {
    let count = unsafe { VariantGetElementCount(value) };
    let (tag, items) = unsafe {
        match element {
            VT_BSTR => {
                let mut items = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let text = VariantGetStringElem(value, i)?;
                    items.push(Variant::String(text.to_string().unwrap_or_default()));
                    CoTaskMemFree(Some(text.as_ptr() as *const _));
                }
                (VarType::String, items)
            }
            VT_BOOL => (
                VarType::Bool,
                (0..count)
                    .map(|i| VariantGetBooleanElem(value, i).map(|b| Variant::Bool(VariantBool::from(b.as_bool()))))
                    .collect::<windows::core::Result<_>>()?,
            ),
            VT_I1 | VT_I2 | VT_UI1 | VT_UI2 | VT_I4 => {
                let tag = match element {
                    VT_I1 => VarType::I1,
                    VT_I2 => VarType::I2,
                    VT_UI1 => VarType::UI1,
                    VT_UI2 => VarType::UI2,
                    _ => VarType::I4,
                };
                let items = (0..count)
                    .map(|i| {
                        VariantGetInt32Elem(value, i).map(|n| match tag {
                            VarType::I1 => Variant::I1(n as i8),
                            VarType::I2 => Variant::I2(n as i16),
                            VarType::UI1 => Variant::UI1(n as u8),
                            VarType::UI2 => Variant::UI2(n as u16),
                            _ => Variant::I4(n),
                        })
                    })
                    .collect::<windows::core::Result<_>>()?;
                (tag, items)
            }
            VT_UI4 => (
                VarType::UI4,
                (0..count)
                    .map(|i| VariantGetUInt32Elem(value, i).map(Variant::UI4))
                    .collect::<windows::core::Result<_>>()?,
            ),
            VT_I8 => (
                VarType::I8,
                (0..count)
                    .map(|i| VariantGetInt64Elem(value, i).map(Variant::I8))
                    .collect::<windows::core::Result<_>>()?,
            ),
            VT_UI8 => (
                VarType::UI8,
                (0..count)
                    .map(|i| VariantGetUInt64Elem(value, i).map(Variant::UI8))
                    .collect::<windows::core::Result<_>>()?,
            ),
            VT_R4 | VT_R8 => {
                let tag = if element == VT_R4 { VarType::R4 } else { VarType::R8 };
                let items = (0..count)
                    .map(|i| {
                        VariantGetDoubleElem(value, i).map(|d| {
                            if tag == VarType::R4 {
                                Variant::R4(d as f32)
                            } else {
                                Variant::R8(d)
                            }
                        })
                    })
                    .collect::<windows::core::Result<_>>()?;
                (tag, items)
            }
            other => {
                return Err(Error::conversion(
                    format!("VT_ARRAY of VARTYPE {}", other.0),
                    "Variant",
                ))
            }
        }
    };
    Ok(Variant::Array(VariantArray::new(tag, items)?))
}

/// `None` stands for a null property value
fn to_com(value: &Variant) -> Result<Option<VARIANT>> {
    Ok(Some(match value {
        Variant::Null => return Ok(None),
        Variant::Bool(b) => VARIANT::from(b.as_bool()),
        Variant::I1(v) => VARIANT::from(*v as i16),
        Variant::I2(v) => VARIANT::from(*v),
        Variant::I4(v) => VARIANT::from(*v),
        Variant::I8(v) => VARIANT::from(*v),
        Variant::UI1(v) => VARIANT::from(*v),
        Variant::UI2(v) => VARIANT::from(*v),
        Variant::UI4(v) => VARIANT::from(*v),
        Variant::UI8(v) => VARIANT::from(*v),
        Variant::R4(v) => VARIANT::from(*v),
        Variant::R8(v) => VARIANT::from(*v),
        Variant::String(s) => VARIANT::from(BSTR::from(s.as_str())),
        Variant::Object(object) => {
            let unknown: IUnknown = ComObject::of(object.as_ref())?.inner.cast()?;
            VARIANT::from(unknown)
        }
        Variant::Array(array) => array_to_com(array)?,
    }))
}

fn array_to_com(array: &VariantArray) -> Result<VARIANT> {
    let value = unsafe {
        match AutomationArray::from_array(array)? {
            AutomationArray::Strings(items) => {
                let wide: Vec<HSTRING> = items.iter().map(|s| HSTRING::from(s.as_str())).collect();
                let pointers: Vec<PCWSTR> = wide.iter().map(|h| PCWSTR(h.as_ptr())).collect();
                InitVariantFromStringArray(&pointers)?
            }
            AutomationArray::Bools(items) => {
                let flags: Vec<BOOL> = items.into_iter().map(BOOL::from).collect();
                InitVariantFromBooleanArray(&flags)?
            }
            AutomationArray::Bytes(bytes) => {
                InitVariantFromBuffer(bytes.as_ptr().cast::<c_void>(), bytes.len() as u32)?
            }
            AutomationArray::I16(items) => InitVariantFromInt16Array(&items)?,
            AutomationArray::I32(items) => InitVariantFromInt32Array(&items)?,
            AutomationArray::I64(items) => InitVariantFromInt64Array(&items)?,
            AutomationArray::U16(items) => InitVariantFromUInt16Array(&items)?,
            AutomationArray::U32(items) => InitVariantFromUInt32Array(&items)?,
            AutomationArray::U64(items) => InitVariantFromUInt64Array(&items)?,
            AutomationArray::F64(items) => InitVariantFromDoubleArray(&items)?,
        }
    };
    Ok(value)
}
