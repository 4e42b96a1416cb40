//! Fluent builder for one remote method call
//!
//! `begin → set* → execute → get* → end`. The first failure at any stage is
//! kept and every later call becomes a no-op, so a chain only needs checking
//! once, at [`MethodExecutor::end`]:
//!
//! ```ignore
//! let mut job = None;
//! service
//!     .begin_invoke(&vsms, "AddKvpItems")
//!     .set("TargetSystem", &vm)
//!     .set("DataItems", vec![item_text])
//!     .execute()
//!     .get_instance("Job", &mut job)
//!     .end()?;
//! ```

use tracing::debug;

use crate::variant::{CimDateTime, FromVariant, ToVariant, Variant};
use crate::wmi::{Instance, Service};
use crate::{Error, Result};

/// A staged input value
pub enum Argument<'a> {
    Value(Variant),
    /// Always sent as a wire array, even when empty
    Strings(Vec<String>),
    /// Sent as a path or inline depending on the parameter's declared type
    Object(&'a Instance),
}

macro_rules! value_argument {
    ($($t:ty),* $(,)?) => {$(
        impl From<$t> for Argument<'_> {
            fn from(value: $t) -> Self {
                Argument::Value(value.to_variant())
            }
        }
    )*};
}

value_argument!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String, &str, CimDateTime, Variant);

impl From<Vec<u16>> for Argument<'_> {
    fn from(value: Vec<u16>) -> Self {
        Argument::Value(value.to_variant())
    }
}

impl From<Vec<u32>> for Argument<'_> {
    fn from(value: Vec<u32>) -> Self {
        Argument::Value(value.to_variant())
    }
}

impl From<Vec<String>> for Argument<'_> {
    fn from(value: Vec<String>) -> Self {
        Argument::Strings(value)
    }
}

impl From<&[&str]> for Argument<'_> {
    fn from(value: &[&str]) -> Self {
        Argument::Strings(value.iter().map(|s| s.to_string()).collect())
    }
}

impl<'a> From<&'a Instance> for Argument<'a> {
    fn from(value: &'a Instance) -> Self {
        Argument::Object(value)
    }
}

/// One in-flight method call. Single use.
pub struct MethodExecutor<'s> {
    service: &'s Service,
    path: String,
    method: String,
    in_params: Option<Instance>,
    out_params: Option<Instance>,
    executed: bool,
    ended: bool,
    err: Option<Error>,
}

impl<'s> MethodExecutor<'s> {
    fn poisoned(service: &'s Service, method: &str, err: Error) -> Self {
        Self {
            service,
            path: String::new(),
            method: method.to_string(),
            in_params: None,
            out_params: None,
            executed: false,
            ended: false,
            err: Some(err),
        }
    }

    /// Prepare a call of `method` on `target`. The input template comes from
    /// the target's class definition.
    pub fn begin(service: &'s Service, target: &Instance, method: &str) -> Self {
        let prepared = target.require_path().and_then(|path| {
            let class = service.get_class_instance(target)?;
            let in_params = class.method_parameters(method)?;
            Ok((path, in_params))
        });
        Self::prepared(service, method, prepared)
    }

    /// Prepare a call of `method` on `object_path`, taking the input template
    /// from the class at `class_path`
    pub fn begin_path(service: &'s Service, class_path: &str, object_path: &str, method: &str) -> Self {
        let prepared = service
            .get_object(class_path)
            .and_then(|class| class.method_parameters(method))
            .map(|in_params| (object_path.to_string(), in_params));
        Self::prepared(service, method, prepared)
    }

    fn prepared(service: &'s Service, method: &str, prepared: Result<(String, Option<Instance>)>) -> Self {
        match prepared {
            Ok((path, in_params)) => Self {
                service,
                path,
                method: method.to_string(),
                in_params,
                out_params: None,
                executed: false,
                ended: false,
                err: None,
            },
            Err(err) => Self::poisoned(service, method, err),
        }
    }

    /// Stage an input parameter
    pub fn set<'a>(&mut self, name: &str, value: impl Into<Argument<'a>>) -> &mut Self {
        if self.err.is_some() || self.ended {
            return self;
        }
        if let Err(err) = self.stage(name, value.into()) {
            self.err = Some(err);
        }
        self
    }

    fn stage(&self, name: &str, value: Argument<'_>) -> Result<()> {
        let in_params = self.in_params.as_ref().ok_or_else(|| {
            Error::NotFound(format!("{} takes no input parameter {}", self.method, name))
        })?;

        let wire = match value {
            Argument::Value(value) => value,
            Argument::Strings(items) => Variant::string_array(items),
            Argument::Object(object) => {
                if in_params.is_reference_property(name)? {
                    Variant::String(object.require_path()?)
                } else {
                    object.to_variant()
                }
            }
        };
        in_params.put_variant(name, &wire)
    }

    /// Invoke the method. The staged input object is released whatever the
    /// outcome. Only the first call reaches the service.
    pub fn execute(&mut self) -> &mut Self {
        if self.err.is_some() || self.executed || self.ended {
            return self;
        }
        let in_params = self.in_params.take();
        debug!(path = %self.path, method = %self.method, "invoking method");
        match self.service.exec_method(&self.path, &self.method, in_params) {
            Ok(out) => {
                self.out_params = out;
                self.executed = true;
            }
            Err(err) => self.err = Some(err),
        }
        self
    }

    fn output(&self, name: &str) -> Result<&Instance> {
        if self.ended {
            return Err(Error::NotFound(format!("output {} read after {} ended", name, self.method)));
        }
        if !self.executed {
            return Err(Error::NotFound(format!(
                "output {} read before {} was executed",
                name, self.method
            )));
        }
        self.out_params
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("{} returned no output parameter {}", self.method, name)))
    }

    /// Read an output parameter. When `T` is an object handle, reference
    /// parameters are resolved through the service.
    pub fn get<T: FromVariant>(&mut self, name: &str, dest: &mut T) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match self.decode::<T>(name) {
            Ok(value) => *dest = value,
            Err(err) => self.err = Some(err),
        }
        self
    }

    fn decode<T: FromVariant>(&self, name: &str) -> Result<T> {
        let (value, cim_type) = self.output(name)?.get_typed(name)?;
        match value {
            Variant::String(path) if cim_type.is_reference() && T::is_object_handle() => {
                let object = self.service.get_object(&path)?;
                T::from_variant(&Variant::Object(object.into_raw()))
            }
            other => T::from_variant(&other),
        }
    }

    /// Read an output parameter holding an object. Reference parameters are
    /// resolved through the service; embedded objects are returned directly.
    pub fn get_instance(&mut self, name: &str, dest: &mut Option<Instance>) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match self.decode::<Option<Instance>>(name) {
            Ok(value) => *dest = value,
            Err(err) => self.err = Some(err),
        }
        self
    }

    /// First error recorded so far
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Release the output parameters and report the first error, if any
    pub fn end(&mut self) -> Result<()> {
        self.ended = true;
        self.in_params = None;
        self.out_params = None;
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{CimBase, CimType};
    use crate::wmi::memory::{ClassDef, MemoryBroker, MethodDef};
    use crate::wmi::{MockConnection, RawObject};

    fn string() -> CimType {
        CimType::scalar(CimBase::String)
    }

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.define_class(
            ClassDef::new("Msvm_Setting")
                .property("InstanceID", string())
                .property("Size", CimType::scalar(CimBase::UInt64)),
        );
        broker.define_class(
            ClassDef::new("Msvm_Service").method(
                MethodDef::new("Configure")
                    .input("Target", CimType::scalar(CimBase::Reference))
                    .input("Embedded", CimType::scalar(CimBase::Object))
                    .input("Names", CimType::array_of(CimBase::String))
                    .input("Count", CimType::scalar(CimBase::UInt32))
                    .output("Result", CimType::scalar(CimBase::Reference))
                    .output("Inline", CimType::scalar(CimBase::Object))
                    .output("Echo", string())
                    .output("ReturnValue", CimType::scalar(CimBase::UInt32))
                    .handler(|call| {
                        let target: String = call.input("Target")?;
                        let names: Vec<String> = call.input("Names")?;
                        let embedded = call
                            .inputs
                            .get("Embedded")
                            .cloned()
                            .unwrap_or(Variant::Null);
                        let size: u64 = match &embedded {
                            Variant::Object(obj) => u64::from_variant(&obj.get("Size")?.0)?,
                            _ => 0,
                        };
                        let count: u32 = call.input("Count")?;
                        Ok(vec![
                            ("Result".into(), Variant::String(target.clone())),
                            ("Inline".into(), embedded),
                            ("Echo".into(), Variant::String(format!("{}:{}:{}:{}", target, names.len(), size, count))),
                            ("ReturnValue".into(), Variant::I4(0)),
                        ])
                    }),
            )
            .method(
                MethodDef::new("Reset")
                    .output("Result", CimType::scalar(CimBase::Reference))
                    .output("ReturnValue", CimType::scalar(CimBase::UInt32))
                    .handler(|_| Err(Error::Remote("reset refused".into()))),
            ),
        );
        broker
    }

    fn exec_count(broker: &MemoryBroker) -> usize {
        broker
            .calls()
            .iter()
            .filter(|c| matches!(c, crate::wmi::memory::Call::ExecMethod { .. }))
            .count()
    }

    #[test]
    fn test_reference_and_embedded_parameters() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let setting_path = broker
            .insert_instance("Msvm_Setting", [("InstanceID", Variant::String("s1".into()))])
            .unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();
        let setting = service.get_object(&setting_path).unwrap();
        let inline = service.spawn_instance("Msvm_Setting").unwrap();
        inline.put("Size", &42u64).unwrap();

        let (mut echo, mut result, mut embedded, mut code) = (String::new(), None, None, 1u32);
        service
            .begin_invoke(&svc, "Configure")
            .set("Target", &setting)
            .set("Embedded", &inline)
            .set("Names", Vec::<String>::new())
            .set("Count", 3u32)
            .execute()
            .get("Echo", &mut echo)
            .get("ReturnValue", &mut code)
            .get_instance("Result", &mut result)
            .get_instance("Inline", &mut embedded)
            .end()
            .unwrap();

        assert_eq!(echo, format!("{}:0:42:3", setting_path));
        assert_eq!(code, 0);
        let result = result.unwrap();
        assert_eq!(result.get_as_string("InstanceID").unwrap(), "s1");
        assert_eq!(embedded.unwrap().get_as_uint("Size").unwrap(), 42);
    }

    #[test]
    fn test_get_resolves_reference_into_object() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let setting_path = broker
            .insert_instance("Msvm_Setting", [("InstanceID", Variant::String("s2".into()))])
            .unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();
        let setting = service.get_object(&setting_path).unwrap();

        let (mut result, mut path) = (None::<Instance>, String::new());
        service
            .begin_invoke(&svc, "Configure")
            .set("Target", &setting)
            .set("Count", 1u32)
            .execute()
            .get("Result", &mut result)
            .get("Result", &mut path)
            .end()
            .unwrap();

        assert_eq!(result.unwrap().get_as_string("InstanceID").unwrap(), "s2");
        assert_eq!(path, setting_path);
    }

    #[test]
    fn test_executor_is_single_use() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();

        let mut exec = service.begin_invoke(&svc, "Configure");
        broker.clear_calls();
        exec.set("Count", 1u32).execute().execute();
        assert_eq!(exec_count(&broker), 1);

        exec.end().unwrap();
        let mut echo = String::new();
        exec.set("Count", 2u32).execute();
        assert_eq!(exec_count(&broker), 1);
        assert!(exec.get("Echo", &mut echo).end().is_err());
        assert!(echo.is_empty());
    }

    #[test]
    fn test_failed_execute_short_circuits_reads() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();

        let mut exec = service.begin_invoke(&svc, "Reset");
        broker.clear_calls();
        let (mut code, mut result) = (7u32, None);
        let err = exec
            .execute()
            .get("ReturnValue", &mut code)
            .get_instance("Result", &mut result)
            .end()
            .unwrap_err();

        assert_eq!(broker.calls().len(), 1);
        assert_eq!(exec_count(&broker), 1);
        assert!(matches!(err, Error::Remote(ref m) if m == "reset refused"));
        assert_eq!(code, 7);
        assert!(result.is_none());
    }

    #[test]
    fn test_wrong_parameter_kind_is_rejected() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();

        let err = service
            .begin_invoke(&svc, "Configure")
            .set("Count", "three")
            .execute()
            .end()
            .unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[test]
    fn test_first_error_is_kept() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let svc_path = broker.insert_instance("Msvm_Service", []).unwrap();
        let svc = service.get_object(&svc_path).unwrap();

        let mut echo = String::new();
        let mut exec = service.begin_invoke(&svc, "Configure");
        exec.set("Missing", 1u32);
        broker.clear_calls();
        exec.set("Count", 1u32).execute().get("Echo", &mut echo);

        assert!(broker.calls().is_empty());
        let err = exec.end().unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m.contains("Missing")));
    }

    #[test]
    fn test_failed_begin_makes_no_remote_calls() {
        let mut conn = MockConnection::new();
        conn.expect_get_object()
            .times(1)
            .returning(|_| Err(Error::Remote("class lookup failed".into())));
        conn.expect_exec_method().never();
        conn.expect_exec_query().never();
        let service = Service::new(Box::new(conn));

        let mut out = 0u32;
        let err = service
            .begin_path_invoke("Msvm_Service", "Msvm_Service.Name=\"x\"", "Configure")
            .set("Count", 1u32)
            .set("Names", vec!["a".to_string()])
            .execute()
            .get("ReturnValue", &mut out)
            .end()
            .unwrap_err();

        assert!(matches!(err, Error::Remote(ref m) if m == "class lookup failed"));
        assert_eq!(out, 0);
    }

    #[test]
    fn test_uncommitted_target_poisons_begin() {
        let broker = broker();
        let service = Service::connect(&broker, &Default::default()).unwrap();
        let spawned = service.spawn_instance("Msvm_Service").unwrap();
        broker.clear_calls();

        let err = service.begin_invoke(&spawned, "Configure").execute().end().unwrap_err();
        assert!(err.is_not_found());
        assert!(broker
            .calls()
            .iter()
            .all(|c| !matches!(c, crate::wmi::memory::Call::ExecMethod { .. })));
    }
}
