//! Session with one broker namespace

use tracing::debug;

use super::{Connection, Connector, Enumerator, Instance};
use crate::config::SessionConfig;
use crate::invoke::MethodExecutor;
use crate::job::JobWaiter;
use crate::mapper::WmiRecord;
use crate::{Error, Result};

/// A connected session. Operations are strictly sequential and block until
/// the broker answers. Dropping the service closes the connection.
pub struct Service {
    conn: Box<dyn Connection>,
    config: SessionConfig,
}

impl Service {
    /// Connect using `config`. Any failure is reported as [`Error::Connection`].
    pub fn connect(connector: &dyn Connector, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            namespace = %config.namespace,
            server = config.server.as_deref().unwrap_or("."),
            "connecting"
        );

        let conn = connector
            .connect(
                config.server.as_deref(),
                &config.namespace,
                config.credentials.as_ref(),
            )
            .map_err(|e| match e {
                Error::Connection(_) => e,
                other => Error::Connection(other.to_string()),
            })?;

        Ok(Self {
            conn,
            config: config.clone(),
        })
    }

    /// Wrap an already established connection
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self::with_config(conn, SessionConfig::default())
    }

    pub fn with_config(conn: Box<dyn Connection>, config: SessionConfig) -> Self {
        Self { conn, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn query(&self, wql: &str) -> Result<Enumerator> {
        debug!(wql = %wql, "exec query");
        self.conn.exec_query(wql).map(Enumerator::from_raw)
    }

    pub fn create_instance_enum(&self, class_name: &str) -> Result<Enumerator> {
        debug!(class = %class_name, "enumerate instances");
        self.conn
            .create_instance_enum(class_name)
            .map(Enumerator::from_raw)
    }

    /// Fetch a class definition or instance by path
    pub fn get_object(&self, path: &str) -> Result<Instance> {
        debug!(path = %path, "get object");
        self.conn
            .get_object(path)?
            .map(Instance::from_raw)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// First instance of a class expected to have exactly one, such as a management service
    pub fn get_singleton(&self, class_name: &str) -> Result<Instance> {
        let mut instances = self.create_instance_enum(class_name)?;
        instances
            .next_instance()?
            .ok_or_else(|| Error::NotFound(format!("no instance of {}", class_name)))
    }

    /// Low-level method call. The input parameter object is consumed.
    pub fn exec_method(
        &self,
        path: &str,
        method: &str,
        in_params: Option<Instance>,
    ) -> Result<Option<Instance>> {
        debug!(path = %path, method = %method, "exec method");
        let out = self
            .conn
            .exec_method(path, method, in_params.map(Instance::into_raw))?;
        Ok(out.map(Instance::from_raw))
    }

    /// Resolve `instance` again by its own path to observe remote changes
    pub fn refetch(&self, instance: &Instance) -> Result<Instance> {
        let path = instance.require_path()?;
        self.get_object(&path)
    }

    pub fn find_first_instance(&self, wql: &str) -> Result<Instance> {
        let mut results = self.query(wql)?;
        results
            .next_instance()?
            .ok_or_else(|| Error::NotFound(format!("no results for {}", wql)))
    }

    /// First object of `class_name` associated with the object at `path`
    pub fn find_first_related_instance(&self, path: &str, class_name: &str) -> Result<Instance> {
        let wql = format!("ASSOCIATORS OF {{{}}} WHERE ResultClass = {}", path, class_name);
        self.find_first_instance(&wql)
    }

    pub fn find_first_object<R: WmiRecord>(&self, wql: &str) -> Result<R> {
        let mut results = self.query(wql)?;
        results
            .next_record()?
            .ok_or_else(|| Error::NotFound(format!("no results for {}", wql)))
    }

    pub fn get_object_as<R: WmiRecord>(&self, path: &str) -> Result<R> {
        self.get_object(path)?.get_all()
    }

    pub fn query_records<R: WmiRecord>(&self, wql: &str) -> Result<Vec<R>> {
        let mut results = self.query(wql)?;
        let mut records = Vec::new();
        while let Some(record) = results.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Blank, uncommitted instance of `class_name`
    pub fn spawn_instance(&self, class_name: &str) -> Result<Instance> {
        self.get_object(class_name)?.spawn_instance()
    }

    /// Spawn an instance of `class_name` and populate it from `record`
    pub fn create_instance<R: WmiRecord>(&self, class_name: &str, record: &R) -> Result<Instance> {
        let instance = self.spawn_instance(class_name)?;
        instance.put_all(record)?;
        Ok(instance)
    }

    /// Class definition of `instance`
    pub fn get_class_instance(&self, instance: &Instance) -> Result<Instance> {
        self.get_object(&instance.class_name()?)
    }

    /// Start a method call on `target`
    pub fn begin_invoke(&self, target: &Instance, method: &str) -> MethodExecutor<'_> {
        MethodExecutor::begin(self, target, method)
    }

    /// Start a method call whose signature comes from `class_path`
    pub fn begin_path_invoke(&self, class_path: &str, object_path: &str, method: &str) -> MethodExecutor<'_> {
        MethodExecutor::begin_path(self, class_path, object_path, method)
    }

    /// A job waiter using this session's poll interval and timeout
    pub fn job_waiter(&self) -> JobWaiter<'_> {
        JobWaiter::new(self)
    }

    /// Poll `job` until it finishes; see [`JobWaiter::wait`]
    pub fn wait_job(&self, job: Instance) -> Result<Instance> {
        self.job_waiter().wait(job)
    }

    /// Close the session now
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        debug!(namespace = %self.config.namespace, "closing session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{CimBase, CimType, Variant};
    use crate::wmi::memory::{Call, ClassDef, MemoryBroker};
    use crate::wmi::MockConnection;

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.define_class(
            ClassDef::new("Msvm_VirtualSystemManagementService")
                .property("Name", CimType::scalar(CimBase::String)),
        );
        broker
    }

    #[test]
    fn test_connect_maps_failures() {
        let broker = broker();
        broker.require_credentials(crate::wmi::Credentials {
            user: "admin".into(),
            password: "secret".into(),
        });
        let config = SessionConfig::builder()
            .server("hv01")
            .credentials("admin", "wrong")
            .build();
        let err = Service::connect(&broker, &config).err().unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_singleton_and_not_found() {
        let broker = broker();
        let service = Service::connect(&broker, &SessionConfig::default()).unwrap();

        let err = service.get_singleton("Msvm_VirtualSystemManagementService").unwrap_err();
        assert!(err.is_not_found());

        broker
            .insert_instance(
                "Msvm_VirtualSystemManagementService",
                [("Name", Variant::String("vmms".into()))],
            )
            .unwrap();
        let vsms = service.get_singleton("Msvm_VirtualSystemManagementService").unwrap();
        assert_eq!(vsms.get_as_string("Name").unwrap(), "vmms");

        assert!(service.get_object("Msvm_Gone.InstanceID=\"9\"").unwrap_err().is_not_found());
    }

    #[test]
    fn test_refetch_observes_changes() {
        let broker = broker();
        let service = Service::connect(&broker, &SessionConfig::default()).unwrap();
        let path = broker
            .insert_instance(
                "Msvm_VirtualSystemManagementService",
                [("Name", Variant::String("old".into()))],
            )
            .unwrap();

        let stale = service.get_object(&path).unwrap();
        broker.set_property(&path, "Name", Variant::String("new".into())).unwrap();
        assert_eq!(stale.get_as_string("Name").unwrap(), "old");
        assert_eq!(service.refetch(&stale).unwrap().get_as_string("Name").unwrap(), "new");
    }

    #[test]
    fn test_related_instance_query_shape() {
        let broker = broker();
        let service = Service::connect(&broker, &SessionConfig::default()).unwrap();
        broker.clear_calls();

        let err = service.find_first_related_instance("A.Id=\"1\"", "Msvm_KvpExchangeComponent");
        assert!(err.unwrap_err().is_not_found());
        assert_eq!(
            broker.calls(),
            vec![Call::Query(
                "ASSOCIATORS OF {A.Id=\"1\"} WHERE ResultClass = Msvm_KvpExchangeComponent".into()
            )]
        );
    }

    #[test]
    fn test_remote_errors_propagate() {
        let mut conn = MockConnection::new();
        conn.expect_get_object()
            .returning(|_| Err(Error::Remote("RPC server unavailable".into())));
        let service = Service::new(Box::new(conn));

        let err = service.get_object("Msvm_ComputerSystem").unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }
}
