//! Hyper-V WMI marshaling
//!
//! Drives the Windows management broker from typed Rust code: a variant
//! codec for scalar, array and datetime values, a property bag mapper for
//! record types, owning wrappers around remote objects and cursors, a fluent
//! method-call builder, and a job waiter for asynchronous operations.
//!
//! # Example
//!
//! ```no_run
//! use hyperv_wmi::hyperv::VirtualMachine;
//! use hyperv_wmi::{Service, SessionConfig};
//!
//! # #[cfg(windows)]
//! # fn main() -> hyperv_wmi::Result<()> {
//! let service = Service::connect(&hyperv_wmi::wmi::com::ComConnector, &SessionConfig::default())?;
//! let vm = VirtualMachine::get_machine(&service, "builder")?;
//! vm.put_key_value_pair(&service, "role", "worker")?;
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod config;
pub mod error;
pub mod hyperv;
pub mod invoke;
pub mod job;
pub mod mapper;
pub mod variant;
pub mod wmi;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use invoke::{Argument, MethodExecutor};
pub use job::JobWaiter;
pub use mapper::{FieldTable, WmiRecord};
pub use variant::{CimDateTime, CimType, FromVariant, ToVariant, Variant};
pub use wmi::{Enumerator, Instance, Service};
