//! Starting, stopping and destroying virtual machines

use std::path::Path;

use tracing::info;

use super::{EnabledState, VirtualMachine, SHUTDOWN_COMPONENT, VIRTUAL_SYSTEM_MANAGEMENT_SERVICE};
use crate::variant::CimDateTime;
use crate::wmi::{Instance, Service};
use crate::{Error, Result};

pub const MSG_ALREADY_RUNNING: &str = "machine already running";
pub const MSG_NOT_RUNNING: &str = "machine not running";
pub const MSG_CANNOT_START: &str = "machine not in a state to start";
pub const MSG_INVALID_STATE: &str = "machine in invalid state for action";

/// `RequestedState` asking for the machine to be powered on
const REQUESTED_STATE_ENABLED: u16 = 2;

const SHUTDOWN_REASON: &str = "User requested";

/// Reason text for a non-zero `DestroySystem` return value
pub fn destroy_failure_reason(code: u32) -> &'static str {
    match code {
        1 => "not supported",
        2 => "failed",
        3 => "timeout",
        4 => "invalid parameter",
        5 => "invalid state",
        _ => "unknown",
    }
}

impl VirtualMachine {
    /// Power on a stopped machine and wait for the state change to finish
    pub fn start(&self, service: &Service) -> Result<()> {
        match self.state() {
            EnabledState::Disabled => {}
            EnabledState::Enabled | EnabledState::Starting => {
                return Err(Error::MachineState(MSG_ALREADY_RUNNING))
            }
            _ => return Err(Error::MachineState(MSG_CANNOT_START)),
        }

        let instance = service.get_object(&self.path)?;
        let mut job: Option<Instance> = None;
        let mut return_value = 0u32;
        service
            .begin_invoke(&instance, "RequestStateChange")
            .set("RequestedState", REQUESTED_STATE_ENABLED)
            .set("TimeoutPeriod", CimDateTime::default())
            .execute()
            .get("Job", &mut job)
            .get("ReturnValue", &mut return_value)
            .end()?;

        service
            .job_waiter()
            .wait_result("RequestStateChange", return_value, job)?;
        info!(vm = %self.element_name, "virtual machine started");
        Ok(())
    }

    /// Ask the guest to shut down through its shutdown integration component
    pub fn stop(&self, service: &Service) -> Result<()> {
        if self.state() != EnabledState::Enabled {
            return Err(Error::MachineState(MSG_NOT_RUNNING));
        }

        let shutdown = service.find_first_related_instance(&self.path, SHUTDOWN_COMPONENT)?;
        let mut job: Option<Instance> = None;
        let mut return_value = 0u32;
        service
            .begin_invoke(&shutdown, "InitiateShutdown")
            .set("Reason", SHUTDOWN_REASON)
            .set("Force", false)
            .execute()
            .get("Job", &mut job)
            .get("ReturnValue", &mut return_value)
            .end()?;

        service
            .job_waiter()
            .wait_result("InitiateShutdown", return_value, job)?;
        info!(vm = %self.element_name, "virtual machine stopped");
        Ok(())
    }

    /// Destroy a stopped machine's definition, then delete `disk` if given
    pub fn remove(&self, service: &Service, disk: Option<&Path>) -> Result<()> {
        if self.state() != EnabledState::Disabled {
            return Err(Error::MachineState(MSG_INVALID_STATE));
        }

        let vsms = service.get_singleton(VIRTUAL_SYSTEM_MANAGEMENT_SERVICE)?;
        let mut job: Option<Instance> = None;
        let mut return_value = 0u32;
        service
            .begin_invoke(&vsms, "DestroySystem")
            .set("AffectedSystem", self.path.as_str())
            .execute()
            .get("Job", &mut job)
            .get("ReturnValue", &mut return_value)
            .end()?;

        service
            .job_waiter()
            .wait_result("DestroySystem", return_value, job)
            .map_err(|e| match e {
                Error::MethodFailed { code, .. } => Error::DestroyFailed {
                    name: self.element_name.clone(),
                    reason: destroy_failure_reason(code),
                },
                other => other,
            })?;

        if let Some(disk) = disk {
            std::fs::remove_file(disk)?;
        }
        info!(vm = %self.element_name, "virtual machine removed");
        Ok(())
    }
}
