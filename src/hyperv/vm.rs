//! Virtual machine records

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::{escape_wql, COMPUTER_SYSTEM};
use crate::mapper::{FieldTable, WmiRecord};
use crate::variant::CimDateTime;
use crate::wmi::Service;
use crate::{Error, Result};

/// `EnabledState` values of `Msvm_ComputerSystem`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnabledState {
    Unknown,
    Other,
    Enabled,
    Disabled,
    ShuttingDown,
    NotApplicable,
    EnabledButOffline,
    InTest,
    Deferred,
    Quiesce,
    Starting,
}

impl EnabledState {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Other,
            2 => Self::Enabled,
            3 => Self::Disabled,
            4 => Self::ShuttingDown,
            5 => Self::NotApplicable,
            6 => Self::EnabledButOffline,
            7 => Self::InTest,
            8 => Self::Deferred,
            9 => Self::Quiesce,
            10 => Self::Starting,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "Running",
            Self::Disabled => "Off",
            Self::ShuttingDown => "Stopping",
            Self::EnabledButOffline => "Saved",
            Self::Quiesce => "Paused",
            Self::Starting => "Starting",
            Self::Other => "Other",
            Self::NotApplicable | Self::InTest | Self::Deferred | Self::Unknown => "Unknown",
        }
    }
}

/// `Msvm_ComputerSystem`, the subset callers use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(skip)]
    pub path: String,
    pub instance_id: String,
    pub caption: String,
    pub description: String,
    pub element_name: String,
    /// GUID naming the VM
    pub name: String,
    pub install_date: CimDateTime,
    pub operational_status: Vec<u16>,
    pub status_descriptions: Vec<String>,
    pub health_state: u16,
    pub enabled_state: u16,
    pub requested_state: u16,
    pub time_of_last_state_change: CimDateTime,
    pub on_time_in_milliseconds: u64,
    pub process_id: u32,
    pub number_of_numa_nodes: u16,
}

impl WmiRecord for VirtualMachine {
    fn table() -> &'static FieldTable<Self> {
        static TABLE: OnceLock<FieldTable<VirtualMachine>> = OnceLock::new();
        TABLE.get_or_init(|| {
            type Vm = VirtualMachine;
            FieldTable::builder()
                .path(|r: &mut Vm| &mut r.path)
                .property("InstanceID", |r: &Vm| &r.instance_id, |r: &mut Vm| &mut r.instance_id)
                .property("Caption", |r: &Vm| &r.caption, |r: &mut Vm| &mut r.caption)
                .property("Description", |r: &Vm| &r.description, |r: &mut Vm| &mut r.description)
                .property("ElementName", |r: &Vm| &r.element_name, |r: &mut Vm| &mut r.element_name)
                .property("Name", |r: &Vm| &r.name, |r: &mut Vm| &mut r.name)
                .property("InstallDate", |r: &Vm| &r.install_date, |r: &mut Vm| &mut r.install_date)
                .property(
                    "OperationalStatus",
                    |r: &Vm| &r.operational_status,
                    |r: &mut Vm| &mut r.operational_status,
                )
                .property(
                    "StatusDescriptions",
                    |r: &Vm| &r.status_descriptions,
                    |r: &mut Vm| &mut r.status_descriptions,
                )
                .property("HealthState", |r: &Vm| &r.health_state, |r: &mut Vm| &mut r.health_state)
                .property("EnabledState", |r: &Vm| &r.enabled_state, |r: &mut Vm| &mut r.enabled_state)
                .property("RequestedState", |r: &Vm| &r.requested_state, |r: &mut Vm| &mut r.requested_state)
                .property(
                    "TimeOfLastStateChange",
                    |r: &Vm| &r.time_of_last_state_change,
                    |r: &mut Vm| &mut r.time_of_last_state_change,
                )
                .property(
                    "OnTimeInMilliseconds",
                    |r: &Vm| &r.on_time_in_milliseconds,
                    |r: &mut Vm| &mut r.on_time_in_milliseconds,
                )
                .property("ProcessID", |r: &Vm| &r.process_id, |r: &mut Vm| &mut r.process_id)
                .property(
                    "NumberOfNumaNodes",
                    |r: &Vm| &r.number_of_numa_nodes,
                    |r: &mut Vm| &mut r.number_of_numa_nodes,
                )
                .build()
        })
    }
}

const VM_CAPTION: &str = "Virtual Machine";

impl VirtualMachine {
    /// Every virtual machine on the host; the host's own computer system is excluded
    pub fn get_all(service: &Service) -> Result<Vec<Self>> {
        let wql = format!("SELECT * FROM {} WHERE Caption = '{}'", COMPUTER_SYSTEM, VM_CAPTION);
        service.query_records(&wql)
    }

    /// Look up a virtual machine by its display name
    pub fn get_machine(service: &Service, name: &str) -> Result<Self> {
        let wql = format!(
            "SELECT * FROM {} WHERE Caption = '{}' AND ElementName = '{}'",
            COMPUTER_SYSTEM,
            VM_CAPTION,
            escape_wql(name)
        );
        service.find_first_object(&wql).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("could not find virtual machine {:?}", name)),
            other => other,
        })
    }

    pub fn exists(service: &Service, name: &str) -> Result<bool> {
        match Self::get_machine(service, name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> EnabledState {
        EnabledState::from_code(self.enabled_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        let vm = VirtualMachine {
            enabled_state: 2,
            ..Default::default()
        };
        assert_eq!(vm.state(), EnabledState::Enabled);
        assert_eq!(vm.state().as_str(), "Running");
        assert_eq!(EnabledState::from_code(3).as_str(), "Off");
        assert_eq!(EnabledState::from_code(42), EnabledState::Unknown);
    }

    #[test]
    fn test_table_covers_record() {
        let names: Vec<_> = VirtualMachine::table().names().collect();
        assert_eq!(names.len(), 15);
        assert!(names.contains(&"TimeOfLastStateChange"));
    }
}
