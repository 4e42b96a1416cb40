//! Host-to-guest key/value pair exchange

use std::collections::HashMap;

use tracing::{debug, info};

use super::{
    translate, VirtualMachine, KVP_EXCHANGE_COMPONENT, KVP_EXCHANGE_COMPONENT_SETTING_DATA,
    KVP_EXCHANGE_DATA_ITEM, VIRTUAL_SYSTEM_MANAGEMENT_SERVICE,
};
use crate::wmi::Service;
use crate::Result;

/// `Source` of an item written by the host
const KVP_SOURCE_HOST: u16 = 0;

const HINT_EXISTS: &str = "key already exists?";
const HINT_INVALID: &str = "key invalid?";

impl VirtualMachine {
    /// Add a new pair; fails with an illegal-argument error if `key` exists
    pub fn add_key_value_pair(&self, service: &Service, key: &str, value: &str) -> Result<()> {
        kvp_operation(service, &self.path, "AddKvpItems", key, value, HINT_EXISTS)
    }

    /// Change an existing pair
    pub fn modify_key_value_pair(&self, service: &Service, key: &str, value: &str) -> Result<()> {
        kvp_operation(service, &self.path, "ModifyKvpItems", key, value, HINT_INVALID)
    }

    /// Add the pair, or modify it if `key` already exists
    pub fn put_key_value_pair(&self, service: &Service, key: &str, value: &str) -> Result<()> {
        match self.add_key_value_pair(service, key, value) {
            Err(e) if e.is_illegal_argument() => self.modify_key_value_pair(service, key, value),
            other => other,
        }
    }

    pub fn remove_key_value_pair(&self, service: &Service, key: &str) -> Result<()> {
        kvp_operation(service, &self.path, "RemoveKvpItems", key, "", HINT_INVALID)
    }

    /// Pairs the host has pushed to the guest
    pub fn get_key_value_pairs(&self, service: &Service) -> Result<HashMap<String, String>> {
        let component = service.find_first_related_instance(&self.path, KVP_EXCHANGE_COMPONENT)?;
        let settings = service.find_first_related_instance(
            &component.require_path()?,
            KVP_EXCHANGE_COMPONENT_SETTING_DATA,
        )?;
        let items: Vec<String> = settings.get_as("HostExchangeItems")?;
        debug!(vm = %self.element_name, items = items.len(), "read host exchange items");
        parse_kvp_items(&items)
    }
}

/// Collect the `Name` and `Data` of every exchange item. Items without a name
/// are skipped; a missing `Data` reads as empty.
pub fn parse_kvp_items<S: AsRef<str>>(items: &[S]) -> Result<HashMap<String, String>> {
    let mut pairs = HashMap::new();
    for text in items {
        let doc = roxmltree::Document::parse(text.as_ref())?;
        let mut name = None;
        let mut data = String::new();
        for property in doc.descendants().filter(|n| n.has_tag_name("PROPERTY")) {
            let value = property
                .children()
                .find(|n| n.has_tag_name("VALUE"))
                .and_then(|n| n.text())
                .unwrap_or_default();
            match property.attribute("NAME") {
                Some("Name") => name = Some(value.to_string()),
                Some("Data") => data = value.to_string(),
                _ => {}
            }
        }
        if let Some(name) = name {
            pairs.insert(name, data);
        }
    }
    Ok(pairs)
}

/// CIM text of a data item, the form the exchange methods accept
pub fn kvp_item_text(service: &Service, key: &str, value: &str) -> Result<String> {
    let item = service.spawn_instance(KVP_EXCHANGE_DATA_ITEM)?;
    item.put("Name", key)?;
    item.put("Data", value)?;
    item.put("Source", &KVP_SOURCE_HOST)?;
    item.cim_text()
}

fn kvp_operation(
    service: &Service,
    vm_path: &str,
    method: &str,
    key: &str,
    value: &str,
    hint: &str,
) -> Result<()> {
    let vsms = service.get_singleton(VIRTUAL_SYSTEM_MANAGEMENT_SERVICE)?;
    let item = kvp_item_text(service, key, value)?;

    let mut job = None;
    let mut return_value = 0u32;
    service
        .begin_invoke(&vsms, method)
        .set("TargetSystem", vm_path)
        .set("DataItems", vec![item])
        .execute()
        .get("ReturnValue", &mut return_value)
        .get_instance("Job", &mut job)
        .end()?;

    service
        .job_waiter()
        .wait_result(method, return_value, job)
        .map_err(|e| translate(e, hint))?;

    info!(method, key, vm = %vm_path, "kvp operation completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"<INSTANCE CLASSNAME="Msvm_KvpExchangeDataItem"><PROPERTY NAME="Data" TYPE="string"><VALUE>a &amp; b</VALUE></PROPERTY><PROPERTY NAME="Name" TYPE="string"><VALUE>role</VALUE></PROPERTY><PROPERTY NAME="Source" TYPE="uint16"><VALUE>0</VALUE></PROPERTY></INSTANCE>"#;

    #[test]
    fn test_parse_kvp_items() {
        let nameless = r#"<INSTANCE CLASSNAME="Msvm_KvpExchangeDataItem"><PROPERTY NAME="Data" TYPE="string"><VALUE>x</VALUE></PROPERTY></INSTANCE>"#;
        let empty = r#"<INSTANCE><PROPERTY NAME="Name" TYPE="string"><VALUE>blank</VALUE></PROPERTY><PROPERTY NAME="Data" TYPE="string"><VALUE></VALUE></PROPERTY></INSTANCE>"#;

        let pairs = parse_kvp_items(&[ITEM, nameless, empty]).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["role"], "a & b");
        assert_eq!(pairs["blank"], "");
        assert!(parse_kvp_items::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_kvp_items_rejects_bad_xml() {
        let err = parse_kvp_items(&["<INSTANCE><PROPERTY>"]).unwrap_err();
        assert!(matches!(err, crate::Error::Xml(_)));
    }
}
