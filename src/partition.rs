use std::collections::HashMap;
use std::fmt;

use crate::models::Device;
use crate::registry::is_missing_tenant_id;

/// Partition key. Devices without a usable tenant id are kept apart from
/// every real tenant so they can never borrow another tenant's credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantKey {
    Tenant(String),
    Unconfigured,
}

impl TenantKey {
    pub fn for_device(device: &Device) -> Self {
        if is_missing_tenant_id(&device.tenant_id) {
            TenantKey::Unconfigured
        } else {
            TenantKey::Tenant(device.tenant_id.trim().to_string())
        }
    }

    /// Identifier handed to the registry; empty for the unconfigured bucket.
    pub fn tenant_id(&self) -> &str {
        match self {
            TenantKey::Tenant(id) => id,
            TenantKey::Unconfigured => "",
        }
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantKey::Tenant(id) => f.write_str(id),
            TenantKey::Unconfigured => f.write_str("<unconfigured>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub key: TenantKey,
    pub devices: Vec<Device>,
}

impl Partition {
    pub fn tokens(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.token.clone()).collect()
    }
}

/// Groups devices by owning tenant. Partitions appear in the order their
/// tenant is first seen; devices keep their relative order inside each.
pub fn partition(devices: Vec<Device>) -> Vec<Partition> {
    let mut index: HashMap<TenantKey, usize> = HashMap::new();
    let mut partitions: Vec<Partition> = Vec::new();

    for device in devices {
        let key = TenantKey::for_device(&device);
        match index.get(&key) {
            Some(&i) => partitions[i].devices.push(device),
            None => {
                index.insert(key.clone(), partitions.len());
                partitions.push(Partition {
                    key,
                    devices: vec![device],
                });
            }
        }
    }

    partitions
}
