//! Process-wide device registry.
//!
//! Two instances must never share one backing device, and pool names are
//! unique. Registration is insert-or-error; the returned guard removes
//! the entry when the instance is destroyed.

use fvdo_error::{Result, VdoError};
use parking_lot::Mutex;
use std::sync::OnceLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RegistryEntry {
    pool_name: String,
    device_identity: String,
}

fn registry() -> &'static Mutex<Vec<RegistryEntry>> {
    static REGISTRY: OnceLock<Mutex<Vec<RegistryEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registry membership for one live instance; deregisters on drop.
#[derive(Debug)]
pub struct Registration {
    entry: RegistryEntry,
}

/// Claim `pool_name` and `device_identity`, refusing duplicates of
/// either.
pub fn register(pool_name: &str, device_identity: &str) -> Result<Registration> {
    let mut entries = registry().lock();
    if let Some(existing) = entries
        .iter()
        .find(|entry| entry.device_identity == device_identity)
    {
        return Err(VdoError::BadConfiguration(format!(
            "existing pool {} already uses device {}",
            existing.pool_name, device_identity
        )));
    }
    if entries.iter().any(|entry| entry.pool_name == pool_name) {
        return Err(VdoError::BadConfiguration(format!(
            "pool name {pool_name} is already registered"
        )));
    }

    let entry = RegistryEntry {
        pool_name: pool_name.to_owned(),
        device_identity: device_identity.to_owned(),
    };
    entries.push(entry.clone());
    info!(
        target: "fvdo::registry",
        event = "pool_registered",
        pool = pool_name,
        device = device_identity
    );
    Ok(Registration { entry })
}

/// Whether a pool with this name is currently registered.
#[must_use]
pub fn lookup(pool_name: &str) -> bool {
    registry()
        .lock()
        .iter()
        .any(|entry| entry.pool_name == pool_name)
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = registry().lock();
        entries.retain(|entry| entry != &self.entry);
        info!(
            target: "fvdo::registry",
            event = "pool_deregistered",
            pool = %self.entry.pool_name
        );
    }
}
