//! Per-device provisioning records
//!
//! Identity, role and shared secrets are written to storage once at the
//! bench and read back on every boot:
//!
//! | key            | value                                         |
//! |----------------|-----------------------------------------------|
//! | `sys/node`     | `{"unit_id":"r1","role":"remote","base_id":"base"}` |
//! | `key/<unit_id>`| 32 raw secret bytes for that remote           |
//!
//! A remote holds only its own key; a base holds one per remote.

use crate::config::protocol::MAX_UNIT_ID_LEN;
use crate::security::{DeviceSecret, Keyring, KEY_LEN};
use crate::storage::{Storage, StorageError};
use alloc::format;
use alloc::string::String;
use core::fmt;
use serde::{Deserialize, Serialize};

const NODE_KEY: &str = "sys/node";
const SECRET_PREFIX: &str = "key/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionError {
    /// No `sys/node` record
    Unprovisioned,
    /// Record present but unreadable or inconsistent
    Invalid,
    /// No secret for a unit this node must talk to
    MissingSecret,
    Storage(StorageError),
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionError::Unprovisioned => f.write_str("device not provisioned"),
            ProvisionError::Invalid => f.write_str("invalid provisioning record"),
            ProvisionError::MissingSecret => f.write_str("missing device secret"),
            ProvisionError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl From<StorageError> for ProvisionError {
    fn from(e: StorageError) -> Self {
        ProvisionError::Storage(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Remote,
    Base,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub unit_id: String,
    pub role: Role,
    /// Base this remote reports to; ignored on a base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_id: Option<String>,
}

impl NodeConfig {
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, ProvisionError> {
        let bytes = storage.read(NODE_KEY)?.ok_or(ProvisionError::Unprovisioned)?;
        let node: Self = serde_json::from_slice(&bytes).map_err(|_| ProvisionError::Invalid)?;
        node.validate()?;
        Ok(node)
    }

    pub fn store<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<(), ProvisionError> {
        self.validate()?;
        let bytes = serde_json::to_vec(self).map_err(|_| ProvisionError::Invalid)?;
        storage.write(NODE_KEY, &bytes)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        let valid_id = |id: &str| !id.is_empty() && id.len() <= MAX_UNIT_ID_LEN;
        if !valid_id(&self.unit_id) {
            return Err(ProvisionError::Invalid);
        }
        match (self.role, self.base_id.as_deref()) {
            (Role::Remote, Some(base)) if valid_id(base) && base != self.unit_id => Ok(()),
            (Role::Remote, _) => Err(ProvisionError::Invalid),
            (Role::Base, _) => Ok(()),
        }
    }

    /// Keyring for this node: its own secret on a remote, every provisioned
    /// remote's secret on a base
    pub fn keyring<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<Keyring, ProvisionError> {
        let mut keyring = Keyring::new();
        let units = match self.role {
            Role::Remote => alloc::vec![self.unit_id.clone()],
            Role::Base => storage
                .keys(SECRET_PREFIX)?
                .into_iter()
                .map(|k| String::from(&k[SECRET_PREFIX.len()..]))
                .collect(),
        };

        for unit_id in units {
            let bytes = storage
                .read(&format!("{}{}", SECRET_PREFIX, unit_id))?
                .ok_or(ProvisionError::MissingSecret)?;
            if bytes.len() != KEY_LEN {
                return Err(ProvisionError::Invalid);
            }
            let secret = DeviceSecret::from_slice(&bytes).map_err(|_| ProvisionError::Invalid)?;
            keyring.insert(&unit_id, secret);
        }

        if keyring.is_empty() {
            return Err(ProvisionError::MissingSecret);
        }
        Ok(keyring)
    }
}

/// Store the shared secret for `unit_id`
pub fn store_secret<S: Storage + ?Sized>(
    storage: &mut S,
    unit_id: &str,
    secret: &DeviceSecret,
) -> Result<(), StorageError> {
    storage.write(&format!("{}{}", SECRET_PREFIX, unit_id), secret.as_bytes())
}
