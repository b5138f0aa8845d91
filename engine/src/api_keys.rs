// engine/src/api_keys.rs
//!
//! API keys for custom model descriptors.
//!
//! Keys never touch SQLite or the config file. Each descriptor's key lives in
//! the keychain under `api_key_<descriptor id>`; stores only persist the
//! `has_api_key` flag.

use crate::keychain;
use crate::Result;

fn keychain_id(descriptor_id: &str) -> String {
    format!("api_key_{descriptor_id}")
}

/// Store (or replace) the API key for a descriptor.
pub fn store_api_key(descriptor_id: &str, api_key: &str) -> Result<()> {
    keychain::store_secret(&keychain_id(descriptor_id), api_key)?;
    Ok(())
}

pub fn load_api_key(descriptor_id: &str) -> Result<Option<String>> {
    Ok(keychain::load_secret(&keychain_id(descriptor_id))?)
}

/// Check if an API key exists for a descriptor
pub fn has_api_key(descriptor_id: &str) -> bool {
    matches!(load_api_key(descriptor_id), Ok(Some(_)))
}

pub fn delete_api_key(descriptor_id: &str) -> Result<()> {
    keychain::delete_secret(&keychain_id(descriptor_id))?;
    Ok(())
}
