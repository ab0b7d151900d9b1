//! Device and network context injected into every upload batch.

use serde::{Deserialize, Serialize};

use crate::types::NetworkType;

/// Device facts the collector expects in each batch header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceContext {
    /// Stable per-install device id.
    pub device_id: String,
    /// Advertising id or equivalent, when the platform allows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertising_id: Option<String>,
    /// Mobile carrier name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    /// Connectivity at the time the batch was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkType>,
}

/// Supplies [`DeviceContext`]; identifier acquisition lives in the host.
pub trait DeviceContextProvider: Send + Sync {
    /// Current device context.
    fn context(&self) -> DeviceContext;
}

/// Provider returning a fixed context.
#[derive(Debug, Clone, Default)]
pub struct StaticContext(pub DeviceContext);

impl DeviceContextProvider for StaticContext {
    fn context(&self) -> DeviceContext {
        self.0.clone()
    }
}
