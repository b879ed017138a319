//! Proxy inventory: sources, validation, rotation, providers.
//!
//! The inventory hands out a best-available proxy per request and keeps
//! the pool honest with a perpetual validation loop, transient penalties
//! and a persistent bad set.

pub mod inventory;
pub mod providers;
pub mod sources;
pub mod types;
pub mod validate;

pub use inventory::{InventoryStats, ProxyHealth, ProxyInventory};
pub use providers::{
    GatewayModeProvider, GatewayProviderConfig, ListModeProvider, ListProviderConfig,
    ProviderConfig, ProviderStats, RotatingProvider, ephemeral_record,
};
pub use sources::{ProxySource, parse_payload};
pub use types::{IpType, ProxyProtocol, ProxyRecord, parse_proxy_literal};
pub use validate::Validator;
