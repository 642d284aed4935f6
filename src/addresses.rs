//! Address allocation collaborator

use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid address {0}")]
    Invalid(String),

    #[error("Address allocation for {name} failed: {reason}")]
    Unavailable { name: String, reason: String },
}

pub trait AddressAllocator: Send + Sync {
    /// Allocate an address for `name`. `None` means the resource gets an
    /// ephemeral address assigned by the platform.
    fn allocate(&self, name: &str) -> Result<Option<IpAddr>, AddressError>;
}

/// Hands out addresses reserved ahead of time, first one first.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressAllocator {
    reserved: Vec<IpAddr>,
}

impl StaticAddressAllocator {
    pub fn new(reserved: Vec<IpAddr>) -> Self {
        Self { reserved }
    }

    pub fn parse<'a, I>(addresses: I) -> Result<Self, AddressError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let reserved = addresses
            .into_iter()
            .map(|a| a.parse().map_err(|_| AddressError::Invalid(a.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(reserved))
    }
}

impl AddressAllocator for StaticAddressAllocator {
    fn allocate(&self, name: &str) -> Result<Option<IpAddr>, AddressError> {
        let address = self.reserved.first().copied();
        debug!(name, ?address, "allocated address");
        Ok(address)
    }
}
