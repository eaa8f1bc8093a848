//! Cached, observable BlueZ adapters and devices.
//!
//! This crate mirrors the state the BlueZ daemon exposes over D-Bus. [`Adapter`]s and
//! [`Device`]s keep a local copy of their properties, fetched lazily on first access, and turn
//! the daemon's `PropertiesChanged` signals into typed events ([`AdapterEvent`],
//! [`DeviceEvent`]). The [`Manager`] tracks adapters as they come and go.
//!
//! All real state lives in the daemon. Cached values may be stale until they are refreshed or a
//! change notification has been received through one of the event streams.

mod adapter;
pub mod address;
pub mod class;
pub mod device;
mod error;
mod manager;
mod mirror;
pub mod properties;
mod proxy;
pub mod uuid;

pub use adapter::{
    Adapter, AdapterEvent, AdapterEvents, AdapterProperty, DeviceSet, DeviceSetChange,
    DeviceStream,
};
pub use error::{Error, Result};
pub use manager::{AdapterRegistry, Manager, ManagerEvent, ManagerEvents, RegistryChange};

use zbus::{fdo::ObjectManagerProxy, names::BusName, Connection, ConnectionBuilder};

/// The bus the daemon is reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Bus {
    /// The system bus. This is where `bluetoothd` lives.
    #[default]
    System,
    /// The session bus of the current user. Mostly useful for mock daemons.
    Session,
    /// An explicit D-Bus address, eg. `unix:path=/run/dbus/test_socket`.
    Address(String),
}

/// Connection settings for a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    bus: Bus,
    service: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bus: Bus::System,
            service: "org.bluez".to_string(),
        }
    }
}

impl SessionConfig {
    /// Selects the bus to connect to.
    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    /// Overrides the well-known name of the daemon (`org.bluez` by default).
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Returns the bus [`Session::with_config`] will connect to.
    pub fn bus_kind(&self) -> &Bus {
        &self.bus
    }

    /// Returns the well-known name the daemon is expected to own.
    pub fn service_name(&self) -> &str {
        &self.service
    }
}

/// A cloneable handle to a D-Bus connection.
///
/// This type is used to construct various objects in this library.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
    service: BusName<'static>,
}

impl Session {
    /// Connects to the system bus, talking to `org.bluez`.
    pub async fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default()).await
    }

    /// Creates a new D-Bus connection according to `config`.
    pub async fn with_config(config: SessionConfig) -> Result<Self> {
        let service = BusName::try_from(config.service_name())
            .map_err(|e| Error::from(zbus::Error::from(e)))?
            .to_owned();

        let builder = match config.bus_kind() {
            Bus::System => ConnectionBuilder::system(),
            Bus::Session => ConnectionBuilder::session(),
            Bus::Address(address) => ConnectionBuilder::address(address.as_str()),
        }
        .map_err(Error::from)?;
        let conn = builder.build().await.map_err(Error::from)?;

        log::debug!(
            "connected to {:?} (guid {}), daemon at {}",
            config.bus,
            conn.server_guid(),
            service
        );
        Ok(Self { conn, service })
    }

    /// Connects to the daemon's D-Bus object manager.
    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        Ok(ObjectManagerProxy::builder(&self.conn)
            .destination(self.service.clone())
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.bus_kind(), &Bus::System);
        assert_eq!(config.service_name(), "org.bluez");
    }

    #[test]
    fn config_builder() {
        let config = SessionConfig::default()
            .bus(Bus::Address("unix:path=/tmp/bus".to_string()))
            .service("org.bluez.mock");
        assert_eq!(
            config.bus_kind(),
            &Bus::Address("unix:path=/tmp/bus".to_string())
        );
        assert_eq!(config.service_name(), "org.bluez.mock");
    }
}
