//! zbus proxies for the BlueZ interfaces this crate mirrors.
//!
//! Only methods and property *setters* are declared here. Property reads go through
//! `org.freedesktop.DBus.Properties` directly so that they can be cached in one place.

use zbus::{dbus_proxy, zvariant::ObjectPath};

pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";

#[dbus_proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Adapter1 {
    async fn start_discovery(&self) -> zbus::Result<()>;
    async fn stop_discovery(&self) -> zbus::Result<()>;
    async fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_alias(&self, value: &str) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_discoverable(&self, value: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_discoverable_timeout(&self, value: u32) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_pairable(&self, value: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_pairable_timeout(&self, value: u32) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.Device1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Device1 {
    async fn connect(&self) -> zbus::Result<()>;
    async fn disconnect(&self) -> zbus::Result<()>;
    async fn connect_profile(&self, uuid: &str) -> zbus::Result<()>;
    async fn disconnect_profile(&self, uuid: &str) -> zbus::Result<()>;
    async fn pair(&self) -> zbus::Result<()>;
    async fn cancel_pairing(&self) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_alias(&self, value: &str) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_trusted(&self, value: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn set_blocked(&self, value: bool) -> zbus::Result<()>;
}
