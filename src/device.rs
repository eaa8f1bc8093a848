//! BlueZ [`Device`] access.

use core::fmt;
use std::{collections::VecDeque, str::FromStr};

use zbus::{zvariant::ObjectPath, CacheProperties};

use crate::{
    address::{Address, AddressType},
    class::DeviceClass,
    mirror::{ChangeStream, Mirror},
    properties::{Change, FromProperty, PropertyCache},
    proxy::{Device1Proxy, DEVICE_INTERFACE},
    uuid::{self, Uuid},
    Adapter, Error, Result, Session,
};

/// A reference to a remote BlueZ device.
///
/// Properties are cached locally. The first read of a property not yet known fetches the whole
/// property table from the daemon. Cached values are kept up to date while a [`DeviceEvents`]
/// stream of this device (or of any clone of it) is being polled.
///
/// Instances of this type can be obtained from an [`Adapter`], eg. via [`Adapter::devices`] or
/// [`Adapter::device_stream`].
#[derive(Clone)]
pub struct Device {
    session: Session,
    proxy: Device1Proxy<'static>,
    mirror: Mirror,
}

impl Device {
    pub(crate) async fn new(
        session: Session,
        path: ObjectPath<'static>,
        cache: PropertyCache,
    ) -> Result<Self> {
        let proxy = Device1Proxy::builder(&session.conn)
            .destination(session.service.clone())
            .map_err(Error::from)?
            .path(path.clone())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)?;
        let mirror = Mirror::new(&session, path, DEVICE_INTERFACE, cache).await?;
        Ok(Self {
            session,
            proxy,
            mirror,
        })
    }

    /// Opens the device at the given object path without contacting the daemon.
    ///
    /// Properties will be fetched on first access.
    pub async fn open(session: &Session, path: &str) -> Result<Self> {
        let path = ObjectPath::try_from(path)
            .map_err(|e| Error::from(zbus::Error::from(e)))?
            .into_owned();
        Self::new(session.clone(), path, PropertyCache::empty()).await
    }

    /// Returns the D-Bus object path of this device.
    pub fn path(&self) -> ObjectPath<'static> {
        self.mirror.path()
    }

    /// Returns the hardware [`Address`] of the device.
    pub async fn address(&self) -> Result<Address> {
        let string = self.mirror.require::<String>("Address").await?;
        string.parse().map_err(Error::from)
    }

    /// Returns the type of the device's hardware [`Address`] returned by [`Device::address`].
    pub async fn address_type(&self) -> Result<AddressType> {
        let string = self.mirror.require::<String>("AddressType").await?;
        AddressType::from_str(&string)
    }

    /// Returns the name the device reports for itself, if it has reported one yet.
    pub async fn name(&self) -> Result<Option<String>> {
        self.mirror.optional("Name").await
    }

    /// Returns the user-friendly name assigned to the device.
    ///
    /// Unless set via [`Device::set_alias`], this is the remote name, or a placeholder derived
    /// from the address if the remote name is unknown.
    pub async fn alias(&self) -> Result<String> {
        self.mirror.require("Alias").await
    }

    /// Renames the device locally. An empty alias restores the default one.
    pub async fn set_alias(&self, alias: &str) -> Result<()> {
        self.proxy.set_alias(alias).await.map_err(Error::from)?;
        if alias.is_empty() {
            self.mirror.evict("Alias");
        } else {
            self.mirror.store("Alias", alias);
        }
        Ok(())
    }

    /// Returns the icon name the daemon proposes for this device.
    pub async fn icon(&self) -> Result<Option<String>> {
        self.mirror.optional("Icon").await
    }

    /// Returns an icon name for the device, falling back to one derived from its class.
    pub async fn display_icon(&self) -> Result<String> {
        if let Some(icon) = self.icon().await? {
            return Ok(icon);
        }
        Ok(match self.class().await? {
            Some(class) => class.icon_hint().to_string(),
            None => "bluetooth".to_string(),
        })
    }

    /// Returns the Class of Device. LE-only devices don't have one.
    pub async fn class(&self) -> Result<Option<DeviceClass>> {
        let raw = self.mirror.optional::<u32>("Class").await?;
        Ok(raw.map(DeviceClass::from_raw))
    }

    /// Returns the list of service [`Uuid`]s the device is advertising.
    ///
    /// This list is available without performing full service discovery or connecting to the
    /// device, but is typically truncated unless connected to or paired with the [`Device`].
    ///
    /// Entries that aren't valid UUIDs are skipped.
    pub async fn service_uuids(&self) -> Result<Vec<Uuid>> {
        let strings = self.mirror.optional::<Vec<String>>("UUIDs").await?;
        Ok(uuid::parse_list(&strings.unwrap_or_default()))
    }

    pub async fn is_paired(&self) -> Result<bool> {
        self.mirror.require("Paired").await
    }

    /// Returns whether the adapter is currently connected to this device.
    pub async fn is_connected(&self) -> Result<bool> {
        self.mirror.require("Connected").await
    }

    /// Returns whether the device is allowed to connect without user authorization.
    pub async fn is_trusted(&self) -> Result<bool> {
        self.mirror.require("Trusted").await
    }

    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.proxy.set_trusted(trusted).await.map_err(Error::from)?;
        self.mirror.store("Trusted", trusted);
        Ok(())
    }

    /// Returns whether incoming connections from this device are rejected.
    pub async fn is_blocked(&self) -> Result<bool> {
        self.mirror.require("Blocked").await
    }

    /// Blocks or unblocks the device. Blocking a connected device disconnects it.
    pub async fn set_blocked(&self, blocked: bool) -> Result<()> {
        self.proxy.set_blocked(blocked).await.map_err(Error::from)?;
        self.mirror.store("Blocked", blocked);
        Ok(())
    }

    /// Returns whether the device only supports the pre-2.1 PIN code pairing.
    pub async fn has_legacy_pairing(&self) -> Result<bool> {
        self.mirror.require("LegacyPairing").await
    }

    /// Returns the Received Signal Strength Indicator (RSSI) of the remote device.
    ///
    /// Only available while the device is seen during discovery.
    pub async fn rssi(&self) -> Result<Option<i16>> {
        self.mirror.optional("RSSI").await
    }

    /// Returns the [`Adapter`] this device belongs to.
    pub async fn adapter(&self) -> Result<Adapter> {
        let path = self.mirror.require::<String>("Adapter").await?;
        Adapter::open_path(&self.session, &path).await
    }

    /// Fetches all properties from the daemon, and returns events for every value that differs
    /// from the cached one.
    pub async fn refresh(&self) -> Result<Vec<DeviceEvent>> {
        let changes = self.mirror.refresh().await?;
        Ok(changes.iter().filter_map(DeviceEvent::from_change).collect())
    }

    /// Establishes a connection to the device.
    ///
    /// Does nothing if the adapter is already connected to the device.
    pub async fn connect(&self) -> Result<()> {
        // Connecting to a device we're already connected to can result in a cryptic
        // `le-connection-abort-by-local` error, so ensure that this call succeeds if the device is
        // already connected.
        if self.is_connected_now().await? {
            return Ok(());
        }

        match self.proxy.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Connecting is racy, so check if we ended up connecting if it fails.
                if let Ok(true) = self.is_connected_now().await {
                    return Ok(());
                }
                Err(Error::from(e))
            }
        }
    }

    /// Severs the connection to the device.
    ///
    /// Does nothing if the adapter is already disconnected from the device.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected_now().await? {
            return Ok(());
        }

        match self.proxy.disconnect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Ok(false) = self.is_connected_now().await {
                    return Ok(());
                }
                Err(Error::from(e))
            }
        }
    }

    /// Reads the connection state from the daemon instead of the cache.
    async fn is_connected_now(&self) -> Result<bool> {
        self.mirror
            .fetch::<bool>("Connected")
            .await?
            .ok_or_else(|| Error::missing("Connected"))
    }

    /// Connects the profile identified by `uuid`.
    pub async fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        self.proxy
            .connect_profile(&uuid.to_string())
            .await
            .map_err(Error::from)
    }

    /// Disconnects the profile identified by `uuid`.
    pub async fn disconnect_profile(&self, uuid: Uuid) -> Result<()> {
        self.proxy
            .disconnect_profile(&uuid.to_string())
            .await
            .map_err(Error::from)
    }

    /// Pairs with the device.
    ///
    /// The daemon drives the actual pairing procedure and may call back into a registered agent.
    /// This future resolves once pairing succeeded or failed.
    pub async fn pair(&self) -> Result<()> {
        log::debug!("pairing with {}", self.mirror.path());
        self.proxy.pair().await.map_err(Error::from)
    }

    /// Aborts an ongoing [`Device::pair`] call.
    pub async fn cancel_pairing(&self) -> Result<()> {
        self.proxy.cancel_pairing().await.map_err(Error::from)
    }

    /// Returns a [`DeviceEvents`] stream that yields every property change of this device.
    pub async fn events(&self) -> Result<DeviceEvents> {
        let changes = self.mirror.changes().await?;
        Ok(DeviceEvents::new(changes, None))
    }

    /// Returns a [`DeviceEvents`] stream that only yields changes of the given properties.
    ///
    /// The cache is still updated for every property.
    pub async fn events_for<I: IntoIterator<Item = PropertyName>>(
        &self,
        properties: I,
    ) -> Result<DeviceEvents> {
        let interest = properties.into_iter().collect::<Vec<_>>();
        let changes = self.mirror.changes().await?;
        Ok(DeviceEvents::new(changes, Some(interest)))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.mirror.path())
            .finish()
    }
}

/// A stream of [`Device`] property changes.
pub struct DeviceEvents {
    changes: ChangeStream,
    interest: Option<Vec<PropertyName>>,
    buffer: VecDeque<DeviceEvent>,
}

impl DeviceEvents {
    fn new(changes: ChangeStream, interest: Option<Vec<PropertyName>>) -> Self {
        Self {
            changes,
            interest,
            buffer: VecDeque::new(),
        }
    }

    /// Asynchronously waits until a [`Device`] property changes, and returns the change.
    ///
    /// Changes reported by the daemon in a single notification are yielded in the order the
    /// daemon listed them. A property may be reported even if its value didn't change.
    ///
    /// # Errors
    ///
    /// This method returns an error if the underlying notification stream ends, or if there is some
    /// other communication error. In general, the caller should assume that the stream is no longer
    /// operable if that happens.
    pub async fn next(&mut self) -> Result<DeviceEvent> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(event);
            }

            let batch = self.changes.next().await?;
            let interest = &self.interest;
            self.buffer.extend(
                batch
                    .iter()
                    .filter_map(DeviceEvent::from_change)
                    .filter(|event| match interest {
                        Some(props) => props.contains(&event.property()),
                        None => true,
                    }),
            );
        }
    }
}

/// A change of a [`Device`] property, as announced by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceEvent {
    Paired(bool),
    Connected(bool),
    Trusted(bool),
    Blocked(bool),
    Alias(String),
    Name(String),
    Icon(String),
    Class(DeviceClass),
    Rssi(i16),
    ServiceUuids(Vec<Uuid>),
    LegacyPairing(bool),
    /// Service discovery on a connected device has finished (or was reset).
    ServicesResolved(bool),
    /// The daemon no longer reports a value for the property.
    ///
    /// For [`PropertyName::Rssi`], this means the device went out of range of an ongoing
    /// discovery.
    Invalidated(PropertyName),
}

impl DeviceEvent {
    /// Returns the property this event is about.
    pub fn property(&self) -> PropertyName {
        match self {
            Self::Paired(_) => PropertyName::Paired,
            Self::Connected(_) => PropertyName::IsConnected,
            Self::Trusted(_) => PropertyName::Trusted,
            Self::Blocked(_) => PropertyName::Blocked,
            Self::Alias(_) => PropertyName::Alias,
            Self::Name(_) => PropertyName::Name,
            Self::Icon(_) => PropertyName::Icon,
            Self::Class(_) => PropertyName::Class,
            Self::Rssi(_) => PropertyName::Rssi,
            Self::ServiceUuids(_) => PropertyName::ServiceUuids,
            Self::LegacyPairing(_) => PropertyName::LegacyPairing,
            Self::ServicesResolved(_) => PropertyName::ServicesResolved,
            Self::Invalidated(name) => *name,
        }
    }

    pub(crate) fn from_change(change: &Change) -> Option<Self> {
        let (name, value) = match change {
            Change::Set { name, value } => (name, value),
            Change::Invalidated { name } => {
                return PropertyName::from_str(name).map(Self::Invalidated);
            }
        };

        Some(match PropertyName::from_str(name)? {
            PropertyName::Paired => Self::Paired(FromProperty::from_property(value)?),
            PropertyName::IsConnected => Self::Connected(FromProperty::from_property(value)?),
            PropertyName::Trusted => Self::Trusted(FromProperty::from_property(value)?),
            PropertyName::Blocked => Self::Blocked(FromProperty::from_property(value)?),
            PropertyName::Alias => Self::Alias(FromProperty::from_property(value)?),
            PropertyName::Name => Self::Name(FromProperty::from_property(value)?),
            PropertyName::Icon => Self::Icon(FromProperty::from_property(value)?),
            PropertyName::Class => {
                Self::Class(DeviceClass::from_raw(FromProperty::from_property(value)?))
            }
            PropertyName::Rssi => Self::Rssi(FromProperty::from_property(value)?),
            PropertyName::ServiceUuids => {
                let strings: Vec<String> = FromProperty::from_property(value)?;
                Self::ServiceUuids(uuid::parse_list(&strings))
            }
            PropertyName::LegacyPairing => Self::LegacyPairing(FromProperty::from_property(value)?),
            PropertyName::ServicesResolved => {
                Self::ServicesResolved(FromProperty::from_property(value)?)
            }
        })
    }
}

/// Identifies a mutable [`Device`] property by name.
///
/// A property's value can be fetched via the methods on [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PropertyName {
    /// [`Device::is_paired`].
    Paired,
    /// [`Device::is_connected`]. This allows detecting device disconnects.
    IsConnected,
    /// [`Device::is_trusted`].
    Trusted,
    /// [`Device::is_blocked`].
    Blocked,
    /// [`Device::alias`].
    Alias,
    /// [`Device::name`].
    Name,
    /// [`Device::icon`].
    Icon,
    /// [`Device::class`].
    Class,
    /// [`Device::rssi`].
    Rssi,
    /// [`Device::service_uuids`].
    ServiceUuids,
    /// [`Device::has_legacy_pairing`].
    LegacyPairing,
    ServicesResolved,
}

impl PropertyName {
    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "Paired" => Self::Paired,
            "Connected" => Self::IsConnected,
            "Trusted" => Self::Trusted,
            "Blocked" => Self::Blocked,
            "Alias" => Self::Alias,
            "Name" => Self::Name,
            "Icon" => Self::Icon,
            "Class" => Self::Class,
            "RSSI" => Self::Rssi,
            "UUIDs" => Self::ServiceUuids,
            "LegacyPairing" => Self::LegacyPairing,
            "ServicesResolved" => Self::ServicesResolved,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;

    fn set(name: &str, value: impl Into<PropertyValue>) -> Change {
        Change::Set {
            name: name.to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn flags() {
        assert_eq!(
            DeviceEvent::from_change(&set("Paired", true)),
            Some(DeviceEvent::Paired(true))
        );
        assert_eq!(
            DeviceEvent::from_change(&set("Connected", false)),
            Some(DeviceEvent::Connected(false))
        );
        assert_eq!(
            DeviceEvent::from_change(&set("Blocked", true)).map(|e| e.property()),
            Some(PropertyName::Blocked)
        );
    }

    #[test]
    fn values() {
        assert_eq!(
            DeviceEvent::from_change(&set("Alias", "Keyboard")),
            Some(DeviceEvent::Alias("Keyboard".to_string()))
        );
        assert_eq!(
            DeviceEvent::from_change(&set("RSSI", -67i16)),
            Some(DeviceEvent::Rssi(-67))
        );
        assert_eq!(
            DeviceEvent::from_change(&set("Class", 0x240404u32)),
            Some(DeviceEvent::Class(DeviceClass::from_raw(0x240404)))
        );
    }

    #[test]
    fn uuids() {
        let change = Change::Set {
            name: "UUIDs".to_string(),
            value: PropertyValue::List(vec![
                "0000110b-0000-1000-8000-00805f9b34fb".to_string(),
                "garbage".to_string(),
            ]),
        };
        assert_eq!(
            DeviceEvent::from_change(&change),
            Some(DeviceEvent::ServiceUuids(vec![Uuid::from_u16(0x110b)]))
        );
    }

    #[test]
    fn invalidated() {
        let change = Change::Invalidated {
            name: "RSSI".to_string(),
        };
        assert_eq!(
            DeviceEvent::from_change(&change),
            Some(DeviceEvent::Invalidated(PropertyName::Rssi))
        );
    }

    #[test]
    fn ignored() {
        // Immutable and unknown properties don't produce events.
        assert_eq!(DeviceEvent::from_change(&set("Address", "00:11:22:33:44:55")), None);
        assert_eq!(DeviceEvent::from_change(&set("TxPower", 4i16)), None);
        // Neither do values of the wrong type.
        assert_eq!(DeviceEvent::from_change(&set("Paired", "yes")), None);
    }
}
