use std::{collections::VecDeque, fmt, future::ready, pin::pin, str::FromStr};

use futures_util::{
    stream::{select, FuturesUnordered},
    FutureExt, StreamExt,
};
use zbus::{
    fdo::{InterfacesAdded, InterfacesRemoved},
    zvariant::ObjectPath,
    CacheProperties, SignalStream,
};

use crate::{
    address::{Address, AddressType},
    class::DeviceClass,
    device::{Device, DeviceEvent, DeviceEvents, PropertyName},
    mirror::{ChangeStream, Mirror},
    properties::{Change, FromProperty, Lookup, PropertyCache, PropertyValue},
    proxy::{Adapter1Proxy, ADAPTER_INTERFACE, DEVICE_INTERFACE},
    uuid::{self, Uuid},
    Error, Result, Session,
};

pub(crate) const PATH_PREFIX: &str = "/org/bluez/";

/// Orders adapter names so that `hci2` comes before `hci10`.
pub(crate) fn name_key(name: &str) -> (usize, &str) {
    (name.len(), name)
}

/// A BlueZ Bluetooth adapter.
///
/// Like [`Device`], an [`Adapter`] caches its properties and fetches them lazily. Clones share
/// the cache.
#[derive(Clone)]
pub struct Adapter {
    session: Session,
    name: String,
    proxy: Adapter1Proxy<'static>,
    mirror: Mirror,
}

impl Adapter {
    pub(crate) async fn new(session: &Session, name: String, cache: PropertyCache) -> Result<Self> {
        let path = ObjectPath::try_from(format!("{}{}", PATH_PREFIX, name))
            .map_err(|e| Error::from(zbus::Error::from(e)))?;
        let proxy = Adapter1Proxy::builder(&session.conn)
            .destination(session.service.clone())
            .map_err(Error::from)?
            .path(path.clone())
            .map_err(Error::from)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)?;
        let mirror = Mirror::new(session, path, ADAPTER_INTERFACE, cache).await?;
        Ok(Self {
            session: session.clone(),
            name,
            proxy,
            mirror,
        })
    }

    /// Opens the adapter at `path` without fetching any of its properties.
    pub(crate) async fn open_path(session: &Session, path: &str) -> Result<Self> {
        let Some(name) = path.strip_prefix(PATH_PREFIX) else {
            return Err(Error::from(format!("unexpected adapter path {}", path)));
        };
        Self::new(session, name.to_string(), PropertyCache::empty()).await
    }

    /// Opens the system's default Bluetooth adapter.
    ///
    /// This is the adapter with the lowest index (`hci0` before `hci1`).
    pub async fn open(session: &Session) -> Result<Self> {
        let adapters = Self::enumerate(session).await?;
        match adapters.min_by(|a, b| name_key(&a.name).cmp(&name_key(&b.name))) {
            Some(a) => Ok(a),
            None => Err(Error::from("no adapter found")),
        }
    }

    /// Returns an iterator yielding all Bluetooth adapters on the system.
    pub async fn enumerate(session: &Session) -> Result<impl Iterator<Item = Self>> {
        log::debug!(
            "enumerating BlueZ adapters on connection {}",
            session.conn.server_guid()
        );

        let manager = session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let mut found = Vec::new();
        for (obj_path, intfs) in &objects {
            let Some(props) = intfs.get(ADAPTER_INTERFACE) else {
                continue;
            };
            if let Some(name) = obj_path.strip_prefix(PATH_PREFIX) {
                log::debug!("found BlueZ adapter at path {}", obj_path);
                let cache = PropertyCache::from_values(props.iter().map(|(k, v)| (k, &**v)));
                found.push((name.to_string(), cache));
            } else {
                log::warn!("skipping adapter with unexpected path {}", obj_path);
            }
        }

        let mut adapters = Vec::new();
        for (name, cache) in found {
            match Adapter::new(session, name.clone(), cache).await {
                Ok(adapter) => adapters.push(adapter),
                Err(e) => log::error!("failed to open adapter {}: {}", name, e),
            }
        }

        Ok(adapters.into_iter())
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Returns the D-Bus object path of this adapter.
    pub fn path(&self) -> ObjectPath<'static> {
        self.mirror.path()
    }

    /// Returns the Bluetooth device [`Address`] of this [`Adapter`].
    pub async fn address(&self) -> Result<Address> {
        let string = self.mirror.require::<String>("Address").await?;
        string.parse().map_err(Error::from)
    }

    /// Returns the type of device [`Address`] used by this [`Adapter`].
    pub async fn address_type(&self) -> Result<AddressType> {
        let string = self.mirror.require::<String>("AddressType").await?;
        AddressType::from_str(&string)
    }

    /// Returns the name remote devices see when discovering this adapter.
    pub async fn name(&self) -> Result<String> {
        self.mirror.require("Alias").await
    }

    /// Changes the name remote devices see. An empty name resets it to [`Adapter::system_name`].
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.proxy.set_alias(name).await.map_err(Error::from)?;
        if name.is_empty() {
            // The daemon picks the new value.
            self.mirror.evict("Alias");
        } else {
            self.mirror.store("Alias", name);
        }
        Ok(())
    }

    /// Returns the system-assigned name (usually the hostname).
    pub async fn system_name(&self) -> Result<String> {
        self.mirror.require("Name").await
    }

    pub async fn class(&self) -> Result<DeviceClass> {
        let raw = self.mirror.require::<u32>("Class").await?;
        Ok(DeviceClass::from_raw(raw))
    }

    pub async fn is_powered(&self) -> Result<bool> {
        self.mirror.require("Powered").await
    }

    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        self.proxy.set_powered(powered).await.map_err(Error::from)?;
        self.mirror.store("Powered", powered);
        Ok(())
    }

    pub async fn is_discoverable(&self) -> Result<bool> {
        self.mirror.require("Discoverable").await
    }

    /// Makes the adapter visible to other devices, or hides it.
    ///
    /// The daemon turns discoverability off again after [`Adapter::discoverable_timeout`].
    pub async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        self.proxy
            .set_discoverable(discoverable)
            .await
            .map_err(Error::from)?;
        self.mirror.store("Discoverable", discoverable);
        Ok(())
    }

    /// Returns the discoverable timeout in seconds. 0 means no timeout.
    pub async fn discoverable_timeout(&self) -> Result<u32> {
        self.mirror.require("DiscoverableTimeout").await
    }

    pub async fn set_discoverable_timeout(&self, seconds: u32) -> Result<()> {
        self.proxy
            .set_discoverable_timeout(seconds)
            .await
            .map_err(Error::from)?;
        self.mirror.store("DiscoverableTimeout", seconds);
        Ok(())
    }

    pub async fn is_pairable(&self) -> Result<bool> {
        self.mirror.require("Pairable").await
    }

    pub async fn set_pairable(&self, pairable: bool) -> Result<()> {
        self.proxy.set_pairable(pairable).await.map_err(Error::from)?;
        self.mirror.store("Pairable", pairable);
        Ok(())
    }

    /// Returns the pairable timeout in seconds. 0 means no timeout.
    pub async fn pairable_timeout(&self) -> Result<u32> {
        self.mirror.require("PairableTimeout").await
    }

    pub async fn set_pairable_timeout(&self, seconds: u32) -> Result<()> {
        self.proxy
            .set_pairable_timeout(seconds)
            .await
            .map_err(Error::from)?;
        self.mirror.store("PairableTimeout", seconds);
        Ok(())
    }

    /// Returns the list of local service [`Uuid`]s. Entries that aren't valid UUIDs are skipped.
    pub async fn service_uuids(&self) -> Result<Vec<Uuid>> {
        let strings = self.mirror.optional::<Vec<String>>("UUIDs").await?;
        Ok(uuid::parse_list(&strings.unwrap_or_default()))
    }

    /// Starts the device discovery procedure.
    pub async fn start_discovery(&self) -> Result<()> {
        self.proxy.start_discovery().await.map_err(Error::from)
    }

    /// Stops the device discovery procedure.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.proxy.stop_discovery().await.map_err(Error::from)
    }

    /// Returns whether this [`Adapter`] is currently performing device discovery.
    ///
    /// Device discovery can be started by calling [`Adapter::start_discovery`]. Note that the value
    /// of [`Adapter::is_discovering`] may not immediately change to reflect that discovery has been
    /// requested.
    pub async fn is_discovering(&self) -> Result<bool> {
        self.mirror.require("Discovering").await
    }

    /// Fetches all properties from the daemon, and returns events for every value that differs
    /// from the cached one.
    pub async fn refresh(&self) -> Result<Vec<AdapterEvent>> {
        let changes = self.mirror.refresh().await?;
        Ok(changes.iter().filter_map(AdapterEvent::from_change).collect())
    }

    /// Makes the daemon forget `device`, including its pairing.
    pub async fn remove_device(&self, device: &Device) -> Result<()> {
        log::debug!("removing {:?} from {}", device, self.name);
        self.proxy
            .remove_device(&device.path())
            .await
            .map_err(Error::from)
    }

    /// Returns all devices the daemon currently knows on this adapter.
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for (path, cache) in self.device_objects().await? {
            match Device::new(self.session.clone(), path.clone(), cache).await {
                Ok(dev) => devices.push(dev),
                Err(e) => log::warn!("skipping device at {}: {}", path, e),
            }
        }
        Ok(devices)
    }

    /// Looks up the device with the given hardware address.
    ///
    /// Returns `Ok(None)` if the daemon doesn't know such a device. Devices only become known
    /// through discovery or pairing.
    pub async fn find_device(&self, address: Address) -> Result<Option<Device>> {
        let expected = format!("{}/{}", self.mirror.path(), address.path_segment());
        for (path, cache) in self.device_objects().await? {
            let matches = path.as_str() == expected
                || match cache.lookup("Address") {
                    Lookup::Hit(PropertyValue::Str(s)) => {
                        s.parse::<Address>().ok() == Some(address)
                    }
                    _ => false,
                };
            if matches {
                return Device::new(self.session.clone(), path, cache).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Lists the device objects below this adapter, with their property tables.
    async fn device_objects(&self) -> Result<Vec<(ObjectPath<'static>, PropertyCache)>> {
        let manager = self.session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let prefix = format!("{}/", self.mirror.path());

        let mut devices = Vec::new();
        for (path, intfs) in objects {
            if !path.starts_with(&prefix) {
                continue;
            }
            if let Some(props) = intfs.get(DEVICE_INTERFACE) {
                let cache = PropertyCache::from_values(props.iter().map(|(k, v)| (k, &**v)));
                devices.push(((*path).to_owned(), cache));
            }
        }
        Ok(devices)
    }

    /// Returns an [`AdapterEvents`] stream yielding changes of this adapter's properties.
    pub async fn events(&self) -> Result<AdapterEvents> {
        Ok(AdapterEvents {
            changes: self.mirror.changes().await?,
            buffer: VecDeque::new(),
        })
    }

    /// Returns a [`DeviceStream`] that will yield all [`Device`]s known to this [`Adapter`].
    ///
    /// This can be used to consume the result of device discovery. Note that paired and connected
    /// devices will also be yielded by the stream, even if those [`Device`]s aren't currently
    /// discoverable.
    pub async fn device_stream(&self) -> Result<DeviceStream> {
        self.device_set().await?.into_device_stream().await
    }

    /// Returns a [`DeviceSet`] containing all devices known to this [`Adapter`].
    ///
    /// If this [`Adapter`] is performing discovery, discovered devices will be added to the
    /// returned [`DeviceSet`] automatically. Otherwise, only "known" devices will be yielded by the
    /// [`DeviceSet`].
    pub async fn device_set(&self) -> Result<DeviceSet> {
        let manager = self.session.object_manager().await?;
        let signals = manager.receive_all_signals().await.map_err(Error::from)?;

        let mut devices = Vec::new();
        let mut changes = Vec::new();
        for (path, cache) in self.device_objects().await? {
            let device = match Device::new(self.session.clone(), path.clone(), cache).await {
                Ok(dev) => dev,
                Err(e) => {
                    log::warn!("skipping device at {}: {}", path, e);
                    continue;
                }
            };

            let change = match device.events().await {
                Ok(change) => change,
                Err(e) => {
                    log::warn!(
                        "failed to listen to property changes for {}: {} (skipping device)",
                        path,
                        e
                    );
                    continue;
                }
            };

            devices.push(device);
            changes.push(change);
        }

        Ok(DeviceSet {
            session: self.session.clone(),
            adapter_prefix: format!("{}/", self.mirror.path()),
            added_removed_stream: signals,
            devices,
            change_streams: changes,
        })
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter").field("name", &self.name).finish()
    }
}

/// A set of [`Device`]s currently visible to an [`Adapter`].
///
/// Returned by [`Adapter::device_set`].
pub struct DeviceSet {
    session: Session,
    adapter_prefix: String,
    added_removed_stream: SignalStream<'static>,
    change_streams: Vec<DeviceEvents>,
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Returns the devices currently in the set.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Returns a [`DeviceStream`] that yields both all currently known [`Device`]s, as well as all
    /// devices discovered in the future.
    ///
    /// Note that [`Device`]s can be yielded multiple times, for example when some of their
    /// properties change.
    pub async fn into_device_stream(self) -> Result<DeviceStream> {
        Ok(DeviceStream {
            to_yield: self.devices.clone(),
            set: self,
        })
    }

    async fn next_modification(&mut self) -> Option<Modification> {
        let added_removed_stream = self
            .added_removed_stream
            .by_ref()
            .filter_map(|message| async {
                if let Some(added) = InterfacesAdded::from_message(message.clone()) {
                    let args = added.args().ok()?;
                    let props = args.interfaces_and_properties.get(DEVICE_INTERFACE)?;
                    if !args.object_path.starts_with(self.adapter_prefix.as_str()) {
                        return None;
                    }

                    let path = args.object_path.to_owned();
                    let cache = PropertyCache::from_values(props.iter());
                    let device = match Device::new(self.session.clone(), path, cache).await {
                        Ok(dev) => dev,
                        Err(e) => {
                            log::warn!("skipping device at {}: {}", args.object_path, e);
                            return None;
                        }
                    };

                    let change = match device.events().await {
                        Ok(change) => change,
                        Err(e) => {
                            log::warn!(
                                "failed to listen to property changes for {}: {} (skipping device)",
                                args.object_path,
                                e
                            );
                            return None;
                        }
                    };

                    Some(Modification::Add(device, change))
                } else if let Some(removed) = InterfacesRemoved::from_message(message) {
                    let args = removed.args().ok()?;
                    if args.object_path.starts_with(self.adapter_prefix.as_str())
                        && args.interfaces.contains(&DEVICE_INTERFACE)
                    {
                        self.devices
                            .iter()
                            .position(|dev| dev.path() == args.object_path)
                            .map(Modification::Remove)
                    } else {
                        None
                    }
                } else {
                    None
                }
            });

        let dev: FuturesUnordered<_> = self
            .change_streams
            .iter_mut()
            .enumerate()
            .map(|(i, change)| {
                change
                    .next()
                    .map(move |event| event.map(|event| Modification::Change(i, event)))
            })
            .collect();
        let mut stream = pin!(select(
            added_removed_stream,
            dev.filter_map(|res| ready(res.ok()))
        ));

        stream.next().await
    }

    /// Asynchronously waits for and applies a change to this [`DeviceSet`].
    ///
    /// Dropping the returned future while a newly announced device is being opened loses that
    /// device: it won't become part of this set. [`Adapter::devices`] still lists it.
    pub async fn change(&mut self) -> Result<DeviceSetChange<'_>> {
        match self.next_modification().await {
            Some(Modification::Add(device, change)) => {
                log::debug!("device added: {:?}", device);
                self.devices.push(device);
                self.change_streams.push(change);
                let added = &self.devices[self.devices.len() - 1];
                Ok(DeviceSetChange::Added(added))
            }
            Some(Modification::Remove(i)) => {
                let device = self.devices.swap_remove(i);
                self.change_streams.swap_remove(i);
                log::debug!("device removed: {:?}", device);
                Ok(DeviceSetChange::Removed(device))
            }
            Some(Modification::Change(i, event)) => {
                Ok(DeviceSetChange::Changed(&self.devices[i], event))
            }
            None => Err(Error::from("event stream ended (adapter disconnected?)")),
        }
    }
}

enum Modification {
    Add(Device, DeviceEvents),
    Remove(usize),
    Change(usize, DeviceEvent),
}

/// Describes a change to a [`DeviceSet`], returned by [`DeviceSet::change`].
#[derive(Debug)]
pub enum DeviceSetChange<'a> {
    /// The given [`Device`] was just added (discovered).
    Added(&'a Device),
    /// The given [`Device`] was removed (calling any methods on it will probably fail).
    Removed(Device),
    /// A property of the [`Device`] was changed (eg. the set of advertised services has been filled
    /// as part of device discovery, or the device was paired).
    Changed(&'a Device, DeviceEvent),
}

/// A stream that yields newly discovered or changed [`Device`]s.
///
/// Returned by [`Adapter::device_stream`].
pub struct DeviceStream {
    to_yield: Vec<Device>,
    set: DeviceSet,
}

impl DeviceStream {
    /// Asynchronously yields the next [`Device`] seen by the [`Adapter`].
    ///
    /// Paired and connected [`Device`]s will be yielded by this stream, and if the [`Adapter`] is
    /// currently performing device discovery, the discovered [`Device`]s will also be yielded by
    /// this stream. Additionally, [`Device`]s can be yielded *multiple times* if their display name
    /// or set of advertised services changes.
    ///
    /// # Errors
    ///
    /// If this method returns an error, the caller should treat this as a permanent condition. It
    /// is likely that the [`Adapter`] has encountered a fatal error and needs to be reenumerated.
    ///
    /// Note that the returned future can take an arbitrary time to resolve (ie. there is no
    /// built-in timeout). The caller should implement its own timeout.
    pub async fn next(&mut self) -> Result<Device> {
        if let Some(device) = self.to_yield.pop() {
            return Ok(device);
        }

        loop {
            let change = self.set.change().await?;
            match change {
                DeviceSetChange::Added(dev) => return Ok(dev.clone()),
                DeviceSetChange::Changed(dev, event)
                    if matches!(
                        event.property(),
                        PropertyName::Alias | PropertyName::ServiceUuids
                    ) =>
                {
                    return Ok(dev.clone());
                }
                DeviceSetChange::Changed(..) | DeviceSetChange::Removed(_) => {}
            }
        }
    }
}

/// A change of an [`Adapter`] property, as announced by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdapterEvent {
    /// [`Adapter::name`] changed.
    Name(String),
    Powered(bool),
    Discoverable(bool),
    DiscoverableTimeout(u32),
    Pairable(bool),
    PairableTimeout(u32),
    Discovering(bool),
    Class(DeviceClass),
    /// The daemon no longer reports a value for the property.
    Invalidated(AdapterProperty),
}

impl AdapterEvent {
    pub fn property(&self) -> AdapterProperty {
        match self {
            Self::Name(_) => AdapterProperty::Name,
            Self::Powered(_) => AdapterProperty::Powered,
            Self::Discoverable(_) => AdapterProperty::Discoverable,
            Self::DiscoverableTimeout(_) => AdapterProperty::DiscoverableTimeout,
            Self::Pairable(_) => AdapterProperty::Pairable,
            Self::PairableTimeout(_) => AdapterProperty::PairableTimeout,
            Self::Discovering(_) => AdapterProperty::Discovering,
            Self::Class(_) => AdapterProperty::Class,
            Self::Invalidated(property) => *property,
        }
    }

    pub(crate) fn from_change(change: &Change) -> Option<Self> {
        let (name, value) = match change {
            Change::Set { name, value } => (name, value),
            Change::Invalidated { name } => {
                return AdapterProperty::from_str(name).map(Self::Invalidated);
            }
        };

        Some(match AdapterProperty::from_str(name)? {
            AdapterProperty::Name => Self::Name(FromProperty::from_property(value)?),
            AdapterProperty::Powered => Self::Powered(FromProperty::from_property(value)?),
            AdapterProperty::Discoverable => {
                Self::Discoverable(FromProperty::from_property(value)?)
            }
            AdapterProperty::DiscoverableTimeout => {
                Self::DiscoverableTimeout(FromProperty::from_property(value)?)
            }
            AdapterProperty::Pairable => Self::Pairable(FromProperty::from_property(value)?),
            AdapterProperty::PairableTimeout => {
                Self::PairableTimeout(FromProperty::from_property(value)?)
            }
            AdapterProperty::Discovering => Self::Discovering(FromProperty::from_property(value)?),
            AdapterProperty::Class => {
                Self::Class(DeviceClass::from_raw(FromProperty::from_property(value)?))
            }
        })
    }
}

/// Identifies a mutable [`Adapter`] property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AdapterProperty {
    Name,
    Powered,
    Discoverable,
    DiscoverableTimeout,
    Pairable,
    PairableTimeout,
    Discovering,
    Class,
}

impl AdapterProperty {
    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "Alias" => Self::Name,
            "Powered" => Self::Powered,
            "Discoverable" => Self::Discoverable,
            "DiscoverableTimeout" => Self::DiscoverableTimeout,
            "Pairable" => Self::Pairable,
            "PairableTimeout" => Self::PairableTimeout,
            "Discovering" => Self::Discovering,
            "Class" => Self::Class,
            _ => return None,
        })
    }
}

/// A stream of [`Adapter`] property changes.
///
/// Returned by [`Adapter::events`].
pub struct AdapterEvents {
    changes: ChangeStream,
    buffer: VecDeque<AdapterEvent>,
}

impl AdapterEvents {
    /// Asynchronously waits until an [`Adapter`] property changes, and returns the change.
    ///
    /// # Errors
    ///
    /// An error means the notification stream is no longer usable, typically because the adapter
    /// was unplugged.
    pub async fn next(&mut self) -> Result<AdapterEvent> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(event);
            }

            let batch = self.changes.next().await?;
            self.buffer
                .extend(batch.iter().filter_map(AdapterEvent::from_change));
        }
    }
}
