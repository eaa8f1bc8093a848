//! Remote property tables with a shared local cache.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::StreamExt;
use zbus::{
    fdo::{PropertiesChangedStream, PropertiesProxy},
    names::InterfaceName,
    zvariant::{ObjectPath, Value},
};

use crate::{
    properties::{extract, Change, FromProperty, Lookup, PropertyCache, PropertyValue},
    Error, Result, Session,
};

/// One interface of one remote object, plus the locally cached copy of its properties.
///
/// Clones share the cache, so a change observed through any clone is visible to all of them.
#[derive(Clone)]
pub(crate) struct Mirror {
    interface: &'static str,
    props: PropertiesProxy<'static>,
    cache: Arc<Mutex<PropertyCache>>,
}

impl Mirror {
    pub(crate) async fn new(
        session: &Session,
        path: ObjectPath<'static>,
        interface: &'static str,
        cache: PropertyCache,
    ) -> Result<Self> {
        let props = PropertiesProxy::builder(&session.conn)
            .destination(session.service.clone())
            .map_err(Error::from)?
            .path(path)
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        Ok(Self {
            interface,
            props,
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    pub(crate) fn path(&self) -> ObjectPath<'static> {
        self.props.path().to_owned()
    }

    fn interface_name(&self) -> InterfaceName<'static> {
        InterfaceName::from_static_str_unchecked(self.interface)
    }

    fn lock(&self) -> MutexGuard<'_, PropertyCache> {
        lock(&self.cache)
    }

    /// Reads a property the daemon always reports.
    pub(crate) async fn require<T: FromProperty>(&self, name: &str) -> Result<T> {
        present(name, self.optional(name).await?)
    }

    /// Reads a property the daemon may omit, fetching the property table on a cache miss.
    pub(crate) async fn optional<T: FromProperty>(&self, name: &str) -> Result<Option<T>> {
        read_through(&self.cache, name, || self.fetch_all()).await
    }

    /// Bypasses the cache and reads a single property from the daemon.
    pub(crate) async fn fetch<T: FromProperty>(&self, name: &str) -> Result<Option<T>> {
        let value = match self.props.get(self.interface_name(), name).await {
            Ok(value) => PropertyValue::from_value(&value),
            Err(zbus::fdo::Error::InvalidArgs(_)) | Err(zbus::fdo::Error::UnknownProperty(_)) => {
                None
            }
            Err(e) => return Err(Error::from(e)),
        };

        let typed = value.as_ref().map(|v| extract(name, v)).transpose()?;
        self.lock().store_fetched(name, value);
        Ok(typed)
    }

    /// Fetches the whole property table and returns what changed since the last known state.
    pub(crate) async fn refresh(&self) -> Result<Vec<Change>> {
        let fresh = self.fetch_all().await?;
        Ok(self.lock().replace(fresh))
    }

    async fn fetch_all(&self) -> Result<HashMap<String, PropertyValue>> {
        log::debug!("fetching {} properties of {}", self.interface, self.props.path());

        let raw = self
            .props
            .get_all(self.interface_name())
            .await
            .map_err(Error::from)?;
        Ok(raw
            .iter()
            .filter_map(|(name, value)| {
                PropertyValue::from_value(value).map(|v| (name.clone(), v))
            })
            .collect())
    }

    /// Records a value after the daemon accepted a write.
    pub(crate) fn store(&self, name: &str, value: impl Into<PropertyValue>) {
        self.lock().store(name, value.into());
    }

    /// Forgets a cached value, so that the next read fetches it from the daemon.
    pub(crate) fn evict(&self, name: &str) {
        self.lock().evict(name);
    }

    /// Subscribes to the `PropertiesChanged` signal of the remote object.
    pub(crate) async fn changes(&self) -> Result<ChangeStream> {
        let stream = self
            .props
            .receive_properties_changed()
            .await
            .map_err(Error::from)?;
        Ok(ChangeStream {
            stream,
            interface: self.interface,
            cache: self.cache.clone(),
        })
    }
}

fn lock(cache: &Mutex<PropertyCache>) -> MutexGuard<'_, PropertyCache> {
    // The cache is plain data, a panic while holding the lock can't leave it inconsistent.
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `None` on a cache miss, `Some(None)` if the property is known to be absent.
fn cached<T: FromProperty>(cache: &Mutex<PropertyCache>, name: &str) -> Result<Option<Option<T>>> {
    match lock(cache).lookup(name) {
        Lookup::Hit(value) => extract(name, value).map(|v| Some(Some(v))),
        Lookup::Absent => Ok(Some(None)),
        Lookup::Miss => Ok(None),
    }
}

/// Reads `name` from the cache, installing the table returned by `fetch_all` on a miss.
async fn read_through<T, F, Fut>(
    cache: &Mutex<PropertyCache>,
    name: &str,
    fetch_all: F,
) -> Result<Option<T>>
where
    T: FromProperty,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HashMap<String, PropertyValue>>>,
{
    if let Some(value) = cached(cache, name)? {
        return Ok(value);
    }

    let fresh = fetch_all().await?;
    lock(cache).replace(fresh);
    Ok(cached(cache, name)?.flatten())
}

fn present<T>(name: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| Error::missing(name))
}

/// Applies one `PropertiesChanged` signal to `cache` if it concerns `interface`.
///
/// Values of unsupported shape are dropped, so the result can be empty even for a matching
/// signal.
fn apply_signal<'a, 'v: 'a>(
    cache: &mut PropertyCache,
    interface: &str,
    signal_interface: &str,
    changed: impl IntoIterator<Item = (&'a str, &'a Value<'v>)>,
    invalidated: impl IntoIterator<Item = &'a str>,
) -> Vec<Change> {
    if signal_interface != interface {
        return Vec::new();
    }

    let changed = changed
        .into_iter()
        .filter_map(|(name, value)| PropertyValue::from_value(value).map(|v| (name.to_string(), v)))
        .collect::<Vec<_>>();
    cache.apply(changed, invalidated)
}

/// Applies property change notifications to a [`Mirror`]'s cache.
pub(crate) struct ChangeStream {
    stream: PropertiesChangedStream<'static>,
    interface: &'static str,
    cache: Arc<Mutex<PropertyCache>>,
}

impl ChangeStream {
    /// Waits for the next notification concerning the mirrored interface, applies it to the cache
    /// and returns the resulting changes.
    pub(crate) async fn next(&mut self) -> Result<Vec<Change>> {
        loop {
            let Some(signal) = self.stream.next().await else {
                return Err(Error::from("property change stream ended"));
            };
            let args = signal.args().map_err(Error::from)?;
            let changes = apply_signal(
                &mut lock(&self.cache),
                self.interface,
                args.interface_name.as_str(),
                args.changed_properties
                    .iter()
                    .map(|(name, value)| (*name, value)),
                args.invalidated_properties.iter().copied(),
            );
            if !changes.is_empty() {
                log::trace!("{:?}: {:?}", signal.path(), changes);
                return Ok(changes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, future::ready};

    use super::*;

    fn adapter_table() -> HashMap<String, PropertyValue> {
        let mut table = HashMap::new();
        table.insert("Alias".to_string(), PropertyValue::from("desk"));
        table.insert("Powered".to_string(), PropertyValue::from(true));
        table
    }

    #[test]
    fn miss_fetches_once() {
        let cache = Mutex::new(PropertyCache::empty());
        let fetches = Cell::new(0);
        let fetch = || {
            fetches.set(fetches.get() + 1);
            ready(Ok(adapter_table()))
        };

        let alias = pollster::block_on(read_through::<String, _, _>(&cache, "Alias", fetch));
        assert_eq!(alias.unwrap(), Some("desk".to_string()));
        assert_eq!(fetches.get(), 1);
        assert!(lock(&cache).is_complete());

        // Now cached, and absent properties are known to be absent.
        let fetch = || {
            fetches.set(fetches.get() + 1);
            ready(Ok(adapter_table()))
        };
        let powered = pollster::block_on(read_through::<bool, _, _>(&cache, "Powered", fetch));
        assert_eq!(powered.unwrap(), Some(true));
        let fetch = || {
            fetches.set(fetches.get() + 1);
            ready(Ok(adapter_table()))
        };
        let class = pollster::block_on(read_through::<u32, _, _>(&cache, "Class", fetch));
        assert_eq!(class.unwrap(), None);
        assert_eq!(fetches.get(), 1);
    }

    #[test]
    fn missing_after_fetch() {
        let cache = Mutex::new(PropertyCache::empty());
        let value = pollster::block_on(read_through::<u32, _, _>(&cache, "Class", || {
            ready(Ok(adapter_table()))
        }))
        .unwrap();
        assert_eq!(value, None);

        let err = present("Class", value).unwrap_err();
        assert!(err.is_missing_property());
        assert_eq!(present("Class", Some(7u32)).unwrap(), 7);
    }

    #[test]
    fn fetch_error_leaves_cache_alone() {
        let cache = Mutex::new(PropertyCache::empty());
        let result = pollster::block_on(read_through::<String, _, _>(&cache, "Alias", || {
            ready(Err(Error::from("bus gone")))
        }));
        assert!(result.is_err());
        assert!(!lock(&cache).is_complete());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let cache = Mutex::new(PropertyCache::snapshot(adapter_table()));
        let result = pollster::block_on(read_through::<bool, _, _>(&cache, "Alias", || {
            ready(Ok(HashMap::new()))
        }));
        assert!(result.is_err());
    }

    #[test]
    fn signal_for_other_interface() {
        let mut cache = PropertyCache::snapshot(adapter_table());
        let powered = Value::from(false);
        let changes = apply_signal(
            &mut cache,
            "org.bluez.Adapter1",
            "org.bluez.Media1",
            [("Powered", &powered)],
            ["Alias"],
        );
        assert!(changes.is_empty());
        assert_eq!(
            cache.lookup("Powered"),
            Lookup::Hit(&PropertyValue::Bool(true))
        );
        assert!(cache.is_complete());
    }

    #[test]
    fn signal_applies_to_cache() {
        let mut cache = PropertyCache::snapshot(adapter_table());
        let powered = Value::from(false);
        let changes = apply_signal(
            &mut cache,
            "org.bluez.Adapter1",
            "org.bluez.Adapter1",
            [("Powered", &powered)],
            ["Alias"],
        );
        assert_eq!(
            changes,
            vec![
                Change::Set {
                    name: "Powered".to_string(),
                    value: PropertyValue::Bool(false),
                },
                Change::Invalidated {
                    name: "Alias".to_string()
                },
            ]
        );
        assert_eq!(cache.lookup("Alias"), Lookup::Miss);
    }

    #[test]
    fn unsupported_values_yield_nothing() {
        let mut cache = PropertyCache::snapshot(adapter_table());
        let flags = Value::U8(3);
        let changes = apply_signal(
            &mut cache,
            "org.bluez.Adapter1",
            "org.bluez.Adapter1",
            [("AdvertisingFlags", &flags)],
            [],
        );
        assert!(changes.is_empty());
        assert_eq!(cache.lookup("AdvertisingFlags"), Lookup::Absent);
    }
}
