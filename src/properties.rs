//! Local copies of remote property tables.
//!
//! A [`PropertyCache`] holds the last known value of every property of one D-Bus interface on one
//! object. It never talks to the bus itself, see [`crate::mirror`] for that.

use std::collections::HashMap;

use zbus::zvariant::Value;

use crate::{Error, Result};

/// A property value, as reported by the daemon.
///
/// Only the value shapes BlueZ uses for adapter and device properties are represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    I16(i16),
    U16(u16),
    U32(u32),
    Str(String),
    Path(String),
    List(Vec<String>),
}

impl PropertyValue {
    /// Converts a D-Bus variant, unwrapping nested variants.
    ///
    /// Returns [`None`] for value shapes that aren't mirrored (dictionaries, byte arrays, ...).
    pub fn from_value(value: &Value<'_>) -> Option<Self> {
        Some(match value {
            Value::Bool(b) => Self::Bool(*b),
            Value::I16(n) => Self::I16(*n),
            Value::U16(n) => Self::U16(*n),
            Value::U32(n) => Self::U32(*n),
            Value::Str(s) => Self::Str(s.to_string()),
            Value::ObjectPath(p) => Self::Path(p.to_string()),
            Value::Array(array) => {
                let mut list = Vec::new();
                for element in array.get() {
                    match element {
                        Value::Str(s) => list.push(s.to_string()),
                        _ => return None,
                    }
                }
                Self::List(list)
            }
            Value::Value(inner) => return Self::from_value(inner),
            _ => return None,
        })
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i16> for PropertyValue {
    fn from(value: i16) -> Self {
        Self::I16(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        Self::U16(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::U32(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Typed extraction from a [`PropertyValue`].
pub trait FromProperty: Sized {
    fn from_property(value: &PropertyValue) -> Option<Self>;
}

impl FromProperty for bool {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromProperty for i16 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::I16(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromProperty for u16 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::U16(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromProperty for u32 {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::U32(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromProperty for String {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Str(s) | PropertyValue::Path(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromProperty for Vec<String> {
    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::List(list) => Some(list.clone()),
            _ => None,
        }
    }
}

/// Extracts a `T` from `value`, reporting a type mismatch as an error naming `name`.
pub(crate) fn extract<T: FromProperty>(name: &str, value: &PropertyValue) -> Result<T> {
    T::from_property(value).ok_or_else(|| Error::mismatch(name))
}

/// A single modification of a [`PropertyCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The property now has the given value.
    Set { name: String, value: PropertyValue },
    /// The daemon invalidated (or stopped reporting) the property. Its value is no longer known.
    Invalidated { name: String },
}

impl Change {
    pub fn name(&self) -> &str {
        match self {
            Change::Set { name, .. } | Change::Invalidated { name } => name,
        }
    }
}

/// The result of [`PropertyCache::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The property is cached.
    Hit(&'a PropertyValue),
    /// The cache holds the full property table and the property isn't part of it.
    Absent,
    /// The property is not cached and the cache is incomplete, so it has to be fetched.
    Miss,
}

/// Cached property table of one interface on one remote object.
#[derive(Debug, Default, Clone)]
pub struct PropertyCache {
    values: HashMap<String, PropertyValue>,
    complete: bool,
}

impl PropertyCache {
    /// An empty cache. Every lookup will [`Lookup::Miss`] until the table is fetched.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A cache holding a full property table, eg. from `GetManagedObjects`.
    pub fn snapshot<K: Into<String>>(props: impl IntoIterator<Item = (K, PropertyValue)>) -> Self {
        Self {
            values: props.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            complete: true,
        }
    }

    /// Builds a snapshot from raw D-Bus values, skipping the ones that aren't mirrored.
    pub(crate) fn from_values<'r, 'v: 'r, K: AsRef<str>>(
        props: impl IntoIterator<Item = (K, &'r Value<'v>)>,
    ) -> Self {
        Self::snapshot(props.into_iter().filter_map(|(k, v)| {
            PropertyValue::from_value(v).map(|v| (k.as_ref().to_string(), v))
        }))
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn lookup(&self, name: &str) -> Lookup<'_> {
        match self.values.get(name) {
            Some(value) => Lookup::Hit(value),
            None if self.complete => Lookup::Absent,
            None => Lookup::Miss,
        }
    }

    /// Installs a freshly fetched property table and returns how it differs from the old one.
    pub fn replace(&mut self, fresh: HashMap<String, PropertyValue>) -> Vec<Change> {
        let mut changes = Vec::new();
        for (name, value) in &fresh {
            if self.values.get(name) != Some(value) {
                changes.push(Change::Set {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
        for name in self.values.keys() {
            if !fresh.contains_key(name) {
                changes.push(Change::Invalidated { name: name.clone() });
            }
        }

        self.values = fresh;
        self.complete = true;
        changes
    }

    /// Applies one `PropertiesChanged` notification.
    ///
    /// Every reported property is returned as a [`Change`], even if its value didn't actually
    /// differ from the cached one.
    pub fn apply<'n>(
        &mut self,
        changed: impl IntoIterator<Item = (String, PropertyValue)>,
        invalidated: impl IntoIterator<Item = &'n str>,
    ) -> Vec<Change> {
        let mut changes = Vec::new();
        for (name, value) in changed {
            self.values.insert(name.clone(), value.clone());
            changes.push(Change::Set { name, value });
        }
        for name in invalidated {
            self.values.remove(name);
            // The value has to be fetched again next time.
            self.complete = false;
            changes.push(Change::Invalidated {
                name: name.to_string(),
            });
        }
        changes
    }

    /// Records a value the daemon just accepted from us.
    pub fn store(&mut self, name: &str, value: PropertyValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Forgets a property whose new value only the daemon knows. The next read fetches it.
    pub fn evict(&mut self, name: &str) {
        self.values.remove(name);
        self.complete = false;
    }

    /// Records a single property fetched with `Get`. `None` means the daemon has no value for it.
    pub fn store_fetched(&mut self, name: &str, value: Option<PropertyValue>) {
        match value {
            Some(value) => {
                self.values.insert(name.to_string(), value);
            }
            None => {
                self.values.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_snapshot() -> PropertyCache {
        PropertyCache::snapshot([
            ("Address", PropertyValue::from("00:1A:7D:DA:71:13")),
            ("Alias", PropertyValue::from("Headphones")),
            ("Paired", PropertyValue::from(true)),
            ("Trusted", PropertyValue::from(false)),
        ])
    }

    #[test]
    fn empty_cache_misses() {
        let cache = PropertyCache::empty();
        assert!(!cache.is_complete());
        assert_eq!(cache.lookup("Alias"), Lookup::Miss);
    }

    #[test]
    fn snapshot_is_complete() {
        let cache = device_snapshot();
        assert!(cache.is_complete());
        assert_eq!(
            cache.lookup("Paired"),
            Lookup::Hit(&PropertyValue::Bool(true))
        );
        assert_eq!(cache.lookup("RSSI"), Lookup::Absent);
    }

    #[test]
    fn apply_reports_every_property() {
        let mut cache = device_snapshot();
        let changes = cache.apply(
            [
                ("Trusted".to_string(), PropertyValue::from(true)),
                ("Paired".to_string(), PropertyValue::from(true)),
            ],
            [],
        );
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name(), "Trusted");
        assert_eq!(changes[1].name(), "Paired");
        assert_eq!(
            cache.lookup("Trusted"),
            Lookup::Hit(&PropertyValue::Bool(true))
        );
        assert!(cache.is_complete());
    }

    #[test]
    fn invalidation_forces_refetch() {
        let mut cache = device_snapshot();
        let changes = cache.apply([], ["Alias"]);
        assert_eq!(
            changes,
            vec![Change::Invalidated {
                name: "Alias".to_string()
            }]
        );
        assert!(!cache.is_complete());
        assert_eq!(cache.lookup("Alias"), Lookup::Miss);
        // Other values survive.
        assert_eq!(
            cache.lookup("Paired"),
            Lookup::Hit(&PropertyValue::Bool(true))
        );
    }

    #[test]
    fn replace_diffs() {
        let mut cache = device_snapshot();
        let mut fresh = HashMap::new();
        fresh.insert("Address".to_string(), PropertyValue::from("00:1A:7D:DA:71:13"));
        fresh.insert("Alias".to_string(), PropertyValue::from("Kitchen Speaker"));
        fresh.insert("Paired".to_string(), PropertyValue::from(true));
        fresh.insert("RSSI".to_string(), PropertyValue::from(-60i16));

        let mut changes = cache.replace(fresh);
        changes.sort_by(|a, b| a.name().cmp(b.name()));
        assert_eq!(
            changes,
            vec![
                Change::Set {
                    name: "Alias".to_string(),
                    value: PropertyValue::from("Kitchen Speaker"),
                },
                Change::Set {
                    name: "RSSI".to_string(),
                    value: PropertyValue::I16(-60),
                },
                Change::Invalidated {
                    name: "Trusted".to_string()
                },
            ]
        );
        assert!(cache.is_complete());
        assert_eq!(cache.lookup("Trusted"), Lookup::Absent);
    }

    #[test]
    fn replace_completes_empty_cache() {
        let mut cache = PropertyCache::empty();
        let mut fresh = HashMap::new();
        fresh.insert("Powered".to_string(), PropertyValue::from(true));
        assert_eq!(cache.replace(fresh).len(), 1);
        assert_eq!(cache.lookup("Discovering"), Lookup::Absent);
    }

    #[test]
    fn store_fetched() {
        let mut cache = device_snapshot();
        cache.store_fetched("RSSI", Some(PropertyValue::I16(-70)));
        assert_eq!(cache.lookup("RSSI"), Lookup::Hit(&PropertyValue::I16(-70)));
        cache.store_fetched("RSSI", None);
        assert_eq!(cache.lookup("RSSI"), Lookup::Absent);
    }

    #[test]
    fn evict_forces_refetch() {
        let mut cache = device_snapshot();
        cache.evict("Alias");
        assert_eq!(cache.lookup("Alias"), Lookup::Miss);
        assert!(!cache.is_complete());
        assert_eq!(
            cache.lookup("Trusted"),
            Lookup::Hit(&PropertyValue::Bool(false))
        );
    }

    #[test]
    fn convert_values() {
        assert_eq!(
            PropertyValue::from_value(&Value::Bool(true)),
            Some(PropertyValue::Bool(true))
        );
        assert_eq!(
            PropertyValue::from_value(&Value::I16(-42)),
            Some(PropertyValue::I16(-42))
        );
        assert_eq!(
            PropertyValue::from_value(&Value::from("hci0")),
            Some(PropertyValue::Str("hci0".to_string()))
        );
        assert_eq!(
            PropertyValue::from_value(&Value::Value(Box::new(Value::U32(0x240404)))),
            Some(PropertyValue::U32(0x240404))
        );
        assert_eq!(
            PropertyValue::from_value(&Value::from(vec!["0000110b-0000-1000-8000-00805f9b34fb"])),
            Some(PropertyValue::List(vec![
                "0000110b-0000-1000-8000-00805f9b34fb".to_string()
            ]))
        );
        assert_eq!(PropertyValue::from_value(&Value::F64(1.0)), None);
    }

    #[test]
    fn typed_extraction() {
        assert!(extract::<bool>("Paired", &PropertyValue::Bool(true)).unwrap());
        assert_eq!(
            extract::<String>("Adapter", &PropertyValue::Path("/org/bluez/hci0".to_string()))
                .unwrap(),
            "/org/bluez/hci0"
        );
        let err = extract::<bool>("Alias", &PropertyValue::from("x")).unwrap_err();
        assert_eq!(err.to_string(), "property 'Alias' has an unexpected type");
    }
}
