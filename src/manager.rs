//! Tracking of the adapters present on the system.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::StreamExt;
use zbus::{
    fdo::{InterfacesAdded, InterfacesRemoved},
    Message, SignalStream,
};

use crate::{
    adapter::{name_key, PATH_PREFIX},
    properties::PropertyCache,
    proxy::ADAPTER_INTERFACE,
    Adapter, Error, Result, Session,
};

/// A change of the adapter set, computed by [`AdapterRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Added(String),
    Removed(String),
    DefaultChanged(Option<String>),
    AllRemoved,
}

/// Bookkeeping of adapter names and the default adapter.
///
/// The daemon doesn't designate a default adapter, so the registry does: the first adapter to
/// appear becomes the default and stays the default until it is removed. The remaining adapter
/// with the lowest index replaces it then.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    names: Vec<String>,
    default: Option<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the known adapter names, lowest index first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn default_adapter(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn insert(&mut self, name: &str) -> Vec<RegistryChange> {
        if self.contains(name) {
            return Vec::new();
        }

        self.names.push(name.to_string());
        self.names.sort_by(|a, b| name_key(a).cmp(&name_key(b)));

        let mut changes = vec![RegistryChange::Added(name.to_string())];
        if self.default.is_none() {
            self.default = Some(name.to_string());
            changes.push(RegistryChange::DefaultChanged(self.default.clone()));
        }
        changes
    }

    pub fn remove(&mut self, name: &str) -> Vec<RegistryChange> {
        let Some(i) = self.names.iter().position(|n| n == name) else {
            return Vec::new();
        };
        self.names.remove(i);

        let mut changes = vec![RegistryChange::Removed(name.to_string())];
        if self.default.as_deref() == Some(name) {
            self.default = self.names.first().cloned();
            changes.push(RegistryChange::DefaultChanged(self.default.clone()));
        }
        if self.names.is_empty() {
            changes.push(RegistryChange::AllRemoved);
        }
        changes
    }
}

/// Something that happened to the set of adapters.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ManagerEvent {
    /// An adapter has been plugged in (or the daemon started).
    AdapterAdded(Adapter),
    /// The adapter with the given name (eg. `hci0`) is gone.
    AdapterRemoved(String),
    /// The default adapter changed. [`None`] if no adapters are left.
    DefaultAdapterChanged(Option<Adapter>),
    /// The last adapter has been removed.
    AllAdaptersRemoved,
}

#[derive(Clone)]
struct State {
    registry: AdapterRegistry,
    adapters: Vec<Adapter>,
}

impl State {
    fn adapter(&self, name: &str) -> Option<Adapter> {
        self.adapters
            .iter()
            .find(|a| a.device_name() == name)
            .cloned()
    }

    fn add(&mut self, adapter: Adapter) -> Vec<RegistryChange> {
        let name = adapter.device_name().to_string();
        self.adapters.retain(|a| a.device_name() != name);
        self.adapters.push(adapter);
        self.registry.insert(&name)
    }

    fn remove(&mut self, name: &str) -> Vec<RegistryChange> {
        self.adapters.retain(|a| a.device_name() != name);
        self.registry.remove(name)
    }
}

/// The entry point for working with all adapters of the system.
///
/// Cloning a [`Manager`] yields a handle to the same adapter set.
#[derive(Clone)]
pub struct Manager {
    session: Session,
    state: Arc<Mutex<State>>,
}

impl Manager {
    /// Enumerates the adapters currently present.
    pub async fn new(session: &Session) -> Result<Self> {
        let mut state = State {
            registry: AdapterRegistry::new(),
            adapters: Vec::new(),
        };
        let mut adapters = Adapter::enumerate(session).await?.collect::<Vec<_>>();
        adapters.sort_by(|a, b| name_key(a.device_name()).cmp(&name_key(b.device_name())));
        for adapter in adapters {
            state.add(adapter);
        }
        log::debug!(
            "found {} adapter(s), default is {:?}",
            state.adapters.len(),
            state.registry.default_adapter()
        );

        Ok(Self {
            session: session.clone(),
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Returns all adapters, lowest index first.
    pub fn adapters(&self) -> Vec<Adapter> {
        let state = self.lock();
        state
            .registry
            .names()
            .filter_map(|name| state.adapter(name))
            .collect()
    }

    /// Returns the default adapter, or [`None`] if there are no adapters.
    pub fn default_adapter(&self) -> Option<Adapter> {
        let state = self.lock();
        let name = state.registry.default_adapter()?;
        state.adapter(name)
    }

    /// Returns a stream of changes to the adapter set.
    ///
    /// While the stream is polled, [`Manager::adapters`] and [`Manager::default_adapter`] of this
    /// manager and all its clones reflect the changes. Adapters that came or went since the
    /// manager was created are reported first.
    ///
    /// Every stream reports every change, no matter how many streams were created.
    pub async fn events(&self) -> Result<ManagerEvents> {
        let manager = self.session.object_manager().await?;
        let signals = manager.receive_all_signals().await.map_err(Error::from)?;

        let mut events = ManagerEvents {
            session: self.session.clone(),
            shared: self.state.clone(),
            view: self.lock().clone(),
            signals,
            unhandled: None,
            pending: VecDeque::new(),
        };

        // Catch up with anything that happened before we subscribed.
        let present = Adapter::enumerate(&self.session).await?.collect::<Vec<_>>();
        let gone = events
            .view
            .registry
            .names()
            .filter(|name| !present.iter().any(|a| a.device_name() == *name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        for name in gone {
            events.removed(&name);
        }
        for adapter in present {
            if !events.view.registry.contains(adapter.device_name()) {
                events.added(adapter);
            }
        }

        Ok(events)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns registry bookkeeping into events, resolving adapter names with `adapter`.
///
/// Names `adapter` can't resolve are skipped, except for removals.
fn translate(
    changes: Vec<RegistryChange>,
    adapter: impl Fn(&str) -> Option<Adapter>,
) -> Vec<ManagerEvent> {
    changes
        .into_iter()
        .filter_map(|change| {
            Some(match change {
                RegistryChange::Added(name) => ManagerEvent::AdapterAdded(adapter(&name)?),
                RegistryChange::Removed(name) => ManagerEvent::AdapterRemoved(name),
                RegistryChange::DefaultChanged(None) => ManagerEvent::DefaultAdapterChanged(None),
                RegistryChange::DefaultChanged(Some(name)) => {
                    ManagerEvent::DefaultAdapterChanged(Some(adapter(&name)?))
                }
                RegistryChange::AllRemoved => ManagerEvent::AllAdaptersRemoved,
            })
        })
        .collect()
}

/// A stream of [`ManagerEvent`]s, returned by [`Manager::events`].
pub struct ManagerEvents {
    session: Session,
    /// The state seen through the [`Manager`].
    shared: Arc<Mutex<State>>,
    /// The adapter set as last reported by this stream.
    view: State,
    signals: SignalStream<'static>,
    unhandled: Option<Arc<Message>>,
    pending: VecDeque<ManagerEvent>,
}

impl ManagerEvents {
    /// Asynchronously waits for the next change of the adapter set.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection to the bus is lost. The stream can't be used after that.
    pub async fn next(&mut self) -> Result<ManagerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            // Keep the signal around until it has been handled, so that dropping this future
            // halfway through doesn't lose it.
            let message = match self.unhandled.clone() {
                Some(message) => message,
                None => {
                    let Some(message) = self.signals.next().await else {
                        return Err(Error::from("object manager signal stream ended"));
                    };
                    self.unhandled = Some(message.clone());
                    message
                }
            };
            self.handle(message).await;
            self.unhandled = None;
        }
    }

    async fn handle(&mut self, message: Arc<Message>) {
        if let Some(added) = InterfacesAdded::from_message(message.clone()) {
            let Ok(args) = added.args() else { return };
            let Some(props) = args.interfaces_and_properties.get(ADAPTER_INTERFACE) else {
                return;
            };
            let Some(name) = args.object_path.strip_prefix(PATH_PREFIX) else {
                log::warn!("ignoring adapter with unexpected path {}", args.object_path);
                return;
            };

            let cache = PropertyCache::from_values(props.iter());
            match Adapter::new(&self.session, name.to_string(), cache).await {
                Ok(adapter) => {
                    log::debug!("adapter {} added", name);
                    self.added(adapter);
                }
                Err(e) => log::error!("failed to open adapter {}: {}", name, e),
            }
        } else if let Some(removed) = InterfacesRemoved::from_message(message) {
            let Ok(args) = removed.args() else { return };
            if !args.interfaces.contains(&ADAPTER_INTERFACE) {
                return;
            }
            if let Some(name) = args.object_path.strip_prefix(PATH_PREFIX) {
                log::debug!("adapter {} removed", name);
                self.removed(name);
            }
        }
    }

    fn added(&mut self, adapter: Adapter) {
        lock(&self.shared).add(adapter.clone());
        let changes = self.view.add(adapter);
        self.queue(changes);
    }

    fn removed(&mut self, name: &str) {
        lock(&self.shared).remove(name);
        let changes = self.view.remove(name);
        self.queue(changes);
    }

    fn queue(&mut self, changes: Vec<RegistryChange>) {
        let view = &self.view;
        let events = translate(changes, |name| view.adapter(name));
        self.pending.extend(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_adapter_becomes_default() {
        let mut registry = AdapterRegistry::new();
        assert_eq!(registry.default_adapter(), None);

        assert_eq!(
            registry.insert("hci1"),
            vec![
                RegistryChange::Added("hci1".to_string()),
                RegistryChange::DefaultChanged(Some("hci1".to_string())),
            ]
        );
        // A lower index showing up later doesn't take over.
        assert_eq!(
            registry.insert("hci0"),
            vec![RegistryChange::Added("hci0".to_string())]
        );
        assert_eq!(registry.default_adapter(), Some("hci1"));
        assert_eq!(registry.names().collect::<Vec<_>>(), ["hci0", "hci1"]);
    }

    #[test]
    fn duplicate_insert() {
        let mut registry = AdapterRegistry::new();
        registry.insert("hci0");
        assert!(registry.insert("hci0").is_empty());
        assert_eq!(registry.names().count(), 1);
    }

    #[test]
    fn removing_default_promotes_lowest() {
        let mut registry = AdapterRegistry::new();
        registry.insert("hci0");
        registry.insert("hci10");
        registry.insert("hci2");

        assert_eq!(
            registry.remove("hci0"),
            vec![
                RegistryChange::Removed("hci0".to_string()),
                RegistryChange::DefaultChanged(Some("hci2".to_string())),
            ]
        );
        assert_eq!(registry.default_adapter(), Some("hci2"));

        // Removing a non-default adapter leaves the default alone.
        assert_eq!(
            registry.remove("hci10"),
            vec![RegistryChange::Removed("hci10".to_string())]
        );
    }

    #[test]
    fn removing_last_adapter() {
        let mut registry = AdapterRegistry::new();
        registry.insert("hci0");
        assert_eq!(
            registry.remove("hci0"),
            vec![
                RegistryChange::Removed("hci0".to_string()),
                RegistryChange::DefaultChanged(None),
                RegistryChange::AllRemoved,
            ]
        );
        assert!(registry.remove("hci0").is_empty());
        assert_eq!(registry.default_adapter(), None);
    }

    #[test]
    fn every_subscriber_sees_changes() {
        let mut shared = AdapterRegistry::new();
        shared.insert("hci0");

        // Each stream starts from a copy of the shared registry and applies every signal to it.
        let mut first = shared.clone();
        let mut second = shared.clone();
        for view in [&mut first, &mut second] {
            shared.insert("hci1");
            assert_eq!(
                view.insert("hci1"),
                vec![RegistryChange::Added("hci1".to_string())]
            );
        }
        for view in [&mut first, &mut second] {
            shared.remove("hci0");
            assert_eq!(
                view.remove("hci0"),
                vec![
                    RegistryChange::Removed("hci0".to_string()),
                    RegistryChange::DefaultChanged(Some("hci1".to_string())),
                ]
            );
        }
        assert_eq!(shared.default_adapter(), Some("hci1"));
        assert_eq!(first.names().collect::<Vec<_>>(), ["hci1"]);
    }

    #[test]
    fn last_adapter_events() {
        let mut registry = AdapterRegistry::new();
        registry.insert("hci0");
        let events = translate(registry.remove("hci0"), |_| None);
        assert!(matches!(
            events.as_slice(),
            [
                ManagerEvent::AdapterRemoved(name),
                ManagerEvent::DefaultAdapterChanged(None),
                ManagerEvent::AllAdaptersRemoved,
            ] if name == "hci0"
        ));
    }

    #[test]
    fn unresolved_adapters_are_skipped() {
        let changes = vec![
            RegistryChange::Added("hci3".to_string()),
            RegistryChange::DefaultChanged(Some("hci3".to_string())),
            RegistryChange::Removed("hci1".to_string()),
        ];
        let events = translate(changes, |_| None);
        assert!(matches!(
            events.as_slice(),
            [ManagerEvent::AdapterRemoved(name)] if name == "hci1"
        ));
    }
}
