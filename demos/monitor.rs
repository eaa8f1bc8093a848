//! Prints adapter hotplug events and property changes of the default adapter's devices.

use std::future::ready;

use bluemirror::{DeviceSetChange, Manager, ManagerEvent, Session};
use futures_util::{
    future::{select, Either},
    pin_mut, FutureExt,
};

#[pollster::main]
async fn main() -> bluemirror::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let manager = Manager::new(&session).await?;
    for adapter in manager.adapters() {
        log::info!("adapter {} at {}", adapter.device_name(), adapter.path());
    }

    let mut manager_events = manager.events().await?;
    loop {
        let Some(adapter) = manager.default_adapter() else {
            log::info!("no adapter present, waiting for one");
            while !matches!(
                manager_events.next().await?,
                ManagerEvent::DefaultAdapterChanged(Some(_))
            ) {}
            continue;
        };

        log::info!("watching {}", adapter.device_name());
        let mut adapter_events = adapter.events().await?;
        let mut devices = adapter.device_set().await?;
        for device in devices.devices() {
            log::info!("known device {}: {}", device.address().await?, device.alias().await?);
        }

        loop {
            let manager_event = manager_events.next().fuse();
            let adapter_event = adapter_events.next().fuse();
            let device_change = devices.change().then(|change| {
                // Resolve the borrowed device into something printable.
                ready(change.map(|change| match change {
                    DeviceSetChange::Added(dev) => format!("added {:?}", dev),
                    DeviceSetChange::Removed(dev) => format!("removed {:?}", dev),
                    DeviceSetChange::Changed(dev, event) => format!("{:?}: {:?}", dev, event),
                }))
            });
            pin_mut!(manager_event, adapter_event, device_change);

            let local = select(adapter_event, device_change);
            match select(manager_event, local).await {
                Either::Left((event, _)) => {
                    let event = event?;
                    log::info!("manager: {:?}", event);
                    if let ManagerEvent::DefaultAdapterChanged(_) = event {
                        break;
                    }
                }
                Either::Right((local, _)) => match local {
                    Either::Left((event, _)) => {
                        log::info!("adapter: {:?}", event?);
                    }
                    Either::Right((change, _)) => {
                        log::info!("device {}", change?);
                    }
                },
            }
        }
    }
}
