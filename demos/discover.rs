use bluemirror::{device::Device, Adapter, Session};

#[pollster::main]
async fn main() -> bluemirror::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let adapter = Adapter::open(&session).await?;
    println!(
        "adapter {} ({}): {} ({:?})",
        adapter.device_name(),
        adapter.name().await?,
        adapter.address().await?,
        adapter.address_type().await?,
    );

    if !adapter.is_powered().await? {
        eprintln!("adapter is powered off, powering on");
        adapter.set_powered(true).await?;
    }

    adapter.start_discovery().await?;
    println!("device discovery started...");

    let mut devices = adapter.device_stream().await?;
    loop {
        let device = devices.next().await?;

        if let Err(e) = print_device(&device).await {
            eprintln!("error querying device: {}", e);
        }

        if !adapter.is_discovering().await? {
            eprintln!("discovery stopped externally, exiting");
            return Ok(());
        }
    }
}

async fn print_device(device: &Device) -> bluemirror::Result<()> {
    println!(
        "saw {} ({:?}): {} [{}]",
        device.address().await?,
        device.address_type().await?,
        device.alias().await?,
        device.display_icon().await?,
    );
    if let Some(rssi) = device.rssi().await? {
        println!("  rssi: {} dBm", rssi);
    }
    println!(
        "  paired: {}, trusted: {}, blocked: {}",
        device.is_paired().await?,
        device.is_trusted().await?,
        device.is_blocked().await?,
    );
    println!("  services: {:?}", device.service_uuids().await?);

    Ok(())
}
