//! The `list` sub-command

use std::io::Write;

use anyhow::Context;
use log::info;
use powerhouse::Powerhouse;

/// Prints one JSON object per attached device on stdout
pub async fn run() -> anyhow::Result<()> {
    let powerhouse = Powerhouse::new().context("create client")?;
    let devices = powerhouse
        .devices()
        .await
        .context("read list of connected devices")?;

    let mut stdout = std::io::stdout().lock();
    for device in &devices {
        serde_json::to_writer(&mut stdout, device).context("encode device")?;
        writeln!(stdout)?;
    }

    info!("Listed {} device(s)", devices.len());
    Ok(())
}
