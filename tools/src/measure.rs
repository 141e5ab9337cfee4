//! The `measure` sub-command

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use log::info;
use powerhouse::metrics::ReportConfig;
use powerhouse::Powerhouse;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Streams metric records as line-delimited JSON on stdout
///
/// Runs until Ctrl-C or, when given, until `duration` elapses; both count
/// as a successful stop. Failure to bring up the measurement pipeline is a
/// startup failure.
pub async fn run(
    config: &Config,
    duration: Option<Duration>,
    interval: Option<Duration>,
    udid: Option<String>,
) -> anyhow::Result<()> {
    let powerhouse = Powerhouse::new().context("create client")?;
    let devices = powerhouse
        .devices()
        .await
        .context("read list of connected devices")?;

    let device = match udid {
        Some(udid) => devices
            .into_iter()
            .find(|d| d.udid == udid)
            .with_context(|| format!("device {udid} is not connected"))?,
        None => devices
            .into_iter()
            .next()
            .context("no device connected")?,
    };
    info!("Measuring device {}", device.udid);

    let report_config = ReportConfig {
        interval: interval.unwrap_or(config.measure.interval),
        ..ReportConfig::default()
    };
    let token = CancellationToken::new();
    let mut stream = device
        .report_metrics(report_config, token.clone())
        .await
        .context("start measurement pipeline")?;

    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            cancel.cancel();
        }
    });

    if let Some(duration) = duration {
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!("Duration elapsed, stopping");
            cancel.cancel();
        });
    }

    let mut stdout = std::io::stdout().lock();
    while let Some(record) = stream.recv().await {
        serde_json::to_writer(&mut stdout, &record).context("encode record")?;
        writeln!(stdout)?;
        stdout.flush()?;
    }

    Ok(())
}
