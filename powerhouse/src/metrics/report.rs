//! The measurement pipeline
//!
//! Owns the full chain for one device (lockdown client, session, service
//! channel, diagnostics relay) and periodically turns IORegistry entries
//! into [`Metrics`] records on a bounded channel. The channel gives
//! backpressure: a slow consumer stalls the producer, records are never
//! dropped. Cancelling the token ends the stream at the next suspension
//! point and releases the chain in reverse order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::lockdown::LockdownClient;
use crate::metrics::{BacklightMetrics, BatteryMetrics, Metrics};
use crate::provider::DeviceProvider;
use crate::services::diagnostics_relay::{self, DiagnosticsRelayClient};
use crate::PowerhouseError;

/// IORegistry entry carrying battery telemetry
const BATTERY_ENTRY: &str = "AppleSmartBattery";
/// IORegistry entry carrying backlight telemetry
const BACKLIGHT_ENTRY: &str = "AppleARMBacklight";

/// Tuning knobs of the measurement loop
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Time between samples
    pub interval: Duration,
    /// Bound of the outbound record channel
    pub channel_capacity: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            channel_capacity: 16,
        }
    }
}

/// Builds the measurement chain and starts the sampling task
///
/// The chain is acquired eagerly: pair record, lockdown client, session
/// (with TLS upgrade when the device asks), diagnostics relay on its own
/// service channel. Any failure here is a startup failure and nothing is
/// spawned. The pair record is dropped, and its key material wiped, as
/// soon as the handshakes are done.
pub async fn start<P: DeviceProvider>(
    provider: &P,
    ios_major: u32,
    config: ReportConfig,
    token: CancellationToken,
) -> Result<mpsc::Receiver<Metrics>, PowerhouseError> {
    let pair_record = provider.pair_record().await?;

    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown.query_type().await?;
    lockdown.start_session(&pair_record, ios_major).await?;

    let service = lockdown
        .start_service(diagnostics_relay::SERVICE_NAME)
        .await?;
    let mut channel = provider.connect(service.port).await?;
    if service.ssl {
        channel.enable_tls(&pair_record, ios_major).await?;
    }
    drop(pair_record);

    let relay = DiagnosticsRelayClient::new(channel);

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    tokio::spawn(run(lockdown, relay, config.interval, token, tx));
    Ok(rx)
}

/// The sampling loop
///
/// The first tick fires immediately, so the initial record is emitted
/// without waiting a full interval.
async fn run(
    lockdown: LockdownClient,
    mut relay: DiagnosticsRelayClient,
    interval: Duration,
    token: CancellationToken,
    tx: mpsc::Sender<Metrics>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_update: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sampled = tokio::select! {
            _ = token.cancelled() => break,
            res = sample(&mut relay) => res,
        };

        let record = match sampled {
            Ok((battery, backlight)) => {
                // The device clock has not advanced; the reading would be a
                // duplicate of the previous one.
                if last_update == Some(battery.time) {
                    debug!("Suppressing tick, update time unchanged");
                    continue;
                }
                last_update = Some(battery.time);
                Metrics::sample(battery, backlight)
            }
            Err(e) if e.is_fatal() => {
                warn!("Transport failure, ending the metrics stream: {e}");
                let _ = tx.send(Metrics::from_error(&e)).await;
                break;
            }
            Err(e) => {
                debug!("Sample failed: {e}");
                Metrics::from_error(&e)
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            res = tx.send(record) => {
                if res.is_err() {
                    debug!("Metrics consumer went away");
                    break;
                }
            }
        }
    }

    shutdown(relay, lockdown).await;
}

/// Reads and decodes one battery and one backlight sample, in that order
async fn sample(
    relay: &mut DiagnosticsRelayClient,
) -> Result<(BatteryMetrics, BacklightMetrics), PowerhouseError> {
    let battery = relay
        .ioregistry(Some(BATTERY_ENTRY), None)
        .await?
        .ok_or(PowerhouseError::UnexpectedResponse)?;
    let battery = BatteryMetrics::from_registry(battery)?;

    // Some device generations miss the backlight entry entirely; that reads
    // as all zeros rather than failing every tick.
    let backlight = relay
        .ioregistry(Some(BACKLIGHT_ENTRY), None)
        .await?
        .unwrap_or_default();
    let backlight = BacklightMetrics::from_registry(backlight)?;

    Ok((battery, backlight))
}

/// Releases the chain in reverse acquisition order, best effort
async fn shutdown(mut relay: DiagnosticsRelayClient, mut lockdown: LockdownClient) {
    if let Err(e) = relay.goodbye().await {
        debug!("Goodbye failed: {e}");
    }
    drop(relay);

    if lockdown.session().is_some() {
        if let Err(e) = lockdown.stop_session().await {
            debug!("StopSession failed: {e}");
        }
    }
}
