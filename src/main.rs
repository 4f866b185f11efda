//! Sentinel simulator
//!
//! Replays a synthetic fall through the full stack (monitor, responder,
//! alarms, SMS) on simulated capabilities and prints what would have been
//! sent. Useful for checking thresholds and message templates without a
//! device.
//!
//! Usage: `sentinel [CONFIG] [--cancel-after SECS]`
//!
//! `RUST_LOG` controls log output; `SENTINEL_*` variables override the config.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sentinel_safety::alarms::{AlarmController, AlarmSettings};
use sentinel_safety::contacts::ContactBook;
use sentinel_safety::dispatch::SmsDispatcher;
use sentinel_safety::history::AlertHistory;
use sentinel_safety::location::LocationResolver;
use sentinel_safety::sim::{
    fall_trace, RecordingActuators, RecordingSmsGateway, ReplaySensorStream,
    ScriptedLocationProvider,
};
use sentinel_safety::store::MemoryStore;
use sentinel_safety::{
    EmergencyContact, EmergencyCoordinator, EmergencyResponder, MotionMonitor, ResponderParts,
    SentinelConfig, SentinelError, SentinelResult, TriggerSource,
};

#[derive(Debug, Parser)]
#[command(name = "sentinel")]
#[command(about = "Replay a synthetic fall through the detection and response stack")]
struct Args {
    /// TOML config layered over the built-in defaults
    config: Option<PathBuf>,

    /// Press cancel this many seconds after the fall
    #[arg(long, value_name = "SECS")]
    cancel_after: Option<u64>,
}

#[tokio::main]
async fn main() -> SentinelResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let store = Arc::new(MemoryStore::new());
    let mut config = SentinelConfig::load_layered(None, args.config.as_deref())?;
    config.apply_store_overrides(store.as_ref());
    log::info!("Sentinel simulator v{}", env!("CARGO_PKG_VERSION"));

    let contacts = ContactBook::new(store.clone());
    contacts.add(EmergencyContact::new("c1", "Alex", "+1 555 010 0001").primary())?;
    contacts.add(EmergencyContact::new("c2", "Jordan", "+1 555 010 0002"))?;

    let response = &config.response;
    let coordinator = Arc::new(EmergencyCoordinator::from_config(response));
    let actuators = Arc::new(RecordingActuators::new());
    let sms = Arc::new(RecordingSmsGateway::new());
    let location = Arc::new(
        ScriptedLocationProvider::fixed(47.6062, -122.3321).with_address("Pike Place, Seattle"),
    );

    let responder = EmergencyResponder::new(ResponderParts {
        config: response.clone(),
        coordinator,
        contacts,
        history: AlertHistory::new(store.clone()),
        location: LocationResolver::new(location, response.location_timeout()),
        alarms: Arc::new(
            AlarmController::new(AlarmSettings::from(response))
                .with_audio(actuators.clone())
                .with_vibration(actuators.clone())
                .with_torch(actuators.clone()),
        ),
        dispatcher: SmsDispatcher::new(sms.clone(), response.sms_timeout()),
    });

    let period = Duration::from_millis(config.detection.sample_period_ms);
    let sensors = Arc::new(
        ReplaySensorStream::new(fall_trace(0, config.detection.sample_period_ms))
            .with_pace(period)
            .held_open(),
    );
    let monitor = MotionMonitor::new(config.detection.clone(), sensors);
    let mut events = responder.subscribe();
    let follower = responder.follow(monitor.subscribe_detections(), TriggerSource::Foreground);
    let handle = monitor.start().await?;

    if let Some(secs) = args.cancel_after {
        let responder = responder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            log::info!("simulated user pressed cancel");
            responder.cancel().await;
        });
    }

    let limit = response.countdown() + response.sms_timeout() + Duration::from_secs(10);
    let outcome = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if event.phase.is_terminal() => return Some(event),
                Ok(event) => log::info!("{} -> {:?}", event.alert_id, event.phase),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .map_err(|_| SentinelError::Timeout("no response outcome".into()))?;

    let summary = handle.stop().await?;
    follower.abort();

    println!("samples processed: {}", summary.samples_processed);
    println!("detections:        {}", summary.detections);
    if let Some(event) = outcome {
        println!("outcome:           {} {:?}", event.alert_id, event.phase);
    }
    println!(
        "alarm activity:    {} siren(s), {} vibration pass(es), {} torch switch(es)",
        actuators.sirens(),
        actuators.vibrations(),
        actuators.torch_switches()
    );
    for batch in sms.batches() {
        println!("SMS to {}:\n  {}", batch.recipients.join(", "), batch.message);
    }
    for alert in responder.history().recent(5) {
        println!("{}", serde_json::to_string_pretty(&alert)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_config_and_cancel_after() {
        let args = Args::try_parse_from(["sentinel", "site.toml", "--cancel-after", "5"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("site.toml")));
        assert_eq!(args.cancel_after, Some(5));

        let args = Args::try_parse_from(["sentinel"]).unwrap();
        assert_eq!(args.config, None);
        assert_eq!(args.cancel_after, None);

        assert!(Args::try_parse_from(["sentinel", "--cancel-after", "soon"]).is_err());
    }
}
