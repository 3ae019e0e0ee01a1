use crate::collectors::EnvReadings;
use crate::config::SensorsConfig;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    Temperature(f64),
    Humidity(f64),
    Power(f64),
}

impl SensorReading {
    pub fn apply(self, readings: &mut EnvReadings) {
        match self {
            Self::Temperature(v) => readings.temperature = v,
            Self::Humidity(v) => readings.humidity = v,
            Self::Power(v) => readings.power = v,
        }
    }
}

/// Maps a broker message to a reading. Payloads are plain decimal numbers; anything else
/// (or an unknown topic) yields `None`.
pub fn parse_reading(cfg: &SensorsConfig, topic: &str, payload: &[u8]) -> Option<SensorReading> {
    let value = std::str::from_utf8(payload)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())?;

    if topic == cfg.temperature_topic {
        Some(SensorReading::Temperature(value))
    } else if topic == cfg.humidity_topic {
        Some(SensorReading::Humidity(value))
    } else if topic == cfg.power_topic {
        Some(SensorReading::Power(value))
    } else {
        None
    }
}

pub async fn run_sensor_listener(
    cfg: SensorsConfig,
    readings: watch::Sender<EnvReadings>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    for topic in [&cfg.temperature_topic, &cfg.humidity_topic, &cfg.power_topic] {
        if let Err(err) = client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
            warn!(topic = %topic, error = %err, "sensor subscribe failed");
            return;
        }
    }
    info!(broker = %cfg.broker_host, port = cfg.broker_port, "sensor listener started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("sensor listener stopping");
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match parse_reading(&cfg, &publish.topic, &publish.payload) {
                            Some(reading) => readings.send_modify(|r| reading.apply(r)),
                            None => debug!(topic = %publish.topic, "ignoring unparsable sensor message"),
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "sensor broker connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_payloads_map_to_their_topic() {
        let cfg = SensorsConfig::default();
        assert_eq!(
            parse_reading(&cfg, "sensor/temp", b"23.5"),
            Some(SensorReading::Temperature(23.5))
        );
        assert_eq!(
            parse_reading(&cfg, "sensor/humidity", b" 41\n"),
            Some(SensorReading::Humidity(41.0))
        );
        assert_eq!(
            parse_reading(&cfg, "sensor/power", b"120.25"),
            Some(SensorReading::Power(120.25))
        );
    }

    #[test]
    fn garbage_and_unknown_topics_are_ignored() {
        let cfg = SensorsConfig::default();
        assert_eq!(parse_reading(&cfg, "sensor/temp", b"hot"), None);
        assert_eq!(parse_reading(&cfg, "sensor/temp", b"NaN"), None);
        assert_eq!(parse_reading(&cfg, "sensor/temp", &[0xff, 0xfe]), None);
        assert_eq!(parse_reading(&cfg, "sensor/co2", b"400"), None);
    }

    #[test]
    fn readings_update_one_field_at_a_time() {
        let mut env = EnvReadings::default();
        SensorReading::Temperature(21.0).apply(&mut env);
        SensorReading::Power(90.0).apply(&mut env);
        assert_eq!(
            env,
            EnvReadings {
                temperature: 21.0,
                humidity: 0.0,
                power: 90.0
            }
        );
    }
}
