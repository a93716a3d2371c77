//! Device Simulator - impersonates irrigation controllers on the MQTT broker
//!
//! Every interval each simulated device publishes a heartbeat and a sensor
//! reading; it reports its status at startup and whenever a pump command
//! arrives. Soil moisture rises while the pump is on and dries out otherwise.
//!
//! Environment variables:
//!   MQTT_BROKER_HOST        - broker host (default localhost)
//!   MQTT_BROKER_PORT        - broker port (default 1883)
//!   SIMULATOR_DEVICE_IDS    - comma-separated external ids (default ESP32_001)
//!   SIMULATOR_INTERVAL_SECS - seconds between readings (default 5)

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use irrigation_backend::bus::messages::CommandPayload;
use irrigation_backend::bus::topics;

struct SimulatedDevice {
    pump_on: bool,
    soil_moisture: f64,
    raining: bool,
}

impl SimulatedDevice {
    fn new() -> Self {
        Self {
            pump_on: false,
            soil_moisture: rand::rng().random_range(35.0..65.0),
            raining: false,
        }
    }

    /// Advance one interval and produce the sensor payload.
    fn step(&mut self) -> serde_json::Value {
        let mut rng = rand::rng();

        if rng.random_bool(0.05) {
            self.raining = !self.raining;
        }

        let drift = if self.pump_on {
            rng.random_range(1.5..3.0)
        } else if self.raining {
            rng.random_range(0.5..1.5)
        } else {
            -rng.random_range(0.1..0.6)
        };
        self.soil_moisture = (self.soil_moisture + drift).clamp(0.0, 100.0);

        let (base_temp, base_humidity) = if self.raining { (25.0, 90.0) } else { (30.0, 72.0) };
        let temperature: f64 = base_temp + rng.random_range(-3.0..3.0);
        let humidity: f64 = base_humidity + rng.random_range(-8.0..8.0);

        json!({
            "temperature": round1(temperature),
            "humidity": round1(humidity.clamp(0.0, 100.0)),
            "soilMoisture": round1(self.soil_moisture),
            "isRain": self.raining,
            "waterLevel": round1(rng.random_range(40.0..95.0)),
        })
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let host = env::var("MQTT_BROKER_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = match env::var("MQTT_BROKER_PORT").map(|p| p.parse()) {
        Ok(Ok(port)) => port,
        Ok(Err(e)) => {
            error!("MQTT_BROKER_PORT is invalid: {}", e);
            std::process::exit(1);
        }
        Err(_) => 1883,
    };
    let interval_secs: u64 = env::var("SIMULATOR_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5);
    let device_ids: Vec<String> = env::var("SIMULATOR_DEVICE_IDS")
        .unwrap_or_else(|_| "ESP32_001".to_string())
        .split(',')
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    if device_ids.is_empty() {
        error!("SIMULATOR_DEVICE_IDS lists no devices");
        std::process::exit(1);
    }

    let client_id = format!("device-simulator-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, &host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(options, 100);
    let mut devices: HashMap<String, SimulatedDevice> = device_ids
        .iter()
        .map(|id| (id.clone(), SimulatedDevice::new()))
        .collect();

    info!(
        "Simulating {} device(s) against {}:{} every {}s: {}",
        devices.len(),
        host,
        port,
        interval_secs,
        device_ids.join(", ")
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (id, device) in devices.iter_mut() {
                    let reading = device.step();
                    publish(&client, &topics::device_heartbeat(id), json!({}));
                    publish(&client, &topics::sensor_data(id), reading);
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker");
                    for id in &device_ids {
                        for topic in [topics::device_command(id), topics::device_config(id), topics::firmware_update(id)] {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!("Failed to subscribe to {}: {}", topic, e);
                            }
                        }
                        report_status(&client, id, "online");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_directive(&client, &mut devices, &publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Broker connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn handle_directive(
    client: &AsyncClient,
    devices: &mut HashMap<String, SimulatedDevice>,
    topic: &str,
    payload: &[u8],
) {
    let Some(id) = topic
        .strip_prefix(topics::TOPIC_PREFIX)
        .and_then(|rest| rest.trim_start_matches('/').split('/').next())
    else {
        return;
    };
    let Some(device) = devices.get_mut(id) else {
        return;
    };

    if topic == topics::device_command(id) {
        match serde_json::from_slice::<CommandPayload>(payload) {
            Ok(command) => match command.pump_state() {
                Some(on) => {
                    device.pump_on = on;
                    info!("{}: pump {}", id, if on { "ON" } else { "OFF" });
                    let status = if on { "pump_on" } else { "pump_off" };
                    report_status(client, id, status);
                }
                None => info!("{}: ignoring action '{}'", id, command.action),
            },
            Err(e) => warn!("{}: unreadable command: {}", id, e),
        }
    } else if topic == topics::device_config(id) {
        info!("{}: config received {}", id, String::from_utf8_lossy(payload));
    } else if topic == topics::firmware_update(id) {
        info!("{}: firmware directive {}", id, String::from_utf8_lossy(payload));
    }
}

fn report_status(client: &AsyncClient, id: &str, status: &str) {
    let payload = json!({ "status": status, "timestamp": Utc::now().timestamp_millis() });
    publish(client, &topics::device_status(id), payload);
}

// try_publish: this task also drives the event loop, so it must not block on
// a full request queue.
fn publish(client: &AsyncClient, topic: &str, payload: serde_json::Value) {
    match client.try_publish(topic, QoS::AtMostOnce, false, payload.to_string()) {
        Ok(()) => debug!("Published to {}", topic),
        Err(e) => error!("Failed to publish to {}: {}", topic, e),
    }
}
