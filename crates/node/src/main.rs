//! Machine simulator: periodically publishes telemetry readings over MQTT.
//!
//! One simulator instance per configured machine id, all sharing one MQTT
//! connection.  Publishes the hub's canonical camelCase JSON shape to
//! `machine/<id>/data` at QoS 1.

mod sim;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::time::sleep;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadingMsg<'a> {
    machine_id: &'a str,
    /// ISO-8601 without timezone; the hub treats it as UTC.
    timestamp: String,
    temperature: f64,
    vibration: f64,
    pressure: f64,
    humidity: f64,
    power_consumption: f64,
    rotation_speed: f64,
    status: &'static str,
    location: &'a str,
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ───────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let machine_ids: Vec<String> = env::var("MACHINE_IDS")
        .unwrap_or_else(|_| "MACHINE-001".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let location = env::var("MACHINE_LOCATION").unwrap_or_else(|_| "Factory Floor A".to_string());

    let scenario = {
        let s = env::var("SIM_SCENARIO").unwrap_or_else(|_| "steady".to_string());
        sim::Scenario::from_str_lossy(&s)
    };
    tracing::info!(
        %scenario,
        machines = machine_ids.len(),
        sample_every_s,
        "simulation initialised"
    );

    let mut sims: Vec<(String, sim::MachineSim)> = machine_ids
        .iter()
        .map(|id| (id.clone(), sim::MachineSim::new(scenario)))
        .collect();

    // ── MQTT setup ───────────────────────────────────────────────────
    let client_id = format!("telemetry-node-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
        mqttoptions.set_credentials(user, pass);
        tracing::info!("mqtt: authenticating with username/password");
    } else {
        tracing::warn!("MQTT_USER / MQTT_PASS unset — publishing to the broker anonymously");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // ── MQTT event loop task ─────────────────────────────────────────
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("connected to broker");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("mqtt error: {e} — will retry");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Sampling loop ────────────────────────────────────────────────
    loop {
        for (machine_id, machine) in &mut sims {
            let s = machine.sample();
            let msg = ReadingMsg {
                machine_id: machine_id.as_str(),
                timestamp: now_iso(),
                temperature: round2(s.temperature),
                vibration: round3(s.vibration),
                pressure: round2(s.pressure),
                humidity: round2(s.humidity),
                power_consumption: round2(s.power_consumption),
                rotation_speed: round2(s.rotation_speed),
                status: s.status,
                location: &location,
            };
            let topic = format!("machine/{machine_id}/data");
            let payload = serde_json::to_vec(&msg).expect("telemetry json encode failed");

            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                tracing::error!(machine = %machine_id, "publish failed: {e}");
            } else {
                tracing::info!(
                    machine = %machine_id,
                    temperature = msg.temperature,
                    vibration = msg.vibration,
                    status = msg.status,
                    "published reading"
                );
            }
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ===========================================================================
// Tests
// ===========================================================================
