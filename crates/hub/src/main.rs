//! Hub entry point: loads config, connects to the store and the MQTT
//! broker, and wires up the ingest pipeline, retention task and web server.
//!
//! Operational behavior:
//! - MQTT re-subscribe on every reconnect, with jittered exponential backoff
//! - Bounded ingest buffer (drop-new) feeding a single batching persister
//! - SIGTERM/SIGINT → drain the buffer within a grace window, then exit 0
//! - Bad config or unreachable store at startup → exit 1
//! - Periodic retention pruning of old readings

mod analysis;
mod auth;
mod config;
mod db;
mod ingest;
mod metrics;
mod mqtt;
mod reading;
mod state;
mod web;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use auth::{AuthService, StaticUsers};
use db::{PgStore, ReadingStore};
use ingest::Pipeline;
use metrics::{bump, PipelineCounters};
use mqtt::{decode_reading, reconnect_backoff, DropReason};
use state::{ConnectionState, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").ok();
    let cfg = config::load(config_path.as_deref())?;
    info!(config = ?cfg, "configuration loaded");

    // ── Store ───────────────────────────────────────────────────────
    let store = PgStore::connect(&cfg.store.database_url, cfg.store.max_connections)
        .await
        .context("store unreachable at startup")?;
    store.migrate().await.context("store migration failed")?;
    let store: Arc<dyn ReadingStore> = Arc::new(store);
    info!("store ready");

    // ── Shared state ────────────────────────────────────────────────
    let counters = Arc::new(PipelineCounters::new());
    let system = SystemState::new();

    let auth = AuthService::new(&cfg.auth, Box::new(StaticUsers::new(&cfg.auth.users)));
    if cfg.auth.users.is_empty() {
        warn!("no users configured — every login will be refused");
    }

    // ── Ingest pipeline ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pipeline, buffer_rx) = Pipeline::new(cfg.ingest.buffer_capacity, counters.clone());
    let mut persister_handle = ingest::spawn_persister(
        store.clone(),
        buffer_rx,
        cfg.ingest.clone(),
        counters.clone(),
        shutdown_rx,
    );

    // ── Retention pruning ───────────────────────────────────────────
    let mut retention_handle = {
        let prune_store = store.clone();
        let retention = cfg.retention.clone();
        tokio::spawn(async move {
            // Let startup settle before the first prune.
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut ticker =
                tokio::time::interval(Duration::from_secs(retention.prune_interval_s));
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention.days));
                match prune_store.drop_before(cutoff).await {
                    Ok(n) if n > 0 => info!(dropped = n, "pruned old readings"),
                    Ok(_) => {}
                    Err(e) => error!("retention prune failed: {e}"),
                }
            }
        })
    };

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        store: store.clone(),
        auth,
        quality: cfg.ingest.quality.clone(),
        analysis: cfg.analysis.clone(),
        counters: counters.clone(),
        system: system.clone(),
        request_timeout: Duration::from_secs(cfg.http.request_timeout_s),
    };
    let bind = cfg.http.bind.clone();
    let mut web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, &bind).await {
            error!("web server failed: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let (host, port) = cfg.mqtt.host_port()?;
    let mut mqttoptions = MqttOptions::new("telemetry-hub", host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keepalive_s));
    mqttoptions.set_clean_session(cfg.mqtt.clean_session);

    if let (Some(user), Some(pass)) = (cfg.mqtt.username.clone(), cfg.mqtt.password.clone()) {
        mqttoptions.set_credentials(user, pass);
        info!("mqtt: authenticating with broker credentials");
    } else {
        warn!("mqtt credentials not set — connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
    system.set_connection(ConnectionState::Connecting).await;

    // Initial subscriptions (re-issued on every ConnAck).
    subscribe_all(&client, &cfg.mqtt.topics).await;

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Main event loop ─────────────────────────────────────────────
    let exit_reason: &str;
    let mut persister_done = false;
    let mut reconnect_attempt: u32 = 0;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        reconnect_attempt = 0;
                        system.set_connection(ConnectionState::Connected).await;
                        // The broker may have dropped our session even with
                        // a persistent one; always resubscribe.
                        subscribe_all(&client, &cfg.mqtt.topics).await;
                    }

                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        bump(&counters.received);
                        match decode_reading(&p.topic, &p.payload, &cfg.ingest.quality, Utc::now()) {
                            Ok(reading) => {
                                pipeline.submit(reading);
                            }
                            Err(reason) => record_drop(&counters, &p.topic, &reason),
                        }
                    }

                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected by broker");
                        system.set_connection(ConnectionState::Disconnected).await;
                    }

                    Ok(_) => {}

                    Err(e) => {
                        system.set_connection(ConnectionState::Disconnected).await;
                        if !cfg.mqtt.auto_reconnect {
                            error!("mqtt error with auto_reconnect disabled: {e}");
                            exit_reason = "mqtt connection lost";
                            break;
                        }
                        let delay = reconnect_backoff(reconnect_attempt);
                        reconnect_attempt = reconnect_attempt.saturating_add(1);
                        warn!(
                            attempt = reconnect_attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "mqtt error: {e} — reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                        system.set_connection(ConnectionState::Connecting).await;
                    }
                }
            }

            // ── Critical task monitoring ──────────────────────────
            result = &mut persister_handle => {
                error!("CRITICAL: persister task exited unexpectedly: {result:?}");
                persister_done = true;
                exit_reason = "persister task died";
                break;
            }

            result = &mut web_handle => {
                error!("CRITICAL: web server task exited unexpectedly: {result:?}");
                exit_reason = "web server task died";
                break;
            }

            result = &mut retention_handle => {
                error!("CRITICAL: retention task exited unexpectedly: {result:?}");
                exit_reason = "retention task died";
                break;
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown: drain the buffer within the grace window ─
    warn!(reason = exit_reason, "shutting down");
    system.set_connection(ConnectionState::Draining).await;
    let _ = shutdown_tx.send(true);
    drop(pipeline);

    if !persister_done {
        let grace = Duration::from_secs(cfg.ingest.shutdown_grace_s + 1);
        match tokio::time::timeout(grace, &mut persister_handle).await {
            Ok(_) => {}
            Err(_) => {
                warn!("persister did not stop within the grace window — aborting");
                persister_handle.abort();
            }
        }
    }

    let _ = client.disconnect().await;
    system.set_connection(ConnectionState::Disconnected).await;

    let snapshot = counters.snapshot();
    info!(
        persisted = snapshot.persisted,
        shutdown_dropped = snapshot.shutdown_dropped,
        "shutdown complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn subscribe_all(client: &AsyncClient, topics: &[String]) {
    for topic in topics {
        match client.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => info!(topic = %topic, "subscribed"),
            Err(e) => error!(topic = %topic, "subscribe failed: {e}"),
        }
    }
}

/// Count and log a dropped publish.  Malformed payloads are noise and log
/// at debug; the rest indicate misbehaving devices and log at warn.
fn record_drop(counters: &PipelineCounters, topic: &str, reason: &DropReason) {
    match reason {
        DropReason::MalformedPayload(msg) => {
            bump(&counters.malformed_payload);
            debug!(topic, "dropping malformed payload: {msg}");
        }
        DropReason::InvalidReading(err) => {
            bump(&counters.invalid_reading);
            warn!(topic, "dropping invalid reading: {err}");
        }
        DropReason::QualityCheckFailed(msg) => {
            bump(&counters.quality_check_failed);
            warn!(topic, "dropping reading: {msg}");
        }
        DropReason::IdentityMismatch {
            topic_id,
            payload_id,
        } => {
            bump(&counters.identity_mismatch);
            warn!(
                topic,
                topic_id, payload_id, "dropping reading with mismatched identity"
            );
        }
    }
}
