// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Message-bus client: command subscription and status publication.
//!
//! Commands arrive on `{prefix}/daemon/{source}` where source is a camera
//! name, `list`, or `daemon`; status snapshots go out on
//! `{prefix}/clients/{source}`. The connection is retried forever with
//! bounded backoff; the pipeline never blocks on the broker.

use std::time::Duration;

use base::signal::{Flag, Receiver};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, MqttConfig};
use crate::json::{Command, CommandKind};
use crate::supervisor::{status_snapshot, Registry};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A status event queued for publication.
pub struct Outgoing {
    pub source: String,
    pub payload: String,
}

fn source_from_topic(topic: &str) -> Option<&str> {
    let s = topic.rsplit('/').next()?;
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Runs the bus task until shutdown. Without an `mqtt` config section, it
/// just drains (and drops) outgoing status events.
pub async fn run(
    daemon: Arc<Config>,
    registry: Registry,
    mut rx: mpsc::Receiver<Outgoing>,
    restart: Flag,
    mut shutdown: Receiver,
) {
    let Some(mqtt) = daemon.mqtt.as_ref() else {
        debug!("no mqtt configured, status events stay local");
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                out = rx.recv() => match out {
                    Some(out) => debug!(source = %out.source, "status (unpublished)"),
                    None => return,
                },
            }
        }
    };

    let mut opts = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    opts.set_keep_alive(mqtt.keepalive);
    if let (Some(login), Some(pwd)) = (&mqtt.login, &mqtt.password) {
        opts.set_credentials(login.clone(), pwd.clone());
    }
    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    let sub_topic = match mqtt.subscribe_topic("+") {
        Ok(t) => t,
        Err(e) => {
            warn!(err = %e.chain(), "bad subscribe topic template, bus disabled");
            return;
        }
    };

    let mut backoff = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            out = rx.recv() => {
                let Some(out) = out else { break };
                publish(&client, mqtt, &out.source, out.payload).await;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(host = %mqtt.host, "connected to broker");
                    backoff = Duration::from_secs(1);
                    if let Err(e) = client.subscribe(sub_topic.clone(), QoS::AtMostOnce).await {
                        warn!(err = %e, "can't subscribe");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handle_publish(&client, mqtt, &registry, &restart, &p.topic, &p.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(err = %e, ?backoff, "broker connection lost, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => break,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
    info!("bus shut down");
}

async fn publish(client: &AsyncClient, mqtt: &MqttConfig, source: &str, payload: String) {
    let topic = match mqtt.publish_topic(source) {
        Ok(t) => t,
        Err(e) => {
            warn!(err = %e.chain(), "bad publish topic template");
            return;
        }
    };
    debug!(%topic, "publishing");
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!(err = %e, "can't publish");
    }
}

async fn handle_publish(
    client: &AsyncClient,
    mqtt: &MqttConfig,
    registry: &Registry,
    restart: &Flag,
    topic: &str,
    payload: &[u8],
) {
    let Some(source) = source_from_topic(topic) else {
        return;
    };
    if source == "list" {
        let names: Vec<&str> = registry.keys().map(String::as_str).collect();
        match serde_json::to_string(&names) {
            Ok(p) => publish(client, mqtt, "list", p).await,
            Err(e) => warn!(err = %e, "can't encode camera list"),
        }
        return;
    }
    if payload.is_empty() {
        return;
    }
    let cmd: Command = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!(%topic, err = %e, "unparseable command");
            return;
        }
    };
    if source == "daemon" {
        match cmd.cmd {
            CommandKind::Restart => {
                info!("restart requested over the bus");
                restart.set();
            }
            other => debug!(?other, "ignoring daemon command"),
        }
        return;
    }
    let Some(cam) = registry.get(source) else {
        debug!(source, "command for unknown camera");
        return;
    };
    match cmd.cmd {
        CommandKind::Start => {
            info!(camera = source, "record start");
            cam.record.set();
        }
        CommandKind::Stop => {
            info!(camera = source, "record stop");
            cam.record.clear();
        }
        CommandKind::Status => {
            let status = status_snapshot(cam, false);
            match serde_json::to_string(&status) {
                Ok(p) => publish(client, mqtt, source, p).await,
                Err(e) => warn!(err = %e, "can't encode status"),
            }
        }
        CommandKind::Restart => {
            warn!(camera = source, "restart is only valid for the daemon");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_source_extraction() {
        assert_eq!(source_from_topic("vigil/daemon/cam0"), Some("cam0"));
        assert_eq!(source_from_topic("vigil/daemon/list"), Some("list"));
        assert_eq!(source_from_topic("vigil/daemon/"), None);
        // Underscored camera names survive.
        assert_eq!(source_from_topic("vigil/daemon/front_door"), Some("front_door"));
    }
}
