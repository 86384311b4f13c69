use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s0pcm_mqtt::config::Config;
use s0pcm_mqtt::publish::{PublishCmd, Publisher};
use s0pcm_mqtt::store::MeasurementStore;
use s0pcm_mqtt::{discovery, mqtt, pipeline, publish, serial};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        config = %cfg_path,
        channels = cfg.channels.len(),
        "starting s0pcm-mqtt {VERSION}"
    );

    let (queue, publish_rx) = publish::queue(cfg.publication.queue_depth);

    let status_topic = format!("{}/status", cfg.mqtt.topic_prefix);
    let opts = mqtt::build_options(&cfg.mqtt, &status_topic);
    let (client, mut eventloop) = mqtt::new(opts);
    tokio::spawn(Publisher::new(client, &cfg).run(publish_rx));

    // serial link state mirrored for the reconnect re-announce below
    let (link_tx, link_rx) = watch::channel(false);

    // the event loop reconnects by polling again after an error; every
    // ConnAck re-announces the retained state so a restarted broker is
    // repopulated
    let announce_queue = queue.clone();
    let announce_cfg = cfg.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    info!("broker connected");
                    announce_queue.push(PublishCmd::Retained {
                        topic: format!("{}/sw-version", announce_cfg.mqtt.topic_prefix),
                        payload: VERSION.to_string(),
                    });
                    if announce_cfg.homeassistant.discovery {
                        for m in discovery::messages(&announce_cfg, VERSION) {
                            announce_queue.push(PublishCmd::Retained {
                                topic: m.topic,
                                payload: m.payload,
                            });
                        }
                    }
                    announce_queue.push(PublishCmd::Availability(*link_rx.borrow()));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}; reconnecting after short delay");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let reader_shutdown = Arc::new(AtomicBool::new(false));
    let serial_rx = serial::spawn_reader(&cfg.serial, reader_shutdown.clone())?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = stop_tx.send(true);
    });

    let mut store = MeasurementStore::new(&cfg.storage.measurement_file, cfg.storage.write_every);
    let result = pipeline::run(&cfg, &mut store, &queue, serial_rx, stop_rx, link_tx).await;

    reader_shutdown.store(true, Ordering::Relaxed);

    queue.push(PublishCmd::Availability(false));
    if cfg.homeassistant.clear_on_exit {
        for m in discovery::clear_messages(&cfg) {
            queue.push(PublishCmd::Retained {
                topic: m.topic,
                payload: m.payload,
            });
        }
    }
    // give the publisher a moment to flush the offline state
    tokio::time::sleep(Duration::from_secs(1)).await;

    result?;
    info!("clean shutdown");
    Ok(())
}
