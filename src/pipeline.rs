use std::io;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::link::{LinkEvent, LinkMonitor};
use crate::meter::Reconciler;
use crate::publish::{PublishCmd, PublishQueue};
use crate::serial::SerialEvent;
use crate::store::MeasurementStore;
use crate::telegram;

/// The accounting loop: one sequential stream of serial lines drives
/// parser -> link monitor -> reconciler -> totals store, with readings
/// pushed onto the publication queue. Sole owner of channel and link
/// state, so the accounting path needs no locks.
///
/// Returns `Ok` only for a clean shutdown (signal or end of replay) with
/// totals flushed; a transport failure or an unflushable totals file is an
/// error, and the exit code follows it.
pub async fn run(
    cfg: &Config,
    store: &mut MeasurementStore,
    queue: &PublishQueue,
    mut serial_rx: mpsc::Receiver<SerialEvent>,
    mut shutdown: watch::Receiver<bool>,
    link_status: watch::Sender<bool>,
) -> Result<()> {
    let mut measurements = store.load();
    let mut reconciler = Reconciler::new(
        cfg.channels
            .iter()
            .map(|c| (c.input.clone(), measurements.total(&c.input))),
    );
    let mut monitor = LinkMonitor::new(Duration::from_secs(cfg.serial.silence_timeout_secs));
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let mut frames_ok: u64 = 0;
    let mut parse_errors: u64 = 0;
    let mut persist_failed = false;
    let mut fatal: Option<AppError> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("shutdown requested");
                break;
            }
            ev = serial_rx.recv() => {
                match ev {
                    Some(SerialEvent::Line(line)) => {
                        if telegram::is_header(&line) {
                            debug!(line = %line, "device header record");
                            continue;
                        }
                        let frame = match telegram::parse_line(&line) {
                            Ok(t) => t,
                            Err(e) => {
                                parse_errors += 1;
                                warn!(error = %e, total = parse_errors, "dropping malformed frame");
                                continue;
                            }
                        };
                        frames_ok += 1;

                        if let Some(LinkEvent::Up) = monitor.on_frame(Instant::now()) {
                            info!(device = %frame.device_id, "serial link up");
                            link_status.send_replace(true);
                            queue.push(PublishCmd::Availability(true));
                        }

                        let ts = Utc::now();
                        let mut changed = false;
                        for sample in frame.samples(ts) {
                            let Some(reading) = reconciler.apply(&sample) else {
                                continue;
                            };
                            measurements.set_total(&reading.input, reading.total_pulses);
                            changed = true;
                            if cfg.publication.dedupe && reading.delta_pulses == 0 {
                                continue;
                            }
                            queue.push(PublishCmd::Reading(reading));
                        }

                        if changed {
                            measurements.date = ts.timestamp();
                            match store.save_throttled(&measurements) {
                                Ok(_) => persist_failed = false,
                                Err(e) => {
                                    warn!(error = %e, "persisting totals failed; will retry on next update");
                                    persist_failed = true;
                                }
                            }
                        }
                    }
                    Some(SerialEvent::Fatal(e)) => {
                        error!(error = %e, "serial transport failed");
                        if monitor.on_transport_error() == Some(LinkEvent::Down) {
                            link_status.send_replace(false);
                            queue.push(PublishCmd::Availability(false));
                            reconciler.mark_link_down();
                        }
                        fatal = Some(AppError::Serial(e));
                        break;
                    }
                    Some(SerialEvent::Eof) => {
                        info!("end of replay input");
                        break;
                    }
                    None => {
                        debug!("serial channel closed");
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                if let Some(LinkEvent::Down) = monitor.check_silence(Instant::now()) {
                    warn!(
                        timeout_secs = cfg.serial.silence_timeout_secs,
                        frames_ok,
                        "serial link silent beyond timeout"
                    );
                    link_status.send_replace(false);
                    queue.push(PublishCmd::Availability(false));
                    reconciler.mark_link_down();
                }
            }
        }
    }

    info!(frames_ok, parse_errors, "serial session ended");

    // unthrottled flush; failure here must be visible in the exit code
    match store.save(&measurements) {
        Ok(()) => persist_failed = false,
        Err(e) => {
            error!(error = %e, "final totals flush failed");
            persist_failed = true;
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    if persist_failed {
        return Err(AppError::Io(io::Error::new(
            io::ErrorKind::Other,
            "measurement totals could not be persisted",
        )));
    }
    Ok(())
}
