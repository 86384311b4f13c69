use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::SerialConfig;
use crate::error::{AppError, Result};

#[derive(Debug)]
pub enum SerialEvent {
    /// One complete line, CR/LF stripped.
    Line(String),
    /// Transport is gone for good (device unplugged, port error). Distinct
    /// from a read timeout, which is silent here.
    Fatal(String),
    /// Replay stream ran out; clean end of input.
    Eof,
}

/// Start the blocking reader on its own thread and return the line channel.
///
/// The read timeout is one second, so the thread observes the shutdown flag
/// promptly and the async side can clock link silence itself. The device
/// speaks 7E1.
pub fn spawn_reader(
    cfg: &SerialConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<mpsc::Receiver<SerialEvent>> {
    let (tx, rx) = mpsc::channel(64);

    if let Some(path) = &cfg.replay_file {
        let file = File::open(path)
            .map_err(|e| AppError::Serial(format!("cannot open replay file {path}: {e}")))?;
        info!(file = %path, "replaying telegrams from file");
        thread::spawn(move || replay_loop(file, tx, shutdown));
        return Ok(rx);
    }

    let port = serialport::new(cfg.port.as_str(), cfg.baudrate)
        .data_bits(serialport::DataBits::Seven)
        .parity(serialport::Parity::Even)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_secs(1))
        .open()
        .map_err(|e| AppError::Serial(format!("cannot open {}: {e}", cfg.port)))?;
    info!(port = %cfg.port, baudrate = cfg.baudrate, "serial port opened");

    thread::spawn(move || read_loop(port, tx, shutdown));
    Ok(rx)
}

fn read_loop(
    port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<SerialEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(port);
    let mut line = String::new();

    while !shutdown.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => {
                // a serial device does not EOF while healthy
                let _ = tx.blocking_send(SerialEvent::Fatal("serial stream closed".into()));
                return;
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if !trimmed.is_empty()
                    && tx.blocking_send(SerialEvent::Line(trimmed.to_string())).is_err()
                {
                    return;
                }
                line.clear();
            }
            // partial line stays buffered; the next read resumes it
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                // line noise that is not valid utf-8; drop the fragment
                debug!("discarding non-utf8 serial data");
                line.clear();
            }
            Err(e) => {
                error!(error = %e, "serial read failed");
                let _ = tx.blocking_send(SerialEvent::Fatal(e.to_string()));
                return;
            }
        }
    }
    debug!("serial reader stopped");
}

fn replay_loop<R: Read>(source: R, tx: mpsc::Sender<SerialEvent>, shutdown: Arc<AtomicBool>) {
    let reader = BufReader::new(source);
    for line in reader.lines() {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match line {
            Ok(l) => {
                let trimmed = l.trim_end_matches('\r');
                if trimmed == "EOF" {
                    break;
                }
                if trimmed.is_empty() {
                    continue;
                }
                if tx.blocking_send(SerialEvent::Line(trimmed.to_string())).is_err() {
                    return;
                }
                // pace roughly like a device without stalling tests
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                let _ = tx.blocking_send(SerialEvent::Fatal(e.to_string()));
                return;
            }
        }
    }
    let _ = tx.blocking_send(SerialEvent::Eof);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_ends_with_eof_sentinel() {
        let data = "ID:1:I:10:M1:0:1:M2:0:2\nEOF\nID:1:I:10:M1:0:9:M2:0:9\n";
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        thread::spawn(move || replay_loop(data.as_bytes(), tx, shutdown));

        match rx.recv().await.unwrap() {
            SerialEvent::Line(l) => assert_eq!(l, "ID:1:I:10:M1:0:1:M2:0:2"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), SerialEvent::Eof));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn replay_without_sentinel_still_ends_cleanly() {
        let data = "ID:1:I:10:M1:0:1:M2:0:2\n";
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        thread::spawn(move || replay_loop(data.as_bytes(), tx, shutdown));

        assert!(matches!(rx.recv().await.unwrap(), SerialEvent::Line(_)));
        assert!(matches!(rx.recv().await.unwrap(), SerialEvent::Eof));
    }
}
