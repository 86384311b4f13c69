use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelegramError {
    #[error("unexpected frame layout: {0}")]
    Layout(String),
    #[error("bad counter value: {0}")]
    BadNumber(String),
}

/// One device register as reported in a data record: pulses in the last
/// reporting interval and pulses since device power-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCount {
    pub input: String,
    pub interval: u64,
    pub since_power_on: u64,
}

/// A parsed data record.
///
/// The device emits one line per reporting interval:
/// `ID:<serial>:I:<secs>:M1:<interval>:<total>:M2:<interval>:<total>:...`
/// A 2-register and a 5-register module speak the same layout, so the
/// number of `Mx` groups is not fixed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub device_id: String,
    pub interval_secs: u64,
    pub registers: Vec<RegisterCount>,
}

/// A single register's raw counter observation, ready for reconciliation.
/// `raw` is the device's own count since its last power-on; it restarts at
/// zero whenever the device loses power.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub input: String,
    pub raw: u64,
    pub ts: DateTime<Utc>,
}

impl Telegram {
    /// Raw counter observations for every register in the record, stamped
    /// with the receive time.
    pub fn samples(&self, ts: DateTime<Utc>) -> impl Iterator<Item = RawSample> + '_ {
        self.registers.iter().map(move |r| RawSample {
            input: r.input.clone(),
            raw: r.since_power_on,
            ts,
        })
    }
}

/// The one-time header record the device prints at power-on,
/// e.g. `/8237: S0 Pulse Counter V0.6 - 30/30/30/30/30ms`.
pub fn is_header(line: &str) -> bool {
    line.starts_with('/')
}

pub fn parse_line(line: &str) -> Result<Telegram, TelegramError> {
    let line = line.trim().trim_end_matches('\r');
    let fields: Vec<&str> = line.split(':').collect();

    // ID:<serial>:I:<secs> followed by at least one M-group of three fields
    if fields.len() < 7 || fields[0] != "ID" || fields[2] != "I" {
        return Err(TelegramError::Layout(line.to_string()));
    }
    if fields[1].is_empty() || !fields[1].bytes().all(|b| b.is_ascii_digit()) {
        return Err(TelegramError::Layout(line.to_string()));
    }
    let device_id = fields[1].to_string();
    let interval_secs = parse_count(fields[3])?;

    let groups = &fields[4..];
    if groups.is_empty() || groups.len() % 3 != 0 {
        return Err(TelegramError::Layout(line.to_string()));
    }

    let mut registers = Vec::with_capacity(groups.len() / 3);
    for (idx, group) in groups.chunks(3).enumerate() {
        let expected = format!("M{}", idx + 1);
        if group[0] != expected {
            return Err(TelegramError::Layout(line.to_string()));
        }
        registers.push(RegisterCount {
            input: expected,
            interval: parse_count(group[1])?,
            since_power_on: parse_count(group[2])?,
        });
    }

    Ok(Telegram {
        device_id,
        interval_secs,
        registers,
    })
}

fn parse_count(s: &str) -> Result<u64, TelegramError> {
    s.parse::<u64>()
        .map_err(|_| TelegramError::BadNumber(s.to_string()))
}
