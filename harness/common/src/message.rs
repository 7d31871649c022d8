//! Building outgoing messages from command-line input.

use stomp_client::{is_reserved_header, TextMessage};
use tracing::warn;

pub const SCHEDULED_DELAY: &str = "AMQ_SCHEDULED_DELAY";
pub const SCHEDULED_PERIOD: &str = "AMQ_SCHEDULED_PERIOD";
pub const SCHEDULED_REPEAT: &str = "AMQ_SCHEDULED_REPEAT";

/// Split a `key:value` argument at its first colon. Arguments without a
/// colon yield nothing.
pub fn parse_header(raw: &str) -> Option<(String, String)> {
    raw.split_once(':')
        .map(|(key, value)| (key.to_string(), value.to_string()))
}

pub fn parse_headers<I, S>(raw: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|header| {
            let header = header.as_ref();
            let Some((key, value)) = parse_header(header) else {
                warn!("Skipping header '{header}', expected key:value");
                return None;
            };
            if is_reserved_header(&key) {
                warn!("Skipping header '{header}', '{key}' is a reserved frame header");
                return None;
            }
            Some((key, value))
        })
        .collect()
}

/// Broker-side scheduled delivery, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    pub delay: Option<u64>,
    pub period: Option<u64>,
    pub repeat: Option<u32>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.delay.is_none() && self.period.is_none() && self.repeat.is_none()
    }

    pub fn apply(&self, message: &mut TextMessage) {
        if let Some(delay) = self.delay {
            message.set_long_property(SCHEDULED_DELAY, i64::try_from(delay).unwrap_or(i64::MAX));
        }
        if let Some(period) = self.period {
            message.set_long_property(SCHEDULED_PERIOD, i64::try_from(period).unwrap_or(i64::MAX));
        }
        if let Some(repeat) = self.repeat {
            message.set_int_property(SCHEDULED_REPEAT, i32::try_from(repeat).unwrap_or(i32::MAX));
        }
    }
}

/// What every send task of a `produce` run puts on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSpec {
    pub payload: String,
    pub headers: Vec<(String, String)>,
    pub schedule: Schedule,
    pub count: usize,
}

impl MessageSpec {
    pub fn new(payload: impl Into<String>, count: usize) -> Self {
        MessageSpec {
            payload: payload.into(),
            count,
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// A fresh message: payload, then string headers, then scheduling.
    pub fn build(&self) -> TextMessage {
        let mut message = TextMessage::new(self.payload.as_str());
        for (key, value) in &self.headers {
            message.set_string_property(key.as_str(), value.as_str());
        }
        self.schedule.apply(&mut message);
        message
    }
}
