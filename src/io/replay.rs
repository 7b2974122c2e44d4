//! Scripted transport that replays sensor sessions without a radio
//!
//! Script format, one step per line (`#` starts a comment):
//!
//! ```text
//! 3.0              distance sample in cm (sent as a 4-byte LE f32)
//! raw 01 02 03     arbitrary payload bytes, hex
//! wait 500         quiet period in milliseconds
//! drop out of range   link lost, with an optional reason
//! session          start the next session (used after a reconnect)
//! fail-connect     the connect for this session fails
//! fail-subscribe   the subscription for this session fails
//! ```
//!
//! A session whose steps run out reports the link as lost.

use crate::domain::types::DistanceSample;
use crate::io::transport::{NotifySetup, Received, Session, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    Payload(Bytes),
    Wait(Duration),
    Drop(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionScript {
    steps: VecDeque<ReplayStep>,
    fail_connect: bool,
    fail_subscribe: bool,
}

impl SessionScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(mut self, cm: f32) -> Self {
        let payload = Bytes::copy_from_slice(&DistanceSample(cm).encode());
        self.steps.push_back(ReplayStep::Payload(payload));
        self
    }

    pub fn raw(mut self, payload: &[u8]) -> Self {
        self.steps.push_back(ReplayStep::Payload(Bytes::copy_from_slice(payload)));
        self
    }

    pub fn wait(mut self, duration: Duration) -> Self {
        self.steps.push_back(ReplayStep::Wait(duration));
        self
    }

    pub fn drop_link(mut self, reason: &str) -> Self {
        self.steps.push_back(ReplayStep::Drop(reason.to_string()));
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    pub fn steps(&self) -> impl Iterator<Item = &ReplayStep> {
        self.steps.iter()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReplayParseError {
    #[error("line {line}: '{text}' is not a distance or a known step")]
    UnknownStep { line: usize, text: String },

    #[error("line {line}: bad wait duration '{text}'")]
    BadWait { line: usize, text: String },

    #[error("line {line}: bad hex byte '{text}'")]
    BadHex { line: usize, text: String },
}

/// Parse a replay script into one [`SessionScript`] per session
pub fn parse_script(text: &str) -> Result<Vec<SessionScript>, ReplayParseError> {
    let mut sessions = vec![SessionScript::new()];

    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let content = raw_line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }
        let (word, rest) = match content.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (content, ""),
        };
        if word == "session" {
            sessions.push(SessionScript::new());
            continue;
        }
        let Some(current) = sessions.last_mut() else {
            continue;
        };

        match word {
            "fail-connect" => current.fail_connect = true,
            "fail-subscribe" => current.fail_subscribe = true,
            "drop" => {
                let reason = if rest.is_empty() { "link dropped by script" } else { rest };
                current.steps.push_back(ReplayStep::Drop(reason.to_string()));
            }
            "wait" => {
                let ms: u64 = rest
                    .parse()
                    .map_err(|_| ReplayParseError::BadWait { line, text: rest.to_string() })?;
                current.steps.push_back(ReplayStep::Wait(Duration::from_millis(ms)));
            }
            "raw" => {
                let bytes = rest
                    .split_whitespace()
                    .map(|b| {
                        u8::from_str_radix(b, 16)
                            .map_err(|_| ReplayParseError::BadHex { line, text: b.to_string() })
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                current.steps.push_back(ReplayStep::Payload(Bytes::from(bytes)));
            }
            _ => {
                let cm: f32 = content
                    .parse()
                    .map_err(|_| ReplayParseError::UnknownStep { line, text: content.to_string() })?;
                let payload = Bytes::copy_from_slice(&DistanceSample(cm).encode());
                current.steps.push_back(ReplayStep::Payload(payload));
            }
        }
    }

    Ok(sessions)
}

#[derive(Debug, Default)]
struct ReplayRecord {
    connect_attempts: usize,
    subscriptions: Vec<NotifySetup>,
    closed_sessions: usize,
}

/// Read side of what the replay transport saw, for assertions
#[derive(Debug, Clone, Default)]
pub struct ReplayProbe {
    record: Arc<Mutex<ReplayRecord>>,
}

impl ReplayProbe {
    pub fn connect_attempts(&self) -> usize {
        self.record.lock().connect_attempts
    }

    pub fn subscriptions(&self) -> Vec<NotifySetup> {
        self.record.lock().subscriptions.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.record.lock().closed_sessions
    }
}

pub struct ReplayTransport {
    sessions: VecDeque<SessionScript>,
    probe: ReplayProbe,
}

impl ReplayTransport {
    pub fn new(sessions: impl IntoIterator<Item = SessionScript>) -> Self {
        Self { sessions: sessions.into_iter().collect(), probe: ReplayProbe::default() }
    }

    pub fn probe(&self) -> ReplayProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    type Session = ReplaySession;

    async fn connect(&mut self, address: &str) -> Result<ReplaySession, TransportError> {
        self.probe.record.lock().connect_attempts += 1;

        let connect_failed = |reason: &str| TransportError::ConnectFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        };
        let script = self
            .sessions
            .pop_front()
            .ok_or_else(|| connect_failed("replay script has no more sessions"))?;
        if script.fail_connect {
            return Err(connect_failed("connect failure injected by replay script"));
        }

        debug!(address, steps = script.steps.len(), "replay_session_opened");
        Ok(ReplaySession {
            steps: script.steps,
            fail_subscribe: script.fail_subscribe,
            probe: self.probe.clone(),
        })
    }
}

pub struct ReplaySession {
    steps: VecDeque<ReplayStep>,
    fail_subscribe: bool,
    probe: ReplayProbe,
}

#[async_trait]
impl Session for ReplaySession {
    async fn subscribe(&mut self, setup: &NotifySetup) -> Result<(), TransportError> {
        if self.fail_subscribe {
            return Err(TransportError::SubscribeFailed(
                "subscribe failure injected by replay script".to_string(),
            ));
        }
        self.probe.record.lock().subscriptions.push(*setup);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Received {
        let mut budget = timeout;

        loop {
            match self.steps.pop_front() {
                Some(ReplayStep::Payload(bytes)) => return Received::Notification(bytes),
                Some(ReplayStep::Drop(reason)) => return Received::LinkLost(reason),
                Some(ReplayStep::Wait(remaining)) if remaining > budget => {
                    tokio::time::sleep(budget).await;
                    self.steps.push_front(ReplayStep::Wait(remaining - budget));
                    return Received::Timeout;
                }
                Some(ReplayStep::Wait(remaining)) => {
                    tokio::time::sleep(remaining).await;
                    budget -= remaining;
                }
                None => return Received::LinkLost("replay script ended".to_string()),
            }
        }
    }

    async fn close(&mut self) {
        self.steps.clear();
        self.probe.record.lock().closed_sessions += 1;
    }
}
