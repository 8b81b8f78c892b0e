//! Scripted transport for tests.
//!
//! Each target has a queue of steps consumed one per call; once the queue is
//! empty the transport falls back to its default step (success unless set).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use unveil_core::traits::Transport;
use unveil_core::types::{ChannelKind, OutboundPayload, SendError, SendErrorKind};

/// What one scripted call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Ok,
    Fail(SendErrorKind),
    /// Never answers; the sender's timeout fires.
    Hang,
}

#[derive(Default)]
struct Script {
    queues: HashMap<String, VecDeque<Step>>,
    calls: HashMap<String, u32>,
    bodies: Vec<(String, String)>,
}

pub struct ScriptedTransport {
    channel: ChannelKind,
    default_step: Mutex<Step>,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            default_step: Mutex::new(Step::Ok),
            script: Mutex::new(Script::default()),
        }
    }

    /// Queue steps for `target`, appended after anything already queued.
    pub fn script(&self, target: &str, steps: Vec<Step>) {
        let mut script = self.script.lock().unwrap();
        script.queues.entry(target.to_string()).or_default().extend(steps);
    }

    /// Step used for any target whose queue is empty.
    pub fn set_default(&self, step: Step) {
        *self.default_step.lock().unwrap() = step;
    }

    /// Number of deliver calls made for `target`.
    pub fn calls(&self, target: &str) -> u32 {
        self.script.lock().unwrap().calls.get(target).copied().unwrap_or(0)
    }

    /// Total deliver calls across all targets.
    pub fn total_calls(&self) -> u32 {
        self.script.lock().unwrap().calls.values().sum()
    }

    /// `(target, body)` of every call, in call order.
    pub fn sent_bodies(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().bodies.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn channel(&self) -> ChannelKind {
        self.channel
    }

    async fn deliver(&self, target: &str, payload: &OutboundPayload) -> Result<Option<String>, SendError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(target.to_string()).or_default() += 1;
            script.bodies.push((target.to_string(), payload.body.clone()));
            let next = script.queues.get_mut(target).and_then(|q| q.pop_front());
            match next {
                Some(step) => step,
                None => self.default_step.lock().unwrap().clone(),
            }
        };

        match step {
            Step::Ok => Ok(Some(format!("{}-{}", self.channel, uuid::Uuid::new_v4()))),
            Step::Fail(kind) => Err(SendError::new(kind, format!("scripted {kind:?}"))),
            Step::Hang => std::future::pending().await,
        }
    }
}
