//! Typing effect for replies that arrived complete.

use crate::render::{RenderChannel, RenderEvent};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_CHUNK_CHARS: usize = 3;
pub const DEFAULT_TICK: Duration = Duration::from_millis(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealCadence {
    pub chunk_chars: usize,
    pub tick: Duration,
}

impl Default for RevealCadence {
    fn default() -> Self {
        Self {
            chunk_chars: DEFAULT_CHUNK_CHARS,
            tick: DEFAULT_TICK,
        }
    }
}

/// Splits `text` into pieces of `chunk_chars` characters (the last may be shorter).
pub fn segments(text: &str, chunk_chars: usize) -> Vec<String> {
    let size = chunk_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect())
        .collect()
}

pub struct RevealScheduler {
    cadence: RevealCadence,
}

impl RevealScheduler {
    pub fn new(cadence: RevealCadence) -> Self {
        Self { cadence }
    }

    /// Appends one segment per tick, then reports the full text as completed.
    pub async fn reveal(&self, text: &str, render: &RenderChannel) {
        render.emit(RenderEvent::ResponseStarted);
        let mut ticker = (!self.cadence.tick.is_zero()).then(|| {
            let mut ticker = interval(self.cadence.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut visible = String::with_capacity(text.len());
        for segment in segments(text, self.cadence.chunk_chars) {
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }
            visible.push_str(&segment);
            render.emit(RenderEvent::ResponseUpdated {
                text: visible.clone(),
            });
        }
        render.emit(RenderEvent::ResponseCompleted { text: visible });
    }
}
