//! Events handed to the presentation layer.
//!
//! The engine never draws anything itself. Every visible change is an event on
//! an unbounded channel and the front end decides how to show it.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRole {
    System,
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// Drop everything currently drawn for the conversation.
    ConversationCleared,
    MessageAppended {
        role: DisplayRole,
        content: String,
    },
    LoadingStarted,
    LoadingCleared,
    /// A reply bubble opens and will receive incremental text.
    ResponseStarted,
    /// Full text visible so far, not a delta.
    ResponseUpdated {
        text: String,
    },
    ResponseCompleted {
        text: String,
    },
    ChatListChanged,
    /// Transient bubble for a turn that produced no reply. Never persisted.
    TurnFailed {
        message: String,
    },
}

#[derive(Clone, Default)]
pub struct RenderChannel {
    tx: Option<UnboundedSender<RenderEvent>>,
}

impl RenderChannel {
    pub fn new() -> (Self, UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A channel nobody listens to, for headless use.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: RenderEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::warn!("render receiver dropped; event discarded");
            }
        }
    }
}

/// Loading indicator shown while a turn is in flight. Removed at most once.
pub struct LoadingPlaceholder {
    render: RenderChannel,
    attached: bool,
}

impl LoadingPlaceholder {
    pub fn show(render: &RenderChannel) -> Self {
        render.emit(RenderEvent::LoadingStarted);
        Self {
            render: render.clone(),
            attached: true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn remove(&mut self) {
        if self.attached {
            self.attached = false;
            self.render.emit(RenderEvent::LoadingCleared);
        }
    }
}

impl Drop for LoadingPlaceholder {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut UnboundedReceiver<RenderEvent>) -> Vec<RenderEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
