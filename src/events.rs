//! Progress reporting for a patch run.
//!
//! A [`Patcher`](crate::patcher::Patcher) reports through an [`EventSink`] handed to it by the
//! caller. Every event is also mirrored to the `log` facade, so a sink is optional.
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use crate::units::DexUnit;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchEvent {
    Log { level: log::Level, message: String },
    StateChanged(PatchState),
    UnitSkipped { unit: DexUnit, reason: String },
    Failed { message: String },
}

/// UI-facing lifecycle of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchState {
    Empty,
    Decompiling,
    Configuration,
    Patching,
    Finished,
    Error,
}

impl PatchState {
    /// `Reset` (to `Empty`) is always allowed; otherwise the run only moves forward, and
    /// `Finished`/`Error` are only reachable from `Patching`.
    pub fn can_transition_to(self, next: PatchState) -> bool {
        use PatchState::*;
        matches!(
            (self, next),
            (_, Empty)
                | (Empty, Decompiling)
                | (Decompiling, Configuration)
                | (Configuration, Patching)
                | (Patching, Finished)
                | (Patching, Error)
        )
    }
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchState::Empty => "empty",
            PatchState::Decompiling => "decompiling",
            PatchState::Configuration => "configuration",
            PatchState::Patching => "patching",
            PatchState::Finished => "finished",
            PatchState::Error => "error",
        };
        f.write_str(name)
    }
}

type Callback = Box<dyn Fn(PatchEvent) + Send + Sync>;

/// Where a run's events go.
#[derive(Default)]
pub struct EventSink {
    callback: Option<Callback>,
}

impl EventSink {
    /// Events only reach the `log` facade.
    pub fn none() -> Self {
        EventSink { callback: None }
    }

    pub fn from_fn(callback: impl Fn(PatchEvent) + Send + Sync + 'static) -> Self {
        EventSink {
            callback: Some(Box::new(callback)),
        }
    }

    /// Forwards events to a channel. A hung-up receiver is ignored.
    pub fn channel(sender: Sender<PatchEvent>) -> Self {
        let sender = Mutex::new(sender);
        EventSink::from_fn(move |event| {
            if let Ok(sender) = sender.lock() {
                let _ = sender.send(event);
            }
        })
    }

    pub fn emit(&self, event: PatchEvent) {
        match &event {
            PatchEvent::Log { level, message } => log::log!(*level, "{message}"),
            PatchEvent::StateChanged(state) => log::debug!("state -> {state}"),
            PatchEvent::UnitSkipped { unit, reason } => log::warn!("skipping {unit}: {reason}"),
            PatchEvent::Failed { message } => log::error!("{message}"),
        }
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(log::Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(log::Level::Warn, message);
    }

    pub fn log(&self, level: log::Level, message: impl Into<String>) {
        self.emit(PatchEvent::Log {
            level,
            message: message.into(),
        });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Tracks [`PatchState`] and reports every change through the sink.
#[derive(Debug)]
pub struct StateMachine {
    state: PatchState,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine {
            state: PatchState::Empty,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> PatchState {
        self.state
    }

    /// Moves to `next` if allowed. Illegal moves are logged and refused.
    pub fn advance(&mut self, next: PatchState, sink: &EventSink) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!("refusing state change {} -> {next}", self.state);
            return false;
        }
        self.state = next;
        sink.emit(PatchEvent::StateChanged(next));
        true
    }

    pub fn reset(&mut self, sink: &EventSink) {
        self.advance(PatchState::Empty, sink);
    }
}
