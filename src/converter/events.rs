//! Converter events and their subscribers
//!
//! Delivery is synchronous on the producing thread, which may be a blocking
//! transform worker rather than the task driving the pipeline. Listeners must
//! return quickly and must not block.

use crate::AudioTags;
use bytes::Bytes;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Decrypt progress as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptProgress {
    /// Work has started but no percentage is available yet
    Indeterminate,
    /// Percent complete, `0..=100`
    Percent(u8),
}

/// Event emitted while a pipeline runs
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterEvent {
    /// Tags read from the container header
    TagsRetrieved(AudioTags),
    /// Cover art read from the container header, if it carries any
    CoverArtRetrieved(Option<Bytes>),
    /// Progress of the download and convert stage
    DecryptProgress(DecryptProgress),
    /// Estimated time until the transform finishes
    DecryptTimeRemaining(Duration),
}

impl ConverterEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            ConverterEvent::TagsRetrieved(_) => EventKind::TagsRetrieved,
            ConverterEvent::CoverArtRetrieved(_) => EventKind::CoverArtRetrieved,
            ConverterEvent::DecryptProgress(_) => EventKind::DecryptProgress,
            ConverterEvent::DecryptTimeRemaining(_) => EventKind::DecryptTimeRemaining,
        }
    }
}

/// Event discriminant used for filtered subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ConverterEvent::TagsRetrieved`]
    TagsRetrieved,
    /// [`ConverterEvent::CoverArtRetrieved`]
    CoverArtRetrieved,
    /// [`ConverterEvent::DecryptProgress`]
    DecryptProgress,
    /// [`ConverterEvent::DecryptTimeRemaining`]
    DecryptTimeRemaining,
}

/// Event listener
pub type Listener = Arc<dyn Fn(&ConverterEvent) + Send + Sync>;

/// Multicast list of listeners
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventHub {
    /// Hub without listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ConverterEvent) + Send + Sync + 'static,
    {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(Arc::new(listener));
    }

    /// Receive only events of `kind`
    pub fn subscribe_to<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ConverterEvent) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            if event.kind() == kind {
                listener(event);
            }
        });
    }

    /// Deliver `event` to every listener.
    ///
    /// Listeners are called on a snapshot, so a listener may subscribe others
    /// without deadlocking.
    pub fn emit(&self, event: &ConverterEvent) {
        let snapshot: Vec<Listener> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of listeners
    pub fn len(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether nobody is listening
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").field("listeners", &self.len()).finish()
    }
}
