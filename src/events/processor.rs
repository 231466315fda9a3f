//! The event processor: a bounded dispatch loop between application threads
//! producing events and the sender shipping them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::output::OutputEvent;
use super::sender::{EventSender, SenderOutcome};
use super::summarizer::{EventSummarizer, UserKeys};
use super::{now_millis, EventsConfiguration, FeatureRequestEvent, InputEvent};

enum DispatcherMessage {
    Event(InputEvent),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Accepts events from any thread and never blocks: when the bounded channel
/// is full the event is dropped and counted.
///
/// A consumer task owns all pipeline state (summary counters, user dedup,
/// pending output events) exclusively; the channel is the only
/// synchronization boundary.
pub struct EventProcessor {
    tx: mpsc::Sender<DispatcherMessage>,
    dropped_events: Arc<AtomicUsize>,
    disabled: Arc<AtomicBool>,
}

impl EventProcessor {
    /// Spawns the dispatch task and returns its handle. Must be called from
    /// within a tokio runtime.
    pub(crate) fn start(config: EventsConfiguration, sender: EventSender) -> EventProcessor {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let disabled = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher::new(config, sender, Arc::clone(&disabled));
        tokio::spawn(dispatcher.run(rx));

        EventProcessor {
            tx,
            dropped_events: Arc::new(AtomicUsize::new(0)),
            disabled,
        }
    }

    #[cfg(test)]
    fn detached(capacity: usize) -> (EventProcessor, mpsc::Receiver<DispatcherMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            EventProcessor {
                tx,
                dropped_events: Arc::new(AtomicUsize::new(0)),
                disabled: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Enqueues an event. Never blocks; a full channel drops the event and
    /// increments the drop counter.
    pub fn send(&self, event: InputEvent) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        match self.tx.try_send(DispatcherMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(target: "darklaunch",
                    dropped;
                    "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// How many events have been dropped due to a full channel.
    pub fn dropped_events(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Flushes pending events and the current summary to the sender.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DispatcherMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drains the queue, performs a final flush, and stops the dispatch task.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DispatcherMessage::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct Dispatcher {
    config: EventsConfiguration,
    sender: EventSender,
    disabled: Arc<AtomicBool>,
    summarizer: EventSummarizer,
    user_keys: UserKeys,
    outbox: Vec<OutputEvent>,
}

impl Dispatcher {
    fn new(config: EventsConfiguration, sender: EventSender, disabled: Arc<AtomicBool>) -> Self {
        Dispatcher {
            user_keys: UserKeys::new(config.user_keys_capacity),
            summarizer: EventSummarizer::new(),
            outbox: Vec::new(),
            config,
            sender,
            disabled,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DispatcherMessage>) {
        let mut flush_timer = tokio::time::interval(self.config.flush_interval);
        let mut user_purge_timer = tokio::time::interval(self.config.user_keys_flush_interval);
        // The first tick of a tokio interval fires immediately.
        flush_timer.tick().await;
        user_purge_timer.tick().await;

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(DispatcherMessage::Event(event)) => self.process_event(event),
                    Some(DispatcherMessage::Flush(ack)) => {
                        self.flush();
                        let _ = ack.send(());
                    }
                    Some(DispatcherMessage::Close(ack)) => {
                        // Drain whatever producers managed to enqueue first.
                        while let Ok(DispatcherMessage::Event(event)) = rx.try_recv() {
                            self.process_event(event);
                        }
                        self.final_flush().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.final_flush().await;
                        return;
                    }
                },
                _ = flush_timer.tick() => self.flush(),
                _ = user_purge_timer.tick() => self.user_keys.clear(),
            }
        }
    }

    fn process_event(&mut self, event: InputEvent) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        match &event {
            InputEvent::FeatureRequest(feature) => {
                // Every feature request reaches the summarizer, tracked or not.
                self.summarizer.summarize(feature);

                let seen = self.user_keys.notice(feature.base.user.key());
                if !self.config.inline_users_in_events && !seen {
                    self.outbox.push(OutputEvent::index(
                        feature.base.creation_date,
                        &feature.base.user,
                        &self.config,
                    ));
                }
                if feature.track_events || feature.reason.is_some() {
                    self.outbox.push(OutputEvent::feature(feature, &self.config));
                }
                if self.debug_active(feature) {
                    self.outbox.push(OutputEvent::debug(feature, &self.config));
                }
            }
            InputEvent::Custom(custom) => {
                let seen = self.user_keys.notice(custom.base.user.key());
                if !self.config.inline_users_in_events && !seen {
                    self.outbox.push(OutputEvent::index(
                        custom.base.creation_date,
                        &custom.base.user,
                        &self.config,
                    ));
                }
                self.outbox.push(OutputEvent::custom(custom, &self.config));
            }
            InputEvent::Identify(identify) => {
                self.user_keys.notice(identify.base.user.key());
                self.outbox.push(OutputEvent::identify(identify, &self.config));
            }
        }
    }

    /// A debug deadline counts while it is ahead of both the local clock and
    /// the server clock last seen by the sender.
    fn debug_active(&self, event: &FeatureRequestEvent) -> bool {
        event.debug_events_until_date.is_some_and(|until| {
            until > now_millis() && until > self.sender.last_known_server_time()
        })
    }

    /// Snapshots pending output events plus exactly one summary event, and
    /// resets both for the next window.
    fn take_payload(&mut self) -> Vec<OutputEvent> {
        let mut payload = std::mem::take(&mut self.outbox);
        if !self.summarizer.is_empty() {
            payload.push(OutputEvent::summary(self.summarizer.take()));
        }
        payload
    }

    fn flush(&mut self) {
        let payload = self.take_payload();
        if payload.is_empty() {
            return;
        }
        let sender = self.sender.clone();
        let disabled = Arc::clone(&self.disabled);
        tokio::spawn(async move {
            if sender.send(&payload).await == SenderOutcome::PermanentFailure {
                disabled.store(true, Ordering::Relaxed);
            }
        });
    }

    async fn final_flush(&mut self) {
        let payload = self.take_payload();
        if payload.is_empty() {
            return;
        }
        if self.sender.send(&payload).await == SenderOutcome::PermanentFailure {
            self.disabled.store(true, Ordering::Relaxed);
        }
    }
}
