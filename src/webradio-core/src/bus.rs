//! In-process event bus.
//!
//! Producers push into a single unbounded ingress queue. A dispatcher thread
//! pops with a bounded wait and copies every event (as a shared `Arc`) into
//! each registered consumer queue. On shutdown every consumer that is still
//! registered receives [`BusMessage::Terminated`].

use crate::config::EventsConfig;
use crate::events::{BusMessage, Event, EventPublisher};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consumer map; `None` once the bus has shut down.
struct Registry {
    consumers: Mutex<Option<HashMap<String, Sender<BusMessage>>>>,
}

impl Registry {
    fn add(&self, id: &str, queue: Sender<BusMessage>) -> bool {
        let mut guard = self.consumers.lock();
        let Some(consumers) = guard.as_mut() else {
            tracing::debug!(consumer = id, "bus is shut down; registration ignored");
            return false;
        };
        if consumers.contains_key(id) {
            tracing::debug!(consumer = id, "consumer already registered");
            return false;
        }
        consumers.insert(id.to_string(), queue);
        tracing::debug!(consumer = id, "consumer registered");
        true
    }

    fn remove(&self, id: &str) -> bool {
        let removed = self
            .consumers
            .lock()
            .as_mut()
            .and_then(|consumers| consumers.remove(id))
            .is_some();
        if removed {
            tracing::debug!(consumer = id, "consumer removed");
        }
        removed
    }

    fn len(&self) -> usize {
        self.consumers.lock().as_ref().map_or(0, HashMap::len)
    }

    // The lock is held for the whole fan-out, so a concurrent registration
    // change sees either all or none of the deliveries of this event.
    fn fan_out(&self, event: &Arc<Event>) {
        let guard = self.consumers.lock();
        let Some(consumers) = guard.as_ref() else {
            return;
        };
        for (id, queue) in consumers {
            if queue.send(BusMessage::Event(Arc::clone(event))).is_err() {
                tracing::trace!(consumer = %id, "consumer queue is closed");
            }
        }
    }

    /// Terminate every remaining consumer and make the map unusable.
    fn close(&self) -> usize {
        let Some(consumers) = self.consumers.lock().take() else {
            return 0;
        };
        for queue in consumers.values() {
            let _ = queue.send(BusMessage::Terminated);
        }
        consumers.len()
    }
}

/// Fan-out hub between event producers and consumer queues.
pub struct EventBus {
    ingress: Sender<Event>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Start a bus whose dispatcher polls at the configured interval.
    pub fn start(config: &EventsConfig) -> Self {
        Self::with_poll_interval(config.poll_interval())
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        let (ingress, rx) = unbounded();
        let registry = Arc::new(Registry {
            consumers: Mutex::new(Some(HashMap::new())),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || dispatch_loop(rx, registry, shutdown, poll_interval))
        };

        Self {
            ingress,
            registry,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// A producer handle that feeds this bus.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.ingress.clone())
    }

    /// Enqueue an event for dispatch. Never blocks.
    pub fn push_event(&self, event: Event) {
        // The dispatcher owns the receiver until the bus is dropped, so this
        // only fails after shutdown, when events are discarded anyway.
        let _ = self.ingress.send(event);
    }

    /// Register `queue` under `id`. The first registration of an id wins;
    /// returns whether this call registered the queue.
    pub fn add_consumer(&self, id: &str, queue: Sender<BusMessage>) -> bool {
        self.registry.add(id, queue)
    }

    /// Create an unbounded queue, register it under `id` and hand back the
    /// receiving end. `None` when the id is taken or the bus is shut down.
    pub fn subscribe(&self, id: &str) -> Option<Receiver<BusMessage>> {
        let (tx, rx) = unbounded();
        self.add_consumer(id, tx).then_some(rx)
    }

    /// Remove a consumer; unknown ids are ignored.
    pub fn del_consumer(&self, id: &str) -> bool {
        self.registry.remove(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop the dispatcher and send the terminator to every registered
    /// consumer. Waits at most one poll interval; calling it again is a no-op.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                tracing::error!("event dispatcher panicked");
                self.registry.close();
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(
    rx: Receiver<Event>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    tracing::debug!("event dispatcher started");
    while !shutdown.load(Ordering::SeqCst) {
        let event = match rx.recv_timeout(poll_interval) {
            Ok(event) => Arc::new(event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        tracing::trace!(kind = event.kind(), "dispatching event");
        registry.fan_out(&event);
    }
    let terminated = registry.close();
    tracing::debug!(consumers = terminated, "event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn bus() -> EventBus {
        EventBus::with_poll_interval(Duration::from_millis(20))
    }

    fn next_event(rx: &Receiver<BusMessage>) -> Event {
        match rx.recv_timeout(WAIT).expect("message expected") {
            BusMessage::Event(event) => (*event).clone(),
            BusMessage::Terminated => panic!("unexpected terminator"),
        }
    }

    #[test]
    fn delivers_in_push_order() {
        let bus = bus();
        let rx = bus.subscribe("cli").expect("fresh id");

        bus.push_event(Event::Play("a".into()));
        bus.push_event(Event::VolSet(40));

        assert_eq!(next_event(&rx), Event::Play("a".into()));
        assert_eq!(next_event(&rx), Event::VolSet(40));
    }

    #[test]
    fn every_consumer_receives_the_same_event() {
        let bus = bus();
        let first = bus.subscribe("first").unwrap();
        let second = bus.subscribe("second").unwrap();

        bus.publisher().publish(Event::IcyName("Radio".into()));

        let a = first.recv_timeout(WAIT).unwrap();
        let b = second.recv_timeout(WAIT).unwrap();
        match (a, b) {
            (BusMessage::Event(a), BusMessage::Event(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_id_keeps_first_registration() {
        let bus = bus();
        let (first_tx, first_rx) = unbounded();
        let (second_tx, second_rx) = unbounded();

        assert!(bus.add_consumer("ws", first_tx));
        assert!(!bus.add_consumer("ws", second_tx));
        assert_eq!(bus.consumer_count(), 1);

        bus.push_event(Event::VolSet(10));
        assert_eq!(next_event(&first_rx), Event::VolSet(10));
        assert!(second_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn removed_consumer_stops_receiving_others_continue() {
        let bus = bus();
        let (gone_tx, gone_rx) = unbounded();
        bus.add_consumer("gone", gone_tx);
        let stays = bus.subscribe("stays").unwrap();

        bus.push_event(Event::VolSet(1));
        assert_eq!(next_event(&gone_rx), Event::VolSet(1));
        assert_eq!(next_event(&stays), Event::VolSet(1));

        assert!(bus.del_consumer("gone"));
        assert!(!bus.del_consumer("unknown"));
        bus.push_event(Event::VolSet(2));

        assert_eq!(next_event(&stays), Event::VolSet(2));
        assert!(gone_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn shutdown_terminates_only_registered_consumers() {
        let bus = bus();
        let kept = bus.subscribe("kept").unwrap();
        let (left_tx, left_rx) = unbounded();
        bus.add_consumer("left", left_tx.clone());
        bus.del_consumer("left");

        bus.shutdown();

        assert_eq!(kept.recv_timeout(WAIT).unwrap(), BusMessage::Terminated);
        assert!(left_rx.try_recv().is_err());
        assert_eq!(bus.consumer_count(), 0);
        drop(left_tx);
    }

    #[test]
    fn registration_after_shutdown_is_ignored() {
        let bus = bus();
        bus.shutdown();
        assert!(bus.subscribe("late").is_none());
        bus.push_event(Event::VolSet(5));
        bus.shutdown();
    }
}
