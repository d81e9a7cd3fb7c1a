//! Ordered delivery of pushed snapshots.
//!
//! Commits enqueue deliveries while holding the subscription registry, so the
//! queue is in commit order. One caller drains at a time; a commit made from
//! inside a callback only enqueues, and the running drain delivers it next.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::binding::Subscriber;
use crate::runtime::lock;

#[derive(Default)]
struct Queue {
    pending: VecDeque<(Arc<Subscriber>, Value)>,
    draining: bool,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    queue: Mutex<Queue>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self, subscriber: Arc<Subscriber>, value: Value) {
        lock(&self.queue).pending.push_back((subscriber, value));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.queue).pending.len()
    }

    /// Deliver everything queued, including what callbacks enqueue meanwhile.
    pub(crate) fn drain(&self) {
        {
            let mut queue = lock(&self.queue);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        let mut guard = Draining {
            dispatcher: self,
            armed: true,
        };

        loop {
            let next = {
                let mut queue = lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(item) => item,
                    None => {
                        // Cleared under the same lock that saw the queue empty
                        queue.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            let (subscriber, value) = next;
            subscriber.deliver(&value);
        }
    }
}

/// Resets the draining flag if a callback panics.
struct Draining<'a> {
    dispatcher: &'a Dispatcher,
    armed: bool,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.dispatcher.queue).draining = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Observed, SubscriptionRegistry};
    use crate::schema::CollectionKind;
    use serde_json::json;

    #[test]
    fn test_drain_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = SubscriptionRegistry::new();
        let sub = registry
            .attach(
                "notes",
                CollectionKind::Sequence,
                Observed::Ready(json!([])),
                Some(Box::new(move |v: &Value| sink.lock().unwrap().push(v.clone()))),
            )
            .unwrap();

        let dispatcher = Dispatcher::new();
        dispatcher.enqueue(sub.clone(), json!([1]));
        dispatcher.enqueue(sub, json!([1, 2]));
        assert_eq!(dispatcher.len(), 2);
        dispatcher.drain();

        assert_eq!(dispatcher.len(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![json!([1]), json!([1, 2])]);
    }

    #[test]
    fn test_panicking_callback_does_not_wedge_queue() {
        let mut registry = SubscriptionRegistry::new();
        let bad = registry
            .attach(
                "notes",
                CollectionKind::Sequence,
                Observed::Ready(json!([])),
                Some(Box::new(|_: &Value| panic!("observer failed"))),
            )
            .unwrap();
        let good = registry
            .attach("title", CollectionKind::Text, Observed::Ready(json!("")), None)
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.enqueue(bad, json!([1]));
        let d = dispatcher.clone();
        assert!(std::thread::spawn(move || d.drain()).join().is_err());

        dispatcher.enqueue(good.clone(), json!("x"));
        dispatcher.drain();
        assert_eq!(dispatcher.len(), 0);
        assert!(good.is_active());
    }
}
