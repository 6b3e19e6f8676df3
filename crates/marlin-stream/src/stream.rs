//! The stream object: append discipline, range scans, subscriptions.
//!
//! A stream owns a radix trie of entries, the most recent entry, and a
//! table of live subscribers, all behind one readers-writer lock. Appends
//! take the lock exclusively; lookups and range scans take it shared.
//! Delivery to subscribers happens after the writer lock is released, from
//! a snapshot of the subscriber table, with a non-blocking send per
//! subscriber. A slow or gone subscriber loses deliveries instead of
//! stalling the writer.

use crate::keys::EntryId;
use crate::node::{Entry, RadixNode};
use marlin_common::{MarlinError, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// A delivered append, tagged with the subscription it was sent to.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription_id: u64,
    pub entry: Entry,
}

/// One registered subscriber slot.
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Delivery>,
}

struct StreamInner {
    root: RadixNode,
    /// The greatest entry present, or the MIN-keyed sentinel when empty.
    last: Entry,
    /// Slot table: unsubscribing tombstones a slot, it is never compacted.
    subs: Vec<Option<Subscriber>>,
}

/// An append-only stream of id-ordered entries.
pub struct Stream {
    inner: RwLock<StreamInner>,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StreamInner {
                root: RadixNode::default(),
                last: Entry::sentinel(),
                subs: Vec::new(),
            }),
        }
    }

    /// Appends an entry.
    ///
    /// The id must be strictly greater than the stream's most recent id,
    /// and `0-0` can never be stored. On success every live subscriber is
    /// offered the new entry.
    pub fn put(&self, id: EntryId, fields: Vec<(String, String)>) -> Result<()> {
        if id.is_min() {
            return Err(MarlinError::EntryIdZero);
        }

        let entry = Entry::new(id, fields);
        let receivers: Vec<(u64, mpsc::Sender<Delivery>)> = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            if id <= inner.last.id {
                return Err(MarlinError::EntryIdTooSmall);
            }
            inner.root.create(&id.internal()).set_entry(entry.clone());
            inner.last = entry.clone();
            inner
                .subs
                .iter()
                .flatten()
                .map(|sub| (sub.id, sub.tx.clone()))
                .collect()
        };

        // Deliver outside the writer lock. A full or closed channel means
        // the subscriber was not keeping up or is gone; skip it.
        for (subscription_id, tx) in receivers {
            let _ = tx.try_send(Delivery {
                subscription_id,
                entry: entry.clone(),
            });
        }
        Ok(())
    }

    /// Returns the entry stored under `id`, if present.
    pub fn search(&self, id: EntryId) -> Option<Entry> {
        self.inner.read().root.search(&id.internal()).cloned()
    }

    /// Returns all entries with ids in `[from, to]`, ascending.
    ///
    /// An inverted range is empty. The scan observes a consistent snapshot
    /// of the stream as of some point while the shared lock is held.
    pub fn range(&self, from: EntryId, to: EntryId) -> Vec<Entry> {
        if from > to {
            return Vec::new();
        }
        let inner = self.inner.read();
        if to.is_max() {
            // An upper bound of MAX is an open-ended tail scan.
            inner.root.higher_entries(&from.internal())
        } else {
            inner.root.range_entries(&from.internal(), &to.internal())
        }
    }

    /// Returns the most recent entry, or the MIN-keyed sentinel when the
    /// stream is empty.
    pub fn last(&self) -> Entry {
        self.inner.read().last.clone()
    }

    /// Returns the most recent entry id, or MIN when the stream is empty.
    pub fn last_id(&self) -> EntryId {
        self.inner.read().last.id
    }

    /// Returns true if the stream holds no entries.
    pub fn is_empty(&self) -> bool {
        self.last_id().is_min()
    }

    /// Registers `tx` to receive every future append, tagged with
    /// `subscription_id`. Deliveries are at-most-once per append: a send
    /// that would block is dropped.
    pub fn subscribe(&self, tx: mpsc::Sender<Delivery>, subscription_id: u64) {
        self.inner.write().subs.push(Some(Subscriber {
            id: subscription_id,
            tx,
        }));
    }

    /// Removes every slot registered for `tx`. Unsubscribing a channel that
    /// was never registered, or twice, has no effect.
    pub fn unsubscribe(&self, tx: &mpsc::Sender<Delivery>) {
        let mut inner = self.inner.write();
        for slot in inner.subs.iter_mut() {
            if slot.as_ref().is_some_and(|sub| sub.tx.same_channel(tx)) {
                *slot = None;
            }
        }
    }

    /// Blocks until the next entry is appended and returns it.
    ///
    /// Subscribes a fresh capacity-1 channel, awaits the first delivery,
    /// and unsubscribes before returning.
    pub async fn wait_for_entry(&self, subscription_id: u64) -> Entry {
        let (tx, mut rx) = mpsc::channel(1);
        self.subscribe(tx.clone(), subscription_id);
        let delivery = rx
            .recv()
            .await
            .expect("channel stays open while the subscriber table holds a sender");
        self.unsubscribe(&tx);
        delivery.entry
    }
}
