// Copyright (c) 2023 Marceline Cramer
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Capbus.
//
// Capbus is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Capbus is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Capbus. If not, see <https://www.gnu.org/licenses/>.

//! Receive queues.
//!
//! A queue keeps its messages in a slab, ordered by a per-link sequence
//! number. A single-slot channel serves as the doorbell for async receivers.
//! The message only records a non-owning `(queue, key, seq)` link back to the
//! queue, so a message is in at most one queue at a time and the queue's own
//! reference keeps it alive while linked.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use slab::Slab;

use crate::{
    error::{Error, Result},
    message::MessageRef,
};

pub type QueueId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QueueLink {
    queue: QueueId,
    key: usize,
    seq: u64,
}

/// The linkage a message carries for the queue it is in.
#[derive(Debug, Default)]
pub struct QueueNode {
    link: Mutex<Option<QueueLink>>,
}

impl QueueNode {
    pub fn is_linked(&self) -> bool {
        self.link.lock().is_some()
    }
}

#[derive(Default)]
struct QueueInner {
    entries: Slab<(u64, MessageRef)>,
    order: BTreeMap<u64, usize>,
    next_seq: u64,
}

pub struct ReceiveQueue {
    id: QueueId,
    inner: Mutex<QueueInner>,
    bell_tx: flume::Sender<()>,
    bell_rx: flume::Receiver<()>,
}

impl std::fmt::Debug for ReceiveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for ReceiveQueue {
    fn drop(&mut self) {
        for (_, message) in self.inner.get_mut().entries.drain() {
            *message.qnode().link.lock() = None;
        }
    }
}

impl ReceiveQueue {
    pub(crate) fn new(id: QueueId) -> Self {
        let (bell_tx, bell_rx) = flume::bounded(1);

        Self {
            id,
            inner: Mutex::new(QueueInner::default()),
            bell_tx,
            bell_rx,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Links `message` at the tail, taking a reference for the queue.
    ///
    /// Fails with [InvalidArgument](crate::Error::InvalidArgument) if the
    /// message is already linked into any queue.
    pub fn link(&self, message: &MessageRef) -> Result<()> {
        let mut node = message.qnode().link.lock();
        if node.is_some() {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let key = inner.entries.insert((seq, message.acquire()));
        inner.order.insert(seq, key);

        *node = Some(QueueLink {
            queue: self.id,
            key,
            seq,
        });

        self.ring();

        tracing::trace!(queue = self.id, key, seq, "message linked");
        Ok(())
    }

    /// Removes `message` from this queue before it is received, returning the
    /// queue's reference. Returns `None` if it is not linked here.
    pub fn unlink(&self, message: &MessageRef) -> Option<MessageRef> {
        let mut node = message.qnode().link.lock();
        let link = (*node)?;
        if link.queue != self.id {
            return None;
        }

        let mut inner = self.inner.lock();
        match inner.entries.get(link.key) {
            Some((seq, _)) if *seq == link.seq => {}
            _ => return None,
        }

        let (_, queued) = inner.entries.remove(link.key);
        inner.order.remove(&link.seq);
        *node = None;

        tracing::trace!(queue = self.id, key = link.key, "message unlinked");
        Some(queued)
    }

    /// Pops the head of the queue without waiting.
    pub fn try_recv(&self) -> Option<MessageRef> {
        let (link, message) = {
            let mut inner = self.inner.lock();
            let (seq, key) = inner.order.pop_first()?;
            let (_, message) = inner.entries.remove(key);

            // pass the wakeup on to the next waiter
            if !inner.order.is_empty() {
                self.ring();
            }

            let link = QueueLink {
                queue: self.id,
                key,
                seq,
            };

            (link, message)
        };

        let mut node = message.qnode().link.lock();
        if *node == Some(link) {
            *node = None;
        }

        drop(node);
        Some(message)
    }

    /// Waits for and pops the head of the queue.
    pub async fn recv(&self) -> Option<MessageRef> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }

            self.bell_rx.recv_async().await.ok()?;
        }
    }

    fn ring(&self) {
        // a full bell already has a wakeup pending
        let _ = self.bell_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use std::{io::IoSlice, sync::Arc};

    use super::*;
    use crate::{
        factory::{Factory, SendParams},
        handle::Handle,
        peer::{Bus, Peer, User},
        Config,
    };

    struct Env {
        bus: Arc<Bus>,
        sender: Arc<Peer>,
        receiver: Arc<Peer>,
        dst: Handle,
    }

    fn env() -> Env {
        let bus = Bus::new(Config::default());
        let user = User::new(1000);
        let receiver = bus.create_peer(&user);
        Env {
            sender: bus.create_peer(&user),
            dst: receiver.create_node(),
            receiver,
            bus,
        }
    }

    fn message(env: &Env, payload: &[u8]) -> MessageRef {
        let vecs = [IoSlice::new(payload)];
        let params = SendParams {
            vecs: &vecs,
            ..Default::default()
        };

        let factory = Factory::new(&env.sender, &params, None).unwrap();
        factory.instantiate(&env.dst).unwrap()
    }

    #[test]
    fn fifo_order() {
        let env = env();
        let queue = env.receiver.queue();

        for payload in [&b"one"[..], b"two", b"three"] {
            let m = message(&env, payload);
            queue.link(&m).unwrap();
            assert!(m.is_queued());
            assert_eq!(m.ref_count(), 2);
        }

        assert_eq!(queue.len(), 3);
        for expected in [&b"one"[..], b"two", b"three"] {
            let m = queue.try_recv().unwrap();
            assert!(!m.is_queued());
            assert_eq!(m.ref_count(), 1);
            assert_eq!(m.payload().unwrap(), expected);
        }

        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn one_queue_at_a_time() {
        let env = env();
        let m = message(&env, b"x");
        let other = ReceiveQueue::new(env.bus.next_id());

        env.receiver.queue().link(&m).unwrap();
        assert_eq!(other.link(&m), Err(Error::InvalidArgument));
        assert_eq!(env.receiver.queue().link(&m), Err(Error::InvalidArgument));
        assert_eq!(m.ref_count(), 2);

        assert!(other.unlink(&m).is_none());
        let queued = env.receiver.queue().unlink(&m).unwrap();
        assert!(queued.ptr_eq(&m));
        drop(queued);

        other.link(&m).unwrap();
        assert!(other.try_recv().unwrap().ptr_eq(&m));
    }

    #[test]
    fn unlink_cancels_delivery() {
        let env = env();
        let queue = env.receiver.queue();
        let first = message(&env, b"first");
        let second = message(&env, b"second");

        queue.link(&first).unwrap();
        queue.link(&second).unwrap();
        queue.unlink(&first).unwrap().release();

        assert!(!first.is_queued());
        assert_eq!(first.ref_count(), 1);
        assert!(queue.unlink(&first).is_none());

        let received = queue.try_recv().unwrap();
        assert!(received.ptr_eq(&second));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn relink_after_unlink_keeps_order() {
        let env = env();
        let queue = env.receiver.queue();
        let a = message(&env, b"a");
        let b = message(&env, b"b");

        queue.link(&a).unwrap();
        queue.unlink(&a).unwrap();
        queue.link(&b).unwrap();
        queue.link(&a).unwrap();

        assert!(queue.try_recv().unwrap().ptr_eq(&b));
        assert!(queue.try_recv().unwrap().ptr_eq(&a));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn unlink_churn_leaves_no_backlog() {
        let env = env();
        let queue = env.receiver.queue();
        let m = message(&env, b"churn");

        for _ in 0..10_000 {
            queue.link(&m).unwrap();
            queue.unlink(&m).unwrap();
        }

        let inner = queue.inner.lock();
        assert!(inner.entries.is_empty());
        assert!(inner.order.is_empty());
        assert!(queue.bell_rx.len() <= 1);
        drop(inner);

        assert!(queue.try_recv().is_none());
        assert_eq!(m.ref_count(), 1);
    }

    #[tokio::test]
    async fn every_waiter_is_woken() {
        let env = env();
        let queue = env.receiver.queue();
        let a = message(&env, b"a");
        let b = message(&env, b"b");
        queue.link(&a).unwrap();
        queue.link(&b).unwrap();

        let (first, second) = tokio::join!(queue.recv(), queue.recv());
        assert!(first.unwrap().ptr_eq(&a));
        assert!(second.unwrap().ptr_eq(&b));
        assert!(queue.is_empty());
    }

    #[test]
    fn dropping_queue_unlinks() {
        let env = env();
        let m = message(&env, b"x");
        let queue = ReceiveQueue::new(env.bus.next_id());
        queue.link(&m).unwrap();
        drop(queue);

        assert!(!m.is_queued());
        assert_eq!(m.ref_count(), 1);
    }

    #[tokio::test]
    async fn recv_pops_linked() {
        let env = env();
        let m = message(&env, b"later");

        let queue = env.receiver.queue();
        queue.link(&m).unwrap();
        drop(m);

        let received = queue.recv().await.unwrap();
        assert_eq!(received.payload().unwrap(), b"later");
        assert!(queue.is_empty());
    }
}
