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

//! Messages.
//!
//! A [Message] is built once by [Factory::instantiate](crate::Factory::instantiate)
//! and is immutable afterwards, apart from its reference count and its queue
//! linkage. It may be owned concurrently by the sender, a destination's
//! receive queue, and whatever is delivering or cancelling it; the last
//! [MessageRef] to go away tears it down.

use std::{ops::Deref, os::fd::OwnedFd, sync::Arc};

use crate::{
    error::Result,
    handle::Handle,
    peer::{Charge, User},
    pool::PoolSlice,
    queue::QueueNode,
    security::Credentials,
    slots::SlotArray,
};

bitflags::bitflags! {
    /// Send flags. The core carries them unchanged; only delivery policy
    /// interprets them.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u64 {
        /// More messages of the same transaction follow.
        const CONTINUE = 1 << 0;
        /// The message replaces the destination's seed message.
        const SEED = 1 << 1;

        const _ = !0;
    }
}

pub(crate) struct MessageParts {
    pub flags: MessageFlags,
    pub creds: Credentials,
    pub n_bytes: usize,
    pub n_secctx: usize,
    pub slice: PoolSlice,
    pub files: Vec<OwnedFd>,
    pub handles: SlotArray<Handle>,
    pub dst: Handle,
    pub user: Arc<User>,
}

pub struct Message {
    flags: MessageFlags,
    creds: Credentials,
    n_bytes: usize,
    n_secctx: usize,
    qnode: QueueNode,

    // dropped in declaration order
    slice: PoolSlice,
    files: Vec<OwnedFd>,
    handles: SlotArray<Handle>,
    dst: Handle,
    user: Charge,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("flags", &self.flags)
            .field("creds", &self.creds)
            .field("dst", &self.dst)
            .field("n_bytes", &self.n_bytes)
            .field("n_handles", &self.handles.len())
            .field("n_files", &self.files.len())
            .field("n_secctx", &self.n_secctx)
            .finish()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        debug_assert!(
            !self.qnode.is_linked(),
            "message released while still queued"
        );

        tracing::debug!(
            n_bytes = self.n_bytes,
            n_handles = self.handles.occupied(),
            n_files = self.files.len(),
            "message released"
        );
    }
}

impl Message {
    /// Charges `parts.user` and wraps the message in its first reference.
    pub(crate) fn new(parts: MessageParts) -> MessageRef {
        MessageRef(Arc::new(Self {
            flags: parts.flags,
            creds: parts.creds,
            n_bytes: parts.n_bytes,
            n_secctx: parts.n_secctx,
            qnode: QueueNode::default(),
            slice: parts.slice,
            files: parts.files,
            handles: parts.handles,
            dst: parts.dst,
            user: Charge::new(parts.user),
        }))
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn uid(&self) -> u32 {
        self.creds.uid
    }

    pub fn gid(&self) -> u32 {
        self.creds.gid
    }

    pub fn pid(&self) -> i32 {
        self.creds.pid
    }

    pub fn tid(&self) -> i32 {
        self.creds.tid
    }

    pub fn dst(&self) -> &Handle {
        &self.dst
    }

    pub fn user(&self) -> &Arc<User> {
        self.user.user()
    }

    pub fn slice(&self) -> &PoolSlice {
        &self.slice
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn n_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn n_files(&self) -> usize {
        self.files.len()
    }

    pub fn n_secctx(&self) -> usize {
        self.n_secctx
    }

    pub fn handles(&self) -> &SlotArray<Handle> {
        &self.handles
    }

    pub fn files(&self) -> &[OwnedFd] {
        &self.files
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        self.slice.read_vec(0, self.n_bytes)
    }

    /// Copies the security label out of the pool, if one was attached.
    pub fn secctx(&self) -> Result<Option<Vec<u8>>> {
        if self.n_secctx == 0 {
            return Ok(None);
        }

        let offset = self.slice.len() - self.n_secctx;
        self.slice.read_vec(offset, self.n_secctx).map(Some)
    }

    pub fn is_queued(&self) -> bool {
        self.qnode.is_linked()
    }

    pub(crate) fn qnode(&self) -> &QueueNode {
        &self.qnode
    }
}

/// A counted reference to a [Message].
///
/// The reference count is atomic, so references may be acquired and released
/// from any thread. The message must be unlinked from its receive queue before
/// the last reference goes away; a queue always holds its own reference, so
/// this holds as long as references are only dropped outside the queue.
pub struct MessageRef(Arc<Message>);

impl std::fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Clone for MessageRef {
    fn clone(&self) -> Self {
        tracing::trace!(refs = self.ref_count() + 1, "message acquired");
        Self(self.0.clone())
    }
}

impl Deref for MessageRef {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

impl MessageRef {
    pub fn acquire(&self) -> MessageRef {
        self.clone()
    }

    /// Drops this reference, tearing the message down if it was the last.
    pub fn release(self) {
        drop(self);
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &MessageRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Acquires a reference on `message`, if there is one.
pub fn acquire(message: Option<&MessageRef>) -> Option<MessageRef> {
    message.map(MessageRef::acquire)
}

/// Releases `message`, if there is one. Always returns `None`.
pub fn release(message: Option<MessageRef>) -> Option<MessageRef> {
    if let Some(message) = message {
        message.release();
    }

    None
}
