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

//! Message factories.
//!
//! A send operation validates and snapshots its request exactly once into a
//! [Factory], then calls [Factory::instantiate] once per destination. Each
//! instantiation builds a fully independent [Message](crate::Message): its
//! own pool slice, its own translated handles, and its own duplicated files.
//! The sender's handles are pinned when the factory is built, so what gets
//! transferred is what the sender named even if it drops its own handles in
//! the meantime. The factory's vectors, handles, and files are only ever
//! read, so a failed instantiation leaves it ready for the next destination.

use std::{
    io::IoSlice,
    ops::{Deref, DerefMut},
    os::fd::{BorrowedFd, OwnedFd},
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    handle::{Handle, HandleId},
    message::{Message, MessageFlags, MessageParts, MessageRef},
    peer::Peer,
    pool::PoolSlice,
    security::Credentials,
    slots::SlotArray,
};

/// A validated send request. Everything here is borrowed from the sender for
/// the duration of the send operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendParams<'a> {
    pub flags: MessageFlags,
    pub vecs: &'a [IoSlice<'a>],
    pub handles: &'a [HandleId],
    pub files: &'a [BorrowedFd<'a>],
}

/// Caller-provided storage for a factory's pinned handles and file
/// duplicates, reusable across send operations.
#[derive(Debug, Default)]
pub struct FactoryScratch {
    handles: SlotArray<Handle>,
    files: Vec<OwnedFd>,
}

impl FactoryScratch {
    pub fn with_capacity(n_handles: usize, n_files: usize) -> Result<Self> {
        let mut files = Vec::new();
        files.try_reserve_exact(n_files)?;

        Ok(Self {
            handles: SlotArray::with_capacity(n_handles)?,
            files,
        })
    }

    fn fits(&self, n_handles: usize, n_files: usize) -> bool {
        self.handles.allocated() >= n_handles && self.files.capacity() >= n_files
    }

    pub fn is_empty(&self) -> bool {
        self.handles.occupied() == 0 && self.files.is_empty()
    }

    fn reset(&mut self) {
        self.handles.clear();
        self.files.clear();
    }
}

enum Storage<'a> {
    Borrowed(&'a mut FactoryScratch),
    Owned(FactoryScratch),
}

impl Deref for Storage<'_> {
    type Target = FactoryScratch;

    fn deref(&self) -> &FactoryScratch {
        match self {
            Storage::Borrowed(scratch) => scratch,
            Storage::Owned(scratch) => scratch,
        }
    }
}

impl DerefMut for Storage<'_> {
    fn deref_mut(&mut self) -> &mut FactoryScratch {
        match self {
            Storage::Borrowed(scratch) => scratch,
            Storage::Owned(scratch) => scratch,
        }
    }
}

impl Drop for Storage<'_> {
    fn drop(&mut self) {
        // borrowed storage outlives us; only close what we put there
        if let Storage::Borrowed(scratch) = self {
            scratch.reset();
        }
    }
}

pub struct Factory<'a> {
    peer: &'a Arc<Peer>,
    flags: MessageFlags,
    vecs: &'a [IoSlice<'a>],
    creds: Credentials,
    secctx: Option<Box<[u8]>>,
    length_vecs: usize,
    n_vecs: usize,
    n_handles: usize,
    n_files: usize,
    storage: Storage<'a>,
}

impl std::fmt::Debug for Factory<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("peer", &self.peer.id())
            .field("flags", &self.flags)
            .field("length_vecs", &self.length_vecs)
            .field("n_vecs", &self.n_vecs)
            .field("n_handles", &self.n_handles)
            .field("n_files", &self.n_files)
            .field("n_secctx", &self.n_secctx())
            .field("on_stack", &self.on_stack())
            .finish()
    }
}

fn align8(n: usize) -> Option<usize> {
    n.checked_add(7).map(|n| n & !7)
}

impl<'a> Factory<'a> {
    /// Validates `params` against the bus limits and snapshots the request.
    ///
    /// File descriptors are duplicated immediately, so the sender closing
    /// its own descriptors cannot affect the transfer. If `scratch` has room
    /// for the request it is used instead of a fresh allocation, and it is
    /// reset when the factory is dropped.
    pub fn new(
        peer: &'a Arc<Peer>,
        params: &SendParams<'a>,
        scratch: Option<&'a mut FactoryScratch>,
    ) -> Result<Self> {
        let limits = peer.bus().config().limits;

        let n_vecs = params.vecs.len();
        let n_handles = params.handles.len();
        let n_files = params.files.len();

        if n_vecs > limits.max_vecs || n_handles > limits.max_handles || n_files > limits.max_files
        {
            return Err(Error::InvalidArgument);
        }

        let length_vecs = params
            .vecs
            .iter()
            .try_fold(0usize, |total, vec| total.checked_add(vec.len()))
            .filter(|total| *total <= limits.max_bytes)
            .ok_or(Error::InvalidArgument)?;

        let mut storage = match scratch {
            Some(scratch) if scratch.fits(n_handles, n_files) => Storage::Borrowed(scratch),
            _ => Storage::Owned(FactoryScratch::with_capacity(n_handles, n_files)?),
        };

        storage.handles.reset(n_handles)?;
        for (index, id) in params.handles.iter().enumerate() {
            let handle = Handle::lookup(peer, *id).ok_or(Error::InvalidArgument)?;
            storage.handles.set(index, handle);
        }

        storage.files.clear();
        for file in params.files {
            let file = file
                .try_clone_to_owned()
                .map_err(|_| Error::ResourceExhausted)?;
            storage.files.push(file);
        }

        let security = peer.bus().security();
        let creds = security.credentials()?;
        let secctx = security.label()?;

        if let Some(secctx) = &secctx {
            u32::try_from(secctx.len()).map_err(|_| Error::InvalidArgument)?;
        }

        let factory = Self {
            peer,
            flags: params.flags,
            vecs: params.vecs,
            creds,
            secctx,
            length_vecs,
            n_vecs,
            n_handles,
            n_files,
            storage,
        };

        tracing::debug!(
            peer = peer.id(),
            n_vecs,
            length_vecs,
            n_handles,
            n_files,
            on_stack = factory.on_stack(),
            has_secctx = factory.has_secctx(),
            "factory created"
        );

        Ok(factory)
    }

    /// Builds the message for one destination.
    ///
    /// `dst` is the destination's own handle to the addressed node; the
    /// message keeps a reference to it. Every resource acquired here is
    /// released again if any step fails.
    pub fn instantiate(&self, dst: &Handle) -> Result<MessageRef> {
        let target = dst.holder().ok_or(Error::Shutdown)?;

        let n_secctx = self.n_secctx() as usize;
        let secctx_offset = if n_secctx > 0 {
            align8(self.length_vecs).ok_or(Error::InvalidArgument)?
        } else {
            self.length_vecs
        };

        let size = secctx_offset
            .checked_add(n_secctx)
            .ok_or(Error::InvalidArgument)?;

        let slice = PoolSlice::reserve(target.pool(), size)?;

        let mut offset = 0;
        for vec in self.vecs {
            slice.write(offset, vec)?;
            offset += vec.len();
        }

        if let Some(secctx) = &self.secctx {
            slice.write(secctx_offset, secctx)?;
        }

        let translator = self.peer.bus().translator();
        let mut handles = SlotArray::with_capacity(self.n_handles)?;
        for (index, handle) in self.storage.handles.iter().enumerate() {
            if let Some(handle) = handle {
                handles.set(index, translator.translate(self.peer, &target, handle)?);
            }
        }

        let mut files = Vec::new();
        files.try_reserve_exact(self.n_files)?;
        for file in &self.storage.files {
            files.push(file.try_clone().map_err(|_| Error::ResourceExhausted)?);
        }

        let message = Message::new(MessageParts {
            flags: self.flags,
            creds: self.creds,
            n_bytes: self.length_vecs,
            n_secctx,
            slice,
            files,
            handles,
            dst: dst.clone(),
            user: self.peer.user().clone(),
        });

        tracing::debug!(
            src = self.peer.id(),
            dst = target.id(),
            n_bytes = self.length_vecs,
            n_handles = self.n_handles,
            n_files = self.n_files,
            "message instantiated"
        );

        Ok(message)
    }

    pub fn peer(&self) -> &Arc<Peer> {
        self.peer
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    /// Whether the caller's scratch storage is in use.
    pub fn on_stack(&self) -> bool {
        matches!(self.storage, Storage::Borrowed(_))
    }

    pub fn has_secctx(&self) -> bool {
        self.secctx.is_some()
    }

    pub fn secctx(&self) -> Option<&[u8]> {
        self.secctx.as_deref()
    }

    pub fn n_secctx(&self) -> u32 {
        // checked against u32::MAX in new()
        self.secctx.as_ref().map_or(0, |secctx| secctx.len() as u32)
    }

    pub fn length_vecs(&self) -> usize {
        self.length_vecs
    }

    pub fn n_vecs(&self) -> usize {
        self.n_vecs
    }

    pub fn n_handles(&self) -> usize {
        self.n_handles
    }

    pub fn n_files(&self) -> usize {
        self.n_files
    }

    pub fn vecs(&self) -> &[IoSlice<'a>] {
        self.vecs
    }

    pub fn handles(&self) -> impl Iterator<Item = &Handle> + '_ {
        self.storage.handles.iter_occupied()
    }

    pub fn handle_ids(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.handles().map(Handle::id)
    }

    pub fn files(&self) -> &[OwnedFd] {
        &self.storage.files
    }
}

impl Drop for Factory<'_> {
    fn drop(&mut self) {
        tracing::trace!(peer = self.peer.id(), "factory destroyed");
    }
}
