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

//! Capabilities, per-peer handle tables, and handle translation.
//!
//! A [Node] is an object owned by one peer. A [Capability] grants some
//! [Permissions] on a node, and every peer keeps the capabilities it holds in
//! its own [HandleTable], addressed by peer-local [HandleId]s. Ids only mean
//! something relative to one table, so transferring a handle through a
//! message means translating it into an entry of the destination's table.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use slab::Slab;

use crate::{
    error::{Error, Result},
    peer::Peer,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Messages may be addressed to the node.
        const SEND = 1 << 0;
        /// The handle may be passed along inside a message.
        const TRANSFER = 1 << 1;
    }
}

pub type NodeId = u64;

pub type HandleId = usize;

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    owner: Weak<Peer>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Node {
    pub(crate) fn new(id: NodeId, owner: &Arc<Peer>) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner: Arc::downgrade(owner),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn owner(&self) -> Option<Arc<Peer>> {
        self.owner.upgrade()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Capability {
    pub node: Arc<Node>,
    pub perms: Permissions,
}

#[derive(Debug)]
struct TableEntry {
    cap: Capability,
    refs: usize,
}

#[derive(Default)]
struct TableInner {
    entries: Slab<TableEntry>,
    reverse_entries: HashMap<Capability, usize>,
}

/// Refcounted capability entries of one peer. Identical capabilities share
/// one entry.
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    fn insert(&self, cap: Capability) -> HandleId {
        use std::collections::hash_map::Entry;
        let mut inner = self.inner.lock();
        let TableInner {
            entries,
            reverse_entries,
        } = &mut *inner;

        match reverse_entries.entry(cap) {
            Entry::Occupied(handle) => {
                let handle = *handle.get();
                entries[handle].refs += 1;
                handle
            }
            Entry::Vacant(reverse_entry) => {
                let cap = reverse_entry.key().clone();
                let handle = entries.insert(TableEntry { cap, refs: 1 });
                reverse_entry.insert(handle);
                handle
            }
        }
    }

    fn inc_ref(&self, handle: HandleId) {
        if let Some(entry) = self.inner.lock().entries.get_mut(handle) {
            entry.refs += 1;
        }
    }

    fn acquire(&self, handle: HandleId) -> Option<Capability> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(handle)?;
        entry.refs += 1;
        Some(entry.cap.clone())
    }

    fn dec_ref(&self, handle: HandleId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(handle) else {
            return;
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = inner.entries.remove(handle);
            inner.reverse_entries.remove(&entry.cap);
        }
    }

    pub fn get(&self, handle: HandleId) -> Option<Capability> {
        let inner = self.inner.lock();
        inner.entries.get(handle).map(|entry| entry.cap.clone())
    }

    pub fn is_valid(&self, handle: HandleId) -> bool {
        self.inner.lock().entries.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total references held on `handle`, zero if it does not exist.
    pub fn refs(&self, handle: HandleId) -> usize {
        let inner = self.inner.lock();
        inner.entries.get(handle).map_or(0, |entry| entry.refs)
    }
}

/// An owned reference to an entry of some peer's handle table.
///
/// Cloning takes another reference on the entry. Dropping the last
/// reference frees the entry.
pub struct Handle {
    holder: Weak<Peer>,
    table: Arc<HandleTable>,
    id: HandleId,
    cap: Capability,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("node", &self.cap.node.id)
            .field("perms", &self.cap.perms)
            .finish()
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.table.inc_ref(self.id);

        Self {
            holder: self.holder.clone(),
            table: self.table.clone(),
            id: self.id,
            cap: self.cap.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.table.dec_ref(self.id);
    }
}

impl Handle {
    /// Inserts `cap` into the table of `holder`.
    pub(crate) fn insert(holder: &Arc<Peer>, cap: Capability) -> Self {
        let table = holder.handles().clone();
        let id = table.insert(cap.clone());

        Self {
            holder: Arc::downgrade(holder),
            table,
            id,
            cap,
        }
    }

    /// Takes a new reference on entry `id` of `holder`'s table.
    pub fn lookup(holder: &Arc<Peer>, id: HandleId) -> Option<Self> {
        let table = holder.handles().clone();
        let cap = table.acquire(id)?;

        Some(Self {
            holder: Arc::downgrade(holder),
            table,
            id,
            cap,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn capability(&self) -> &Capability {
        &self.cap
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.cap.node
    }

    pub fn perms(&self) -> Permissions {
        self.cap.perms
    }

    pub fn holder(&self) -> Option<Arc<Peer>> {
        self.holder.upgrade()
    }

    /// Returns a handle in the same table with a subset of this handle's
    /// permissions.
    pub fn demote(&self, perms: Permissions) -> Result<Handle> {
        if !self.cap.perms.contains(perms) {
            return Err(Error::PermissionDenied);
        }

        let cap = Capability {
            node: self.cap.node.clone(),
            perms,
        };

        let id = self.table.insert(cap.clone());

        Ok(Self {
            holder: self.holder.clone(),
            table: self.table.clone(),
            id,
            cap,
        })
    }
}

/// Maps a handle held by the sender to a handle held by the destination.
///
/// Translation is synchronous and must not block.
pub trait Translator: Send + Sync {
    fn translate(&self, src: &Arc<Peer>, dst: &Arc<Peer>, handle: &Handle) -> Result<Handle>;
}

/// Copies the capability of a sender's handle into the destination table.
/// The capability must carry [Permissions::TRANSFER].
#[derive(Clone, Copy, Debug, Default)]
pub struct TableTranslator;

impl Translator for TableTranslator {
    fn translate(&self, src: &Arc<Peer>, dst: &Arc<Peer>, handle: &Handle) -> Result<Handle> {
        if !Arc::ptr_eq(&handle.table, src.handles()) {
            return Err(Error::PermissionDenied);
        }

        if !handle.perms().contains(Permissions::TRANSFER) {
            return Err(Error::PermissionDenied);
        }

        Ok(Handle::insert(dst, handle.cap.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Bus, User};
    use crate::Config;

    fn peers() -> (Arc<Peer>, Arc<Peer>) {
        let bus = Bus::new(Config::default());
        let user = User::new(1000);
        (bus.create_peer(&user), bus.create_peer(&user))
    }

    #[test]
    fn dropped_handles_are_freed() {
        let (peer, _) = peers();
        let node = peer.create_node();
        let id = node.id();
        assert!(peer.handles().is_valid(id));
        drop(node);
        assert!(!peer.handles().is_valid(id));
        assert!(peer.handles().is_empty());
    }

    #[test]
    fn clones_share_entry() {
        let (peer, _) = peers();
        let node = peer.create_node();
        let copy = node.clone();
        assert_eq!(copy.id(), node.id());
        assert_eq!(peer.handles().refs(node.id()), 2);
        drop(node);
        assert!(peer.handles().is_valid(copy.id()));
        assert_eq!(peer.handles().refs(copy.id()), 1);
    }

    #[test]
    fn identical_capabilities_dedup() {
        let (a, b) = peers();
        let node = a.create_node();
        let first = b.import(&node, Permissions::SEND).unwrap();
        let second = b.import(&node, Permissions::SEND).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(b.handles().len(), 1);

        let other = b.import(&node, Permissions::TRANSFER).unwrap();
        assert_ne!(other.id(), first.id());
        assert_eq!(b.handles().len(), 2);
    }

    #[test]
    fn deny_demote_escalation() {
        let (peer, _) = peers();
        let node = peer.create_node();
        let send = node.demote(Permissions::SEND).unwrap();
        assert_eq!(send.perms(), Permissions::SEND);
        assert_eq!(
            send.demote(Permissions::TRANSFER).unwrap_err(),
            Error::PermissionDenied
        );
    }

    #[test]
    fn translate_copies_capability() {
        let (a, b) = peers();
        let node = a.create_node();

        let translated = TableTranslator.translate(&a, &b, &node).unwrap();
        assert_eq!(translated.node(), node.node());
        assert_eq!(translated.perms(), node.perms());
        assert!(Arc::ptr_eq(&translated.holder().unwrap(), &b));
        assert!(b.handles().is_valid(translated.id()));

        drop(translated);
        assert!(b.handles().is_empty());
    }

    #[test]
    fn translate_requires_transfer() {
        let (a, b) = peers();
        let node = a.create_node();
        let send_only = node.demote(Permissions::SEND).unwrap();
        let result = TableTranslator.translate(&a, &b, &send_only);
        assert_eq!(result.unwrap_err(), Error::PermissionDenied);
        assert!(b.handles().is_empty());
    }

    #[test]
    fn translate_foreign_handle() {
        let (a, b) = peers();
        let node = b.create_node();
        let result = TableTranslator.translate(&a, &b, &node);
        assert_eq!(result.unwrap_err(), Error::PermissionDenied);
        assert_eq!(b.handles().len(), 1);
    }

    #[test]
    fn lookup_takes_reference() {
        let (peer, _) = peers();
        let node = peer.create_node();
        let found = Handle::lookup(&peer, node.id()).unwrap();
        assert_eq!(found.capability(), node.capability());
        assert_eq!(peer.handles().refs(node.id()), 2);

        drop(node);
        assert!(peer.handles().is_valid(found.id()));
        assert!(Handle::lookup(&peer, 42).is_none());
    }

    #[test]
    fn holder_gone() {
        let (a, b) = peers();
        let node = a.create_node();
        let imported = b.import(&node, Permissions::SEND).unwrap();
        drop(b);
        assert!(imported.holder().is_none());
        assert_eq!(imported.node().owner().map(|p| p.id()), Some(a.id()));
    }
}
