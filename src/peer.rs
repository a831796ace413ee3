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

//! Peers and the shared bus environment.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    config::Config,
    error::{Error, Result},
    factory::{Factory, FactoryScratch, SendParams},
    handle::{
        Capability, Handle, HandleId, HandleTable, Node, Permissions, TableTranslator, Translator,
    },
    pool::{MemoryPool, Pool},
    queue::ReceiveQueue,
    security::{Security, TaskSecurity},
};

/// State shared by every peer of one bus: configuration, the credential and
/// translation providers, and id allocation.
pub struct Bus {
    config: Config,
    security: Arc<dyn Security>,
    translator: Arc<dyn Translator>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_providers(config, Arc::new(TaskSecurity), Arc::new(TableTranslator))
    }

    pub fn with_providers(
        config: Config,
        security: Arc<dyn Security>,
        translator: Arc<dyn Translator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            security,
            translator,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn security(&self) -> &Arc<dyn Security> {
        &self.security
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.translator
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a peer with a [MemoryPool] of the configured size.
    pub fn create_peer(self: &Arc<Self>, user: &Arc<User>) -> Arc<Peer> {
        self.create_peer_with_pool(user, MemoryPool::new(self.config.pool_size))
    }

    pub fn create_peer_with_pool(
        self: &Arc<Self>,
        user: &Arc<User>,
        pool: Arc<dyn Pool>,
    ) -> Arc<Peer> {
        let id = self.next_id();
        tracing::debug!(peer = id, uid = user.uid(), "peer created");

        Arc::new(Peer {
            id,
            bus: self.clone(),
            user: user.clone(),
            pool,
            handles: Arc::new(HandleTable::default()),
            queue: ReceiveQueue::new(id),
        })
    }
}

/// The accounting principal charged for messages.
#[derive(Debug)]
pub struct User {
    uid: u32,
    messages: AtomicUsize,
}

impl User {
    pub fn new(uid: u32) -> Arc<Self> {
        Arc::new(Self {
            uid,
            messages: AtomicUsize::new(0),
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::Acquire)
    }

    fn charge(&self) {
        self.messages.fetch_add(1, Ordering::AcqRel);
    }

    fn uncharge(&self) {
        self.messages.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One message's charge against a [User], returned when dropped.
#[derive(Debug)]
pub(crate) struct Charge(Arc<User>);

impl Charge {
    pub(crate) fn new(user: Arc<User>) -> Self {
        user.charge();
        Self(user)
    }

    pub(crate) fn user(&self) -> &Arc<User> {
        &self.0
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.0.uncharge();
    }
}

pub type PeerId = u64;

pub struct Peer {
    id: PeerId,
    bus: Arc<Bus>,
    user: Arc<User>,
    pool: Arc<dyn Pool>,
    handles: Arc<HandleTable>,
    queue: ReceiveQueue,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("uid", &self.user.uid)
            .finish_non_exhaustive()
    }
}

/// Per-destination outcome of [Peer::send], in destination order.
#[derive(Debug)]
pub struct SendReport {
    pub results: Vec<Result<()>>,
}

impl SendReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|result| result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn queue(&self) -> &ReceiveQueue {
        &self.queue
    }

    /// Creates a node owned by this peer and returns the owner's handle to
    /// it, carrying every permission.
    pub fn create_node(self: &Arc<Self>) -> Handle {
        let node = Node::new(self.bus.next_id(), self);
        tracing::trace!(peer = self.id, node = node.id(), "node created");

        Handle::insert(
            self,
            Capability {
                node,
                perms: Permissions::all(),
            },
        )
    }

    /// Gives this peer a handle to the node behind `handle`, restricted to
    /// `perms`.
    pub fn import(self: &Arc<Self>, handle: &Handle, perms: Permissions) -> Result<Handle> {
        if !handle.perms().contains(perms) {
            return Err(Error::PermissionDenied);
        }

        Ok(Handle::insert(
            self,
            Capability {
                node: handle.node().clone(),
                perms,
            },
        ))
    }

    /// Sends one message to every node named by `destinations`, which are
    /// handle ids in this peer's table carrying [Permissions::SEND].
    ///
    /// A failure to build the request fails the whole send. A failure for one
    /// destination is recorded in the report and does not affect the others.
    pub fn send(
        self: &Arc<Self>,
        params: &SendParams<'_>,
        destinations: &[HandleId],
        scratch: Option<&mut FactoryScratch>,
    ) -> Result<SendReport> {
        let factory = Factory::new(self, params, scratch)?;

        let mut results = Vec::new();
        results.try_reserve_exact(destinations.len())?;

        for &destination in destinations {
            let result = self.deliver(&factory, destination);

            if let Err(err) = result {
                tracing::warn!(peer = self.id, destination, %err, "delivery failed");
            }

            results.push(result);
        }

        Ok(SendReport { results })
    }

    fn deliver(self: &Arc<Self>, factory: &Factory<'_>, destination: HandleId) -> Result<()> {
        let cap = self.handles.get(destination).ok_or(Error::InvalidArgument)?;

        if !cap.perms.contains(Permissions::SEND) {
            return Err(Error::PermissionDenied);
        }

        let owner = cap.node.owner().ok_or(Error::Shutdown)?;

        let dst = Handle::insert(
            &owner,
            Capability {
                node: cap.node,
                perms: Permissions::all(),
            },
        );

        let message = factory.instantiate(&dst)?;
        owner.queue().link(&message)
    }
}
