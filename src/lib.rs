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

//! Message core of a capability-based local message bus.
//!
//! A send request is validated and snapshotted into a [Factory], which then
//! produces one independent, reference-counted [Message] per destination.
//! Each message owns a zero-copy payload slice in the destination's [Pool],
//! the transferred handles translated into the destination's handle table,
//! and its own duplicates of the transferred files.

pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod message;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod security;
pub mod slots;

pub use config::{Config, ConfigError, Limits};
pub use error::{Error, Result};
pub use factory::{Factory, FactoryScratch, SendParams};
pub use handle::{
    Capability, Handle, HandleId, HandleTable, Node, NodeId, Permissions, TableTranslator,
    Translator,
};
pub use message::{Message, MessageFlags, MessageRef};
pub use peer::{Bus, Peer, PeerId, SendReport, User};
pub use pool::{MemoryPool, Pool, PoolSlice, SliceId};
pub use queue::{QueueId, QueueNode, ReceiveQueue};
pub use security::{Credentials, Security, StaticSecurity, TaskSecurity};
pub use slots::SlotArray;
