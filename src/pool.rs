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

//! Payload pools.
//!
//! Every peer owns a pool from which message slices are reserved. A slice is
//! written once while its message is built and is read-only afterwards.
//! Reservation never waits: a full pool fails immediately so that one
//! congested destination cannot hold up a multicast.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use sharded_slab::Clear;

use crate::error::{Error, Result};

/// Identifies a reserved slice within its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SliceId {
    pub key: usize,
    pub size: usize,
}

pub trait Pool: Send + Sync {
    /// Reserves `size` bytes. Fails with
    /// [ResourceExhausted](crate::Error::ResourceExhausted) without blocking.
    fn reserve(&self, size: usize) -> Result<SliceId>;

    fn write(&self, slice: SliceId, offset: usize, bytes: &[u8]) -> Result<()>;

    fn read(&self, slice: SliceId, offset: usize, buf: &mut [u8]) -> Result<()>;

    fn release(&self, slice: SliceId);
}

/// An owned slice, released back to its pool exactly once on drop.
pub struct PoolSlice {
    pool: Arc<dyn Pool>,
    id: SliceId,
}

impl std::fmt::Debug for PoolSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlice").field("id", &self.id).finish()
    }
}

impl Drop for PoolSlice {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl PoolSlice {
    pub fn reserve(pool: &Arc<dyn Pool>, size: usize) -> Result<Self> {
        let id = pool.reserve(size)?;

        Ok(Self {
            pool: pool.clone(),
            id,
        })
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.id.size
    }

    pub fn is_empty(&self) -> bool {
        self.id.size == 0
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.pool.write(self.id, offset, bytes)
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.pool.read(self.id, offset, buf)
    }

    /// Copies `len` bytes starting at `offset` out of the slice.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)?;
        buf.resize(len, 0);
        self.read(offset, &mut buf)?;
        Ok(buf)
    }
}

#[derive(Default)]
struct SliceBuf {
    data: Mutex<Vec<u8>>,
}

impl Clear for SliceBuf {
    fn clear(&mut self) {
        self.data.get_mut().clear();
    }
}

/// A heap-backed pool with a fixed byte budget.
pub struct MemoryPool {
    slices: sharded_slab::Pool<SliceBuf>,
    capacity: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slices: sharded_slab::Pool::new(),
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn check_range(buf: &[u8], offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= buf.len() => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl Pool for MemoryPool {
    fn reserve(&self, size: usize) -> Result<SliceId> {
        let capacity = self.capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= capacity)
            })
            .map_err(|_| Error::ResourceExhausted)?;

        let key = self.slices.create_with(|buf| buf.data.get_mut().resize(size, 0));

        match key {
            Some(key) => Ok(SliceId { key, size }),
            None => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                Err(Error::ResourceExhausted)
            }
        }
    }

    fn write(&self, slice: SliceId, offset: usize, bytes: &[u8]) -> Result<()> {
        let buf = self.slices.get(slice.key).ok_or(Error::InvalidArgument)?;
        let mut data = buf.data.lock();
        Self::check_range(&data, offset, bytes.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, slice: SliceId, offset: usize, out: &mut [u8]) -> Result<()> {
        let buf = self.slices.get(slice.key).ok_or(Error::InvalidArgument)?;
        let data = buf.data.lock();
        Self::check_range(&data, offset, out.len())?;
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    fn release(&self, slice: SliceId) {
        if self.slices.clear(slice.key) {
            self.used.fetch_sub(slice.size, Ordering::AcqRel);
        } else {
            tracing::warn!(key = slice.key, "release of unknown pool slice");
        }
    }
}
