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

//! Sender identity and security labels.
//!
//! The message core never calls into the operating system's credential or
//! access-control machinery directly. It asks a [Security] provider for one
//! snapshot per send operation and copies that snapshot into every message.

use crate::error::Result;

/// Identity of the sending task, captured once per send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub tid: i32,
}

pub trait Security: Send + Sync {
    /// Snapshots the calling task's identity.
    ///
    /// Returns [PermissionDenied](crate::Error::PermissionDenied) if the
    /// identity may not be disclosed.
    fn credentials(&self) -> Result<Credentials>;

    /// Returns the security label of the calling task, or `None` if no
    /// mandatory access control is active.
    fn label(&self) -> Result<Option<Box<[u8]>>>;
}

/// Reads the identity of the calling thread. Never produces a label.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskSecurity;

impl Security for TaskSecurity {
    fn credentials(&self) -> Result<Credentials> {
        // SAFETY: these calls have no preconditions and cannot fail
        let (uid, gid, pid) = unsafe { (libc::geteuid(), libc::getegid(), libc::getpid()) };

        Ok(Credentials {
            uid,
            gid,
            pid,
            tid: current_tid(pid),
        })
    }

    fn label(&self) -> Result<Option<Box<[u8]>>> {
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
fn current_tid(_pid: i32) -> i32 {
    // SAFETY: gettid has no preconditions and cannot fail
    unsafe { libc::gettid() }
}

#[cfg(not(target_os = "linux"))]
fn current_tid(pid: i32) -> i32 {
    pid
}

/// A fixed identity and optional label, for services sending on behalf of
/// a known principal.
#[derive(Clone, Debug, Default)]
pub struct StaticSecurity {
    pub credentials: Credentials,
    pub label: Option<Box<[u8]>>,
}

impl StaticSecurity {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            label: None,
        }
    }

    pub fn with_label(mut self, label: &[u8]) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl Security for StaticSecurity {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials)
    }

    fn label(&self) -> Result<Option<Box<[u8]>>> {
        Ok(self.label.clone())
    }
}
