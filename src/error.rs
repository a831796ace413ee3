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

use std::collections::TryReserveError;

use thiserror::Error;

/// Errors reported by factory construction, instantiation, and the
/// collaborators they call into.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum Error {
    /// Malformed or oversized request shape.
    #[error("invalid argument")]
    InvalidArgument,

    /// Pool slice, handle slot, or file table exhausted.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Credential snapshot, security label, or handle translation was denied.
    #[error("permission denied")]
    PermissionDenied,

    /// Allocation of the factory or message storage failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The peer owning the destination node is gone.
    #[error("destination shut down")]
    Shutdown,
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
