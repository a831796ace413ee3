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

//! Bus configuration.
//!
//! Limits are enforced when a [Factory](crate::factory::Factory) is built;
//! the pool size is used for every peer created through
//! [Bus::create_peer](crate::peer::Bus::create_peer).

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of payload vectors per send.
    #[serde(default = "default_max_vecs")]
    pub max_vecs: usize,
    /// Maximum summed length of all payload vectors.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_vecs: default_max_vecs(),
            max_bytes: default_max_bytes(),
            max_handles: default_max_handles(),
            max_files: default_max_files(),
        }
    }
}

fn default_max_vecs() -> usize {
    512
}

fn default_max_bytes() -> usize {
    8 << 20
}

fn default_max_handles() -> usize {
    1024
}

// SCM_MAX_FD
fn default_max_files() -> usize {
    253
}

fn default_pool_size() -> usize {
    16 << 20
}

impl Config {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be non-zero"));
        }

        if self.limits.max_bytes > self.pool_size {
            return Err(ConfigError::Invalid("max_bytes exceeds pool_size"));
        }

        Ok(())
    }
}
