// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PoolRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads draining the work queue.
    pub workers: usize,
    /// How many times a job is run again after a retryable failure.
    pub max_job_retries: u32,
    /// How long an interface add waits for an in-flight delete of the same
    /// interface.
    pub delete_wait_timeout_ms: u64,
    /// Upper bound on waiting for a VPN to become ready.
    pub not_ready_timeout_ms: u64,
    pub not_ready_initial_interval_ms: u64,
    /// MPLS label range.
    pub label_pool: PoolRange,
    pub vpn_id_pool: PoolRange,
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_job_retries: 3,
            delete_wait_timeout_ms: 30_000,
            not_ready_timeout_ms: 10_000,
            not_ready_initial_interval_ms: 100,
            label_pool: PoolRange {
                start: 100_000,
                end: 130_000,
            },
            vpn_id_pool: PoolRange {
                start: 1,
                end: 65_535,
            },
            db_path: "/var/lib/vpnmgr/db".into(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!("parse {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        for (name, range) in
            [("label_pool", self.label_pool), ("vpn_id_pool", self.vpn_id_pool)]
        {
            if range.start > range.end {
                return Err(Error::Config(format!(
                    "{name} start {} is beyond end {}",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    pub fn delete_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_wait_timeout_ms)
    }

    pub fn not_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.not_ready_timeout_ms)
    }

    pub fn not_ready_initial_interval(&self) -> Duration {
        Duration::from_millis(self.not_ready_initial_interval_ms)
    }
}
