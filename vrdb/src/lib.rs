// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod db;
pub mod error;
pub mod idpool;
pub mod log;
pub mod types;

pub use db::Db;
pub use types::*;

#[cfg(test)]
mod proptest;

pub const COMPONENT_VRDB: &str = "vrdb";
pub const MOD_DB: &str = "database";
pub const MOD_IDPOOL: &str = "idpool";
