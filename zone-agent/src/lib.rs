// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the zone agent
//!
//! The zone agent realizes compute instances as Solaris zones: it creates
//! their configuration, installs and boots them, wires up volumes and
//! networks, and moves them between hosts.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

#[macro_use]
extern crate slog;

pub mod config;
pub mod console;
mod devices;
pub mod driver;
pub mod error;
pub mod image;
pub mod instance;
mod lifecycle;
pub mod migration;
pub mod network;
pub mod volume;

#[cfg(test)]
mod fakes;

pub use driver::{InstanceInfo, ZoneDriver};
pub use error::{Error, ErrorKind};
pub use lifecycle::PowerOffType;
pub use migration::MigrationInfo;
