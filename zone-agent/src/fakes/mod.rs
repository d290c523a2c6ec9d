// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for tests.

pub mod archive;
pub mod driver;
pub mod image;
pub mod instance;
pub mod network;
pub mod volume;
