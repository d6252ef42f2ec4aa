// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns abstract VM definitions into host descriptors and drives host
//! agents through VM creation.

pub mod agent;
pub mod compat;
pub mod create;
pub mod payload;
pub mod reconcile;
pub mod spec;
pub mod vm;

pub use agent::{AgentError, HostAgent};
pub use create::{Collaborators, CreateError, CreationResult, VmCreator};
pub use vmbroker_api_types as api;
