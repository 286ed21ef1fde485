// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

//! Protobuf-compatible payload types exchanged between the management
//! controller, executors, schedulers, and the storage/routing tiers.

pub mod membership;
pub mod messages;
pub mod stats;
pub mod status;

pub use membership::{ClusterMembership, ServerInfo, Tier, TierId};
pub use messages::{GenericResponse, PinFunction, StringSet};
pub use stats::{DagStatistics, ExecutorStatistics, FunctionStatistics};
pub use status::{ExecutorKey, ExecutorType, ThreadStatus};
