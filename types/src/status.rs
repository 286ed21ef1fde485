// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Formatter};

/// Identity of a single executor thread. Executors run a fixed number of
/// worker threads per VM, so `(ip, tid)` uniquely names one pinning slot.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExecutorKey {
    pub ip: String,
    pub tid: u32,
}

impl ExecutorKey {
    pub fn new(ip: impl Into<String>, tid: u32) -> Self {
        Self { ip: ip.into(), tid }
    }
}

impl Display for ExecutorKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.tid)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, ::prost::Enumeration)]
#[repr(i32)]
pub enum ExecutorType {
    Cpu = 0,
    Gpu = 1,
}

/// Self-reported state of one executor thread, pushed to the controller on
/// the executor's report period. Within an epoch the latest report per key
/// wins.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ThreadStatus {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub tid: u32,
    /// Fraction of the report period the thread spent busy, in `[0, 1]`.
    #[prost(double, tag = "3")]
    pub utilization: f64,
    /// Names of the functions currently pinned on this thread.
    #[prost(string, repeated, tag = "4")]
    pub functions: Vec<String>,
    #[prost(enumeration = "ExecutorType", tag = "5")]
    pub executor_type: i32,
}

impl ThreadStatus {
    pub fn key(&self) -> ExecutorKey {
        ExecutorKey::new(self.ip.clone(), self.tid)
    }
}
