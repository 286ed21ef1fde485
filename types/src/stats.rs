// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

/// Per-function call metrics for one report period. A report either carries
/// runtimes (calls that completed on this executor, with `runtime` holding
/// one duration per completed call) or bare call counts (calls observed by a
/// scheduler that have not produced a runtime sample).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionStatistics {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub call_count: u64,
    #[prost(double, repeated, tag = "3")]
    pub runtime: Vec<f64>,
}

/// Per-DAG request metrics for one report period.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DagStatistics {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub call_count: u64,
    /// Interarrival gaps between consecutive requests, as seen by the
    /// scheduler.
    #[prost(double, repeated, tag = "3")]
    pub interarrival: Vec<f64>,
    /// End-to-end runtimes of requests completed in the period.
    #[prost(double, repeated, tag = "4")]
    pub runtimes: Vec<f64>,
}

/// One statistics report, pushed by an executor or scheduler to the
/// controller's statistics channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutorStatistics {
    #[prost(message, repeated, tag = "1")]
    pub functions: Vec<FunctionStatistics>,
    #[prost(message, repeated, tag = "2")]
    pub dags: Vec<DagStatistics>,
}
