// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

/// A bag of strings. Used for IP-list replies on the list-executors and
/// list-schedulers channels.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringSet {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
}

/// Request to pin a function onto the receiving executor thread. The executor
/// acknowledges to the pin-accept endpoint at `response_address`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PinFunction {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub response_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GenericResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}
