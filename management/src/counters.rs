// Copyright © Cascade Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub static STATUS_UPDATES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cascade_management_status_updates_total",
        "Thread status updates accepted by the controller.",
    )
    .unwrap()
});

pub static PIN_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cascade_management_pin_requests_total",
        "Pin requests issued, by outcome.",
        &["outcome"],
    )
    .unwrap()
});

pub static VM_CHURN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cascade_management_vm_churn_total",
        "VM churn commands sent to the local worker, by action and kind.",
        &["action", "kind"],
    )
    .unwrap()
});

pub static STORAGE_NODES_DEPARTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cascade_management_storage_nodes_departed_total",
        "Silently departed storage nodes detected by hash-ring reconciliation.",
    )
    .unwrap()
});
