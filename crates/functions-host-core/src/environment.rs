// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of the hosting environment.

use std::collections::HashMap;
use std::env;

/// Hosting plan indicator (e.g. `Dynamic` for consumption plans).
pub const WEBSITE_SKU: &str = "WEBSITE_SKU";
/// Identifier of the instance the host is running on.
pub const WEBSITE_INSTANCE_ID: &str = "WEBSITE_INSTANCE_ID";
/// Raw application performance counters, as a JSON object.
pub const WEBSITE_COUNTERS_APP: &str = "WEBSITE_COUNTERS_APP";

pub const DYNAMIC_SKU: &str = "Dynamic";

pub trait HostEnvironment: Send + Sync {
    fn get_var(&self, name: &str) -> Option<String>;

    fn is_dynamic_sku(&self) -> bool {
        self.get_var(WEBSITE_SKU)
            .is_some_and(|sku| sku.eq_ignore_ascii_case(DYNAMIC_SKU))
    }

    fn instance_id(&self) -> Option<String> {
        self.get_var(WEBSITE_INSTANCE_ID).filter(|id| !id.is_empty())
    }
}

/// Reads from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl HostEnvironment for SystemEnvironment {
    fn get_var(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// Fixed set of variables, for embedding hosts and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticEnvironment {
    vars: HashMap<String, String>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

impl HostEnvironment for StaticEnvironment {
    fn get_var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}
