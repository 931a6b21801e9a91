// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use service_control_types::MetricKind;

fn default_check_num_entries() -> usize {
    10_000
}

fn default_check_flush_interval_ms() -> u64 {
    500
}

fn default_check_expiration_ms() -> u64 {
    1_000
}

fn default_report_num_entries() -> usize {
    10_000
}

fn default_report_flush_interval_ms() -> u64 {
    1_000
}

fn default_background_flush() -> bool {
    true
}

/// Options controlling the check-side cache and aggregation behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckAggregationConfig {
    /// Maximum number of cache entries. Zero disables caching and
    /// aggregation entirely.
    #[serde(default = "default_check_num_entries")]
    pub num_entries: usize,
    /// Maximum milliseconds before a cached entry with aggregated activity
    /// triggers a refresh upstream. The refresh is triggered by a check.
    #[serde(default = "default_check_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Maximum milliseconds before a cached response is dropped. Dropping is
    /// triggered by the periodic flush and always happens strictly after the
    /// refresh interval.
    #[serde(default = "default_check_expiration_ms")]
    pub expiration_ms: u64,
}

impl Default for CheckAggregationConfig {
    fn default() -> Self {
        CheckAggregationConfig {
            num_entries: default_check_num_entries(),
            flush_interval_ms: default_check_flush_interval_ms(),
            expiration_ms: default_check_expiration_ms(),
        }
    }
}

impl CheckAggregationConfig {
    /// Builds a config from raw values.
    pub fn new(num_entries: usize, flush_interval_ms: u64, expiration_ms: u64) -> Self {
        CheckAggregationConfig {
            num_entries,
            flush_interval_ms,
            expiration_ms,
        }
    }

    /// Returns whether caching is enabled.
    pub fn caching_enabled(&self) -> bool {
        self.num_entries > 0
    }

    /// The refresh interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The response expiration, forced to exceed the refresh interval so that
    /// an entry is always refreshable before it is dropped.
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms.max(self.flush_interval_ms + 1))
    }
}

/// Options controlling the report-side cache and aggregation behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportAggregationConfig {
    /// Maximum number of cache entries. Zero disables caching and
    /// aggregation entirely.
    #[serde(default = "default_report_num_entries")]
    pub num_entries: usize,
    /// Maximum milliseconds an aggregated operation stays buffered before the
    /// periodic flush sends it upstream.
    #[serde(default = "default_report_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for ReportAggregationConfig {
    fn default() -> Self {
        ReportAggregationConfig {
            num_entries: default_report_num_entries(),
            flush_interval_ms: default_report_flush_interval_ms(),
        }
    }
}

impl ReportAggregationConfig {
    /// Builds a config from raw values.
    pub fn new(num_entries: usize, flush_interval_ms: u64) -> Self {
        ReportAggregationConfig {
            num_entries,
            flush_interval_ms,
        }
    }

    /// Returns whether caching is enabled.
    pub fn caching_enabled(&self) -> bool {
        self.num_entries > 0
    }

    /// The flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Options for creating a [`ServiceControlClient`](crate::ServiceControlClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Check-side aggregation options.
    #[serde(default)]
    pub check: CheckAggregationConfig,
    /// Report-side aggregation options.
    #[serde(default)]
    pub report: ReportAggregationConfig,
    /// Metric kinds keyed by metric name, as declared in the service
    /// configuration. Metrics not listed here default to
    /// [`MetricKind::Delta`].
    #[serde(default)]
    pub metric_kinds: HashMap<String, MetricKind>,
    /// Whether to run the background task periodically flushing both caches.
    #[serde(default = "default_background_flush")]
    pub background_flush: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            check: CheckAggregationConfig::default(),
            report: ReportAggregationConfig::default(),
            metric_kinds: HashMap::new(),
            background_flush: default_background_flush(),
        }
    }
}
