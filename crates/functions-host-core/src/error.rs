// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors surfaced by the functions host core.
///
/// Sampling faults and transient channel faults never show up here; they are
/// absorbed into state and logs. Only conditions that need caller action are
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No worker available for language '{language}'")]
    NoWorkerAvailable { language: String },

    #[error("Worker channel {channel_id} is unavailable")]
    ChannelUnavailable { channel_id: String },

    #[error("Worker restart attempts exhausted for language '{language}' after {attempts} attempts")]
    RetriesExhausted { language: String, attempts: u32 },

    #[error("Worker did not complete initialization within {0:?}")]
    InitializationTimeout(Duration),

    #[error("Failed to start worker: {0}")]
    WorkerStart(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dispatcher is disposed")]
    DispatcherDisposed,

    #[error("Timed out after {0:?} waiting for a ready worker channel")]
    WaitTimeout(Duration),
}

impl HostError {
    /// Whether the supervisor should keep trying after this error.
    ///
    /// Configuration errors are fatal for the affected worker slot.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HostError::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HostError::InvalidConfig("port out of range".to_string());
        assert_eq!(error.to_string(), "Invalid configuration: port out of range");

        let error = HostError::NoWorkerAvailable {
            language: "node".to_string(),
        };
        assert_eq!(error.to_string(), "No worker available for language 'node'");
    }

    #[test]
    fn test_error_debug() {
        let error = HostError::DispatcherDisposed;
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("DispatcherDisposed"));
    }

    #[test]
    fn test_config_errors_are_not_retryable() {
        assert!(!HostError::InvalidConfig("bad".into()).is_retryable());
        assert!(HostError::WorkerStart("spawn failed".into()).is_retryable());
        assert!(HostError::InitializationTimeout(Duration::from_secs(30)).is_retryable());
        assert!(HostError::Transport("reset".into()).is_retryable());
    }
}
