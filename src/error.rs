//! Unified error hierarchy for TwinRS
//!
//! Separates the conditions a caller has to tell apart: an athlete that was
//! never tracked, a fault confined to a single athlete's tick, a publish that
//! went nowhere, and a tick loop that died.

use thiserror::Error;

/// Top-level error type for all TwinRS operations
#[derive(Debug, Error)]
pub enum TwinError {
    /// Athlete is not (or no longer) tracked by the engine
    #[error("Athlete not tracked: {athlete_id}")]
    NotTracked { athlete_id: String },

    /// Fault while advancing one athlete's state
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    /// Event could not be delivered to observers
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// The tick loop stopped unexpectedly; all tracking halted
    #[error("Tick loop failure: {0}")]
    LoopFailure(String),

    /// No async runtime available to drive the tick loop
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Faults raised while advancing a single athlete
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A signal produced NaN or infinity
    #[error("Non-finite value for {signal}: {value}")]
    NonFinite { signal: &'static str, value: f64 },

    /// Elapsed time since the previous tick is unusable
    #[error("Invalid elapsed time: {seconds}s")]
    InvalidElapsed { seconds: f64 },

    /// The model panicked while updating this athlete
    #[error("Update panicked for athlete {athlete_id}: {reason}")]
    Panicked { athlete_id: String, reason: String },
}

/// Event delivery errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Nobody is listening right now
    #[error("No subscribers")]
    NoSubscribers,

    /// The observer's buffer is full; the event was dropped
    #[error("Observer buffer full")]
    Full,

    /// The transport has shut down
    #[error("Publisher closed")]
    Closed,
}

/// Result type alias for TwinRS operations
pub type Result<T> = std::result::Result<T, TwinError>;

impl TwinError {
    /// Build a not-tracked error for the given athlete
    pub fn not_tracked(athlete_id: impl Into<String>) -> Self {
        TwinError::NotTracked {
            athlete_id: athlete_id.into(),
        }
    }

    /// True when the athlete was never started or has been stopped
    pub fn is_not_tracked(&self) -> bool {
        matches!(self, TwinError::NotTracked { .. })
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TwinError::NotTracked { .. } => ErrorSeverity::Warning,
            TwinError::Publish(_) => ErrorSeverity::Info,
            TwinError::Simulation(_) => ErrorSeverity::Error,
            TwinError::Configuration(_) => ErrorSeverity::Error,
            TwinError::LoopFailure(_) => ErrorSeverity::Critical,
            TwinError::Runtime(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TwinError::NotTracked { athlete_id } => {
                format!("Athlete {} is not being tracked. Start tracking first.", athlete_id)
            }
            TwinError::LoopFailure(_) => {
                "Live tracking stopped unexpectedly. Restart tracking to resume updates.".to_string()
            }
            TwinError::Runtime(_) => {
                "The simulator must be started from inside an async runtime.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = TwinError::not_tracked("A1");
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err = TwinError::LoopFailure("panic".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_not_tracked_is_distinguishable() {
        assert!(TwinError::not_tracked("A1").is_not_tracked());

        let err: TwinError = SimulationError::NonFinite {
            signal: "heart_rate",
            value: f64::NAN,
        }
        .into();
        assert!(!err.is_not_tracked());
    }

    #[test]
    fn test_user_messages() {
        let err = TwinError::not_tracked("runner-7");
        assert!(err.user_message().contains("runner-7"));
        assert!(err.user_message().contains("not being tracked"));
    }
}
