// Library interface for TwinRS modules
// The binary and integration tests both go through this crate root

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod physiology;
pub mod publisher;
pub mod risk;

// Re-export commonly used types for convenience
pub use config::{HourWindow, ModelConfig, SimulatorConfig, SleepConfig};
pub use engine::{EngineBuilder, LoopStatus, SimulationEngine, TickReport};
pub use error::{PublishError, Result, SimulationError, TwinError};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use monitoring::{MonitoringSession, MonitoringSummary};
pub use physiology::{AthleteModel, PhysiologyModel, TickContext};
pub use publisher::{AthleteSubscription, BroadcastPublisher, ChannelPublisher, NullPublisher, TickPublisher};
pub use risk::{RiskEvaluator, RiskRule};
