pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod params;
pub mod presets;
pub mod protocol;
pub mod rate_limit;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheStats, FreshnessCache};
pub use config::{CacheConfig, ClassLimits, DispatchConfig, RateLimitConfig, RuntimeConfig, SerialConfig};
pub use dispatcher::{ConnectionInfo, Dispatcher, LoadSwitch};
pub use error::GatewayError;
pub use framing::{Acknowledgement, Frame, FrameAssembler, FrameKind};
pub use gateway::{Gateway, PresetApplyReport, ToggleOutcome, MAX_TOGGLE_SECS};
pub use params::{ParamValue, Parameter, ParameterSpec, ValueKind};
pub use presets::{Preset, PresetCatalog};
pub use protocol::{Command, CommandKind};
pub use rate_limit::{CallerId, OperationClass, RateDecision, RateLimitDenial, RateLimiter};
pub use schedule::{ScheduleConfig, ScheduleEngine, ScheduleInfo, ScheduleState, ScheduleStatus};
pub use scheduler::Scheduler;
pub use telemetry::{ChargeState, LoadStatus, Snapshot, Telemetry};
pub use transport::{Connector, SerialConnector};
