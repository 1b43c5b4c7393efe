//! Logging, failure injection and a deterministic in-memory network for tests.

mod failure_config;
mod logging;
mod sim;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  failure_config::FailureMode,
  logging::LogLevel,
  logging::LogSink,
  logging::LogSpecial,
  logging::Logger,
  logging::LoggerMsg,
  sim::DropRule,
  sim::SimDelivery,
  sim::SimNetwork,
  sim::SIM_APP,
};
