//! capturehub - producer-side capture coordination
//!
//! Producers connect over a `captureproto` endpoint. The hub keeps one shared
//! [`CaptureLifecycle`] and, per connection, two loops:
//!
//! - the command loop watches the lifecycle and sends the producer whatever
//!   commands bring it up to date, replaying transitions it missed
//! - the event loop reads event batches into the installed [`EventSink`] and
//!   reports AllEventsSent or disconnects back to the lifecycle
//!
//! `request_stop` waits, bounded by `service.max_wait_for_all_events_sent_ms`,
//! until every producer counted in the capture has reported or gone away,
//! then finalizes the capture no matter what.

pub mod commands;
pub mod connection;
pub mod lifecycle;
pub mod operator;
pub mod registry;
pub mod server;
pub mod sink;

pub use commands::{plan_commands, ObservedPhase};
pub use connection::serve_connection;
pub use lifecycle::{CaptureLifecycle, LifecycleState, StopOutcome};
pub use operator::{run_operator_loop, OperatorCommand};
pub use registry::ConnectionRegistry;
pub use server::ProducerServer;
pub use sink::{ChannelSink, CountingSink, EventSink, EventTally};
