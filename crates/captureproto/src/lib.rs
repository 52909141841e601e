//! captureproto - Protocol types for the capturebus producer stream
//!
//! Producers (samplers, tracers, anything that emits capture events) hold one
//! long-lived connection to the capture hub. The hub pushes lifecycle commands
//! down the connection; producers push event batches and completion notices up.
//!
//! ## Lifecycle
//!
//! A capture moves `Finished -> Started -> Stopping -> Finished`. Peers that
//! fall behind (late joiners, coalesced updates) catch up with [`catch_up`],
//! which lists the transitions needed to get from one phase to another.
//!
//! ## Wire format
//!
//! Length-delimited frames (4-byte big-endian prefix) carrying MessagePack
//! payloads. Enums are externally tagged with snake_case variant names, so a
//! JSON rendering of the same message is readable:
//!
//! ```text
//! {"start_capture":{"options":{"pid":42,"samples_per_second":1234.0,"extra":{}}}}
//! "all_events_sent"
//! ```
//!
//! ## Features
//!
//! `peer` (default) adds the tokio transport: codecs, endpoints and the
//! [`CaptureEventProducer`] client. Without it only the message types remain.

pub mod messages;
pub mod phase;
pub mod wire;

#[cfg(feature = "peer")]
pub mod codec;
#[cfg(feature = "peer")]
pub mod endpoint;
#[cfg(feature = "peer")]
pub mod producer;

pub use messages::{CaptureOptions, ProducerCaptureEvent, ProducerCommand, ProducerId, ProducerMessage};
pub use phase::{catch_up, CapturePhase, CatchUp, Step};
pub use wire::{JsonFormat, MsgPackFormat, WireError, WireFormat};

#[cfg(feature = "peer")]
pub use codec::{HubCodec, MessageCodec, ProducerCodec, DEFAULT_MAX_FRAME_BYTES};
#[cfg(feature = "peer")]
pub use endpoint::{Endpoint, EndpointError, PeerListener, PeerStream};
#[cfg(feature = "peer")]
pub use producer::{
    CaptureEventProducer, ProducerClientConfig, ProducerError, ProducerHandler, ProducerSender,
};
