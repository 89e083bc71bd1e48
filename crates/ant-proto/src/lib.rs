//! Protocol buffer definitions for the ant to marabunta control stream.
//!
//! Every connection is initiated by the ant. After enrolling over HTTPS the
//! ant dials marabunta with mutual TLS and opens a single bidirectional
//! [`Stream`](marabunta_client::MarabuntaClient::stream) call:
//!
//! ```text
//! ┌──────────────┐   StreamRequest (liveness)    ┌──────────────┐
//! │     ant      │ ────────────────────────────► │  marabunta   │
//! │              │ ◄──────────────────────────── │              │
//! └──────────────┘   StreamResponse (Ping/Pulse) └──────────────┘
//! ```
//!
//! A [`Ping`] asks the ant to report back through the unary `Update` call;
//! a [`Pulse`] is informational only. A `StreamResponse` whose `event` is
//! unset (for example a variant added by a newer marabunta) decodes to
//! `event: None` and must be tolerated by the receiver.

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from marabunta.proto
pub mod marabunta {
    tonic::include_proto!("marabunta");
}

pub use marabunta::*;
