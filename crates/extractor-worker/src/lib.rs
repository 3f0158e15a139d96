// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extractor Worker - Message-Driven Job Dispatch
//!
//! Turns broker notifications about repository content into runs of a
//! processing routine, with input staging, retry/escalation and status
//! reporting back to the repository.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   deliveries   ┌─────────────────────────────┐
//!            │    Broker    │───────────────►│        BrokerGateway        │
//!            │ (work queue) │◄───────────────│  (sole owner of the channel)│
//!            └──────────────┘  ack/publish   └──────┬───────────────▲──────┘
//!                   ▲                               │ spawn         │ drain
//!                   │ fanout                        ▼               │
//!        ┌──────────┴──────────┐           ┌────────────────┐  ┌────┴─────┐
//!        │ HeartbeatBroadcaster│           │ MessageHandler │─►│  Outbox  │
//!        └─────────────────────┘           └───────┬────────┘  └──────────┘
//!                                                  │
//!                                   ┌──────────────┼───────────────┐
//!                                   ▼              ▼               ▼
//!                          ┌──────────────┐ ┌────────────┐ ┌─────────────┐
//!                          │   Resource   │ │ Check and  │ │ RetryPolicy │
//!                          │   Resolver   │ │  Process   │ └─────────────┘
//!                          └──────┬───────┘ └────────────┘
//!                                 │
//!                     ┌───────────┴───────────┐
//!                     ▼                       ▼
//!              ┌────────────┐        ┌─────────────────┐
//!              │ MountTable │        │   Repository    │
//!              └────────────┘        └─────────────────┘
//! ```
//!
//! At most one job is in flight per gateway: the prefetch is one, and the
//! gateway pulls the next delivery only after the current job's terminal
//! message has been turned into a broker action.
//!
//! # Job Lifecycle
//!
//! ```text
//! received ─► classified ─┬─► ignored ─────────────────────────► ok
//!                         └─► staged ─► processed ─┬─► ok
//!                                                  ├─► resubmit (retry_count + 1)
//!                                                  └─► error
//! ```
//!
//! | Outcome | Status reported | Broker action |
//! |---------|-----------------|---------------|
//! | success | `SUCCEEDED` | ack |
//! | ignored by Check | `SKIPPED` | ack |
//! | abort / failed command | `ERROR` | error queue, ack |
//! | other failure under budget | `RESUBMITTED` | republish, ack |
//! | other failure over budget | `ERROR` | error queue, ack |
//! | interrupt | `RESUBMITTED` | republish (same count), ack, stop |
//!
//! # Modules
//!
//! - [`config`]: Worker configuration from environment variables
//! - [`mount`]: Remote/local path prefix translation
//! - [`resource`]: Resources and routing-key classification
//! - [`descriptor`]: Inbound job descriptors
//! - [`extractor`]: Extractor identity and callbacks
//! - [`resolver`]: Input staging
//! - [`retry`]: Outcome classification
//! - [`outbox`]: Handler-to-gateway control messages
//! - [`handler`]: Per-message state machine
//! - [`broker`]: Broker abstraction (AMQP and in-memory)
//! - [`gateway`]: Broker receive loop
//! - [`heartbeat`]: Discovery heartbeats
//! - [`batch`]: Offline batch runner
//! - [`notify`]: Completion notices
//! - [`command`]: Command-backed processing routine

#![deny(missing_docs)]

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for worker operations.
pub mod error;

/// Mount table for in-place file access.
pub mod mount;

/// Resources handed to processing routines.
pub mod resource;

/// Inbound job descriptors.
pub mod descriptor;

/// Extractor identity and Check/Process callbacks.
pub mod extractor;

/// Input staging.
pub mod resolver;

/// Retry/error classification.
pub mod retry;

/// Control messages between handlers and the gateway.
pub mod outbox;

/// Per-message state machine.
pub mod handler;

/// Broker channel abstraction.
pub mod broker;

/// Broker receive loop.
pub mod gateway;

/// Discovery heartbeats.
pub mod heartbeat;

/// Offline batch runner.
pub mod batch;

/// Completion notices.
pub mod notify;

/// Processing routine backed by an external command.
pub mod command;

pub use config::Config;
pub use error::{Error, Result};
pub use extractor::{Decision, Extractor, ExtractorInfo};
pub use gateway::{BrokerGateway, GatewayConfig};
pub use handler::{HandlerContext, MessageHandler};
pub use resource::{Resource, ResourceKind};
pub use retry::{ProcessError, RetryPolicy};
