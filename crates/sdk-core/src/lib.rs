// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Invocation state machine of the Rewind SDK.
//!
//! The runtime invokes handlers over a framed bidirectional byte stream, one
//! stream per invocation. This crate consumes such a stream: it replays the
//! journaled effects of prior attempts, journals new ones, routes completions
//! back to the operations awaiting them, and handles suspension and
//! termination. Handler code performs its effects through [`Context`]; the
//! transport lifting a request into the stream lives outside this crate.
//!
//! ```no_run
//! use rewind_sdk_core::{InvocationTask, Options};
//!
//! # async fn serve(stream: tokio::io::DuplexStream) {
//! let outcome = InvocationTask::new(stream, Options::default())
//!     .run(|ctx, input| async move {
//!         let seen = ctx.get_state("seen").await?;
//!         ctx.set_state("seen", input).await?;
//!         Ok(seen.unwrap_or_default())
//!     })
//!     .await;
//! # }
//! ```

mod context;
mod errors;
mod machine;
mod options;
mod session;

pub use context::{AwakeableHandle, CallHandle, Context};
pub use errors::{Error, HandlerError};
pub use options::Options;
pub use session::{InvocationOutcome, InvocationTask};
