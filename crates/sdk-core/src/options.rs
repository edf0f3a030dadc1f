// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde_with::serde_as;
use std::time::Duration;

/// # Invocation options
#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Options {
    /// # Protocol version
    ///
    /// Version announced in the start frame by the runtime. The engine
    /// currently ignores it, frames are versioned by the runtime.
    pub(crate) protocol_version: u16,

    /// # Suspension timeout
    ///
    /// When no frame arrived from the runtime for this long and the handler
    /// is blocked on at least one completion, the invocation suspends: a
    /// suspension frame listing the pending entries is written and the
    /// stream ends gracefully. The runtime re-invokes the handler once a
    /// completion becomes available.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub(crate) suspension_timeout: humantime::Duration,

    /// # Abort timeout
    ///
    /// When no frame arrived from the runtime for this long and the handler
    /// is *not* blocked on a completion, the invocation is abandoned without
    /// writing any frame. The runtime retries on its own timeline.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub(crate) abort_timeout: humantime::Duration,

    /// # Inbound channel capacity
    ///
    /// Capacity of the channel buffering non-completion frames between the
    /// session reader and the engine. A runtime overrunning it fails the
    /// invocation with a protocol violation.
    pub(crate) inbound_channel_capacity: usize,

    /// # Message size warning
    ///
    /// Threshold to log a warning in case protocol messages coming from the
    /// runtime are larger than the specified amount.
    pub(crate) message_size_warning: usize,

    /// # Message size limit
    ///
    /// Threshold to fail the invocation in case protocol messages coming
    /// from the runtime are larger than the specified amount.
    pub(crate) message_size_limit: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            protocol_version: Options::default_protocol_version(),
            suspension_timeout: Options::default_suspension_timeout(),
            abort_timeout: Options::default_abort_timeout(),
            inbound_channel_capacity: Options::default_inbound_channel_capacity(),
            message_size_warning: Options::default_message_size_warning(),
            message_size_limit: None,
        }
    }
}

impl Options {
    fn default_protocol_version() -> u16 {
        1
    }

    fn default_suspension_timeout() -> humantime::Duration {
        Duration::from_secs(60).into()
    }

    fn default_abort_timeout() -> humantime::Duration {
        (Duration::from_secs(60) * 60).into()
    }

    fn default_inbound_channel_capacity() -> usize {
        64
    }

    fn default_message_size_warning() -> usize {
        1024 * 1024 * 10 // 10mb
    }

    pub fn with_suspension_timeout(mut self, timeout: Duration) -> Self {
        self.suspension_timeout = timeout.into();
        self
    }

    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout.into();
        self
    }

    pub fn with_inbound_channel_capacity(mut self, capacity: usize) -> Self {
        self.inbound_channel_capacity = capacity;
        self
    }

    pub fn with_message_size_limit(mut self, limit: Option<usize>) -> Self {
        self.message_size_limit = limit;
        self
    }
}
