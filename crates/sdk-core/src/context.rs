// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The surface handler code uses to perform durable effects. Every method is
//! a thin adapter over the journal engine: it journals one entry, and for
//! operations with a response it returns once the completion is available.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;

use rewind_types::errors::InvocationError;
use rewind_types::identifiers::EntryIndex;
use rewind_types::journal::{CompletionResult, EntryResult, InvokeRequest};

use crate::errors::{Error, HandlerError};
use crate::machine::{CompletionHandle, StateMachine};

#[derive(Clone)]
pub struct Context {
    machine: Arc<StateMachine>,
}

impl Context {
    pub(crate) fn new(machine: Arc<StateMachine>) -> Self {
        Self { machine }
    }

    /// The printable id of this invocation, assigned by the runtime.
    pub fn invocation_id(&self) -> &str {
        self.machine.debug_id()
    }

    /// The key this invocation is bound to. Empty for unkeyed services.
    pub fn key(&self) -> &str {
        self.machine.invocation_key()
    }

    /// The parameter bytes of this invocation.
    pub fn input(&self) -> Bytes {
        self.machine.input()
    }

    /// Reads a user state key.
    pub async fn get_state(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, Error> {
        self.machine.get_state(key.into()).await
    }

    /// Lists the user state keys.
    pub async fn get_state_keys(&self) -> Result<Vec<Bytes>, Error> {
        self.machine.get_state_keys().await
    }

    /// Writes a user state key.
    pub async fn set_state(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.machine.set_state(key.into(), value.into()).await
    }

    /// Clears a user state key.
    pub async fn clear_state(&self, key: impl Into<Bytes>) -> Result<(), Error> {
        self.machine.clear_state(key.into()).await
    }

    /// Clears all user state.
    pub async fn clear_all_state(&self) -> Result<(), Error> {
        self.machine.clear_all_state().await
    }

    /// Durable sleep. Suspends the invocation if the runtime does not fire
    /// the timer while the stream is open.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.machine.sleep(duration).await
    }

    /// Calls another service and returns a handle to await the response.
    /// The entry is journaled before this method returns.
    pub async fn call(
        &self,
        service: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
        parameter: impl Into<Bytes>,
    ) -> Result<CallHandle, Error> {
        let handle = self
            .machine
            .call(InvokeRequest::new(service, key, handler, parameter))
            .await?;
        Ok(CallHandle {
            machine: Arc::clone(&self.machine),
            handle,
        })
    }

    /// Calls another service without waiting for a response, optionally
    /// delayed.
    pub async fn send(
        &self,
        service: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
        parameter: impl Into<Bytes>,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        self.machine
            .one_way_call(InvokeRequest::new(service, key, handler, parameter), delay)
            .await
    }

    /// Creates a promise an external party resolves through the runtime.
    /// Returns the printable identifier to hand out and a handle to await
    /// the result.
    pub async fn awakeable(&self) -> Result<(String, AwakeableHandle), Error> {
        let (id, handle) = self.machine.awakeable().await?;
        Ok((
            id,
            AwakeableHandle {
                machine: Arc::clone(&self.machine),
                handle,
            },
        ))
    }

    /// Resolves an awakeable of another invocation.
    pub async fn complete_awakeable(
        &self,
        id: impl Into<ByteString>,
        result: Result<Bytes, InvocationError>,
    ) -> Result<(), Error> {
        let result = match result {
            Ok(value) => EntryResult::Success(value),
            Err(e) => EntryResult::Failure(e.code(), e.message().to_owned().into()),
        };
        self.machine.complete_awakeable(id.into(), result).await
    }

    /// Runs a closure with a non-deterministic result exactly once, records
    /// the result in the journal and returns the recorded value on replay.
    /// The operation resolves once the runtime acked the entry, so the result
    /// is durable before the handler proceeds.
    pub async fn run<F>(&self, f: F) -> Result<Bytes, Error>
    where
        F: FnOnce() -> Result<Bytes, HandlerError>,
    {
        self.machine.run(f).await
    }
}

/// Response handle of [`Context::call`].
pub struct CallHandle {
    machine: Arc<StateMachine>,
    handle: CompletionHandle,
}

impl CallHandle {
    pub fn entry_index(&self) -> EntryIndex {
        self.handle.index
    }

    /// Awaits the response of the call.
    pub async fn response(self) -> Result<Bytes, Error> {
        match self.machine.resolve(Ok(self.handle)).await? {
            CompletionResult::Success(value) => Ok(value),
            CompletionResult::Failure(code, message) => {
                Err(Error::Failure(InvocationError::new(code, message)))
            }
            CompletionResult::Empty => {
                let err = self
                    .machine
                    .halt_with(Error::ProtocolViolation(
                        "a call completed without a result",
                    ))
                    .await;
                Err(err)
            }
        }
    }
}

/// Result handle of [`Context::awakeable`].
pub struct AwakeableHandle {
    machine: Arc<StateMachine>,
    handle: CompletionHandle,
}

impl AwakeableHandle {
    pub fn entry_index(&self) -> EntryIndex {
        self.handle.index
    }

    /// Awaits the value the external party resolved the awakeable with.
    pub async fn result(self) -> Result<Bytes, Error> {
        match self.machine.resolve(Ok(self.handle)).await? {
            CompletionResult::Success(value) => Ok(value),
            CompletionResult::Empty => Ok(Bytes::new()),
            CompletionResult::Failure(code, message) => {
                Err(Error::Failure(InvocationError::new(code, message)))
            }
        }
    }
}
