// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The journal/replay engine of one invocation.
//!
//! Every handler-facing operation funnels through [`StateMachine::replay_or_new`]:
//! while the entry index lies inside the replayed prefix the journaled entry is
//! matched against the request the handler issued, afterwards a new entry is
//! journaled and sent to the runtime. Completions are routed to per-entry
//! one-shot slots by the session reader.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use rewind_service_protocol::awakeable_id::AwakeableIdentifier;
use rewind_service_protocol::message::ProtocolMessage;
use rewind_service_protocol::pb;
use rewind_service_protocol::ProtobufRawEntryCodec;
use rewind_types::errors::InvocationError;
use rewind_types::identifiers::{EntryIndex, InvocationId};
use rewind_types::journal::raw::{RawEntry, RawEntryCodec};
use rewind_types::journal::{
    Completion, CompletionResult, Entry, EntryResult, EntryType, GetStateKeysResult,
    GetStateResult, InvokeRequest, OutputEntry, SleepResult,
};
use rewind_types::time::MillisSinceEpoch;

use crate::errors::{Error, HandlerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Replaying,
    Processing,
    Closed,
}

enum CompletionSlot {
    /// The handler reached the entry and may be awaiting the result.
    Waiting(oneshot::Sender<CompletionResult>),
    /// The completion arrived before the handler reached the entry.
    Buffered(CompletionResult),
}

/// User state eagerly transferred in the start frame. Kept current across
/// state mutations so reads can be answered without a runtime round-trip.
struct EagerState {
    map: BTreeMap<Bytes, Bytes>,
    partial: bool,
}

impl EagerState {
    fn new(entries: Vec<pb::protocol::start_message::StateEntry>, partial: bool) -> Self {
        Self {
            map: entries.into_iter().map(|e| (e.key, e.value)).collect(),
            partial,
        }
    }

    fn is_complete(&self) -> bool {
        !self.partial
    }

    fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.map.get(key).cloned()
    }

    fn keys(&self) -> Vec<Bytes> {
        self.map.keys().cloned().collect()
    }

    fn insert(&mut self, key: Bytes, value: Bytes) {
        self.map.insert(key, value);
    }

    fn remove(&mut self, key: &Bytes) {
        self.map.remove(key);
    }

    fn clear(&mut self) {
        self.map.clear();
        // An empty state map is complete knowledge.
        self.partial = false;
    }
}

struct Inner {
    phase: Phase,
    /// Index of the most recently assigned entry. Entries are numbered from 1.
    current_index: EntryIndex,
    /// Entries 2..=replay_count received during the handshake, consumed as the
    /// handler re-issues its operations. Entry 1 is the input entry, consumed
    /// at construction.
    replay_entries: HashMap<EntryIndex, RawEntry>,
    completions: HashMap<EntryIndex, CompletionSlot>,
    /// Indexes whose completion slot resolved, kept to flag duplicate
    /// completion frames.
    resolved: HashSet<EntryIndex>,
    acks: HashMap<EntryIndex, oneshot::Sender<()>>,
    eager_state: EagerState,
    out_tx: Option<mpsc::UnboundedSender<ProtocolMessage>>,
    canceled: bool,
    reader_closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.canceled {
            return Err(Error::Canceled);
        }
        if self.phase == Phase::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn enqueue(&mut self, msg: ProtocolMessage) {
        if let Some(tx) = &self.out_tx {
            let _ = tx.send(msg);
        }
    }

    fn write_entry(&mut self, entry: Entry) {
        let raw = ProtobufRawEntryCodec::serialize(entry);
        self.enqueue(ProtocolMessage::UnparsedEntry(raw));
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
        self.out_tx = None;
    }

    fn register_slot(&mut self, index: EntryIndex) -> oneshot::Receiver<CompletionResult> {
        let (tx, rx) = oneshot::channel();
        match self.completions.remove(&index) {
            Some(CompletionSlot::Buffered(result)) => {
                trace!(entry_index = index, "Applying buffered completion");
                self.resolved.insert(index);
                let _ = tx.send(result);
            }
            Some(CompletionSlot::Waiting(_)) => {
                unreachable!("an entry registers its completion slot exactly once")
            }
            None => {
                self.completions.insert(index, CompletionSlot::Waiting(tx));
            }
        }
        rx
    }

    fn register_ack(&mut self, index: EntryIndex) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(index, tx);
        rx
    }

    fn fail_blocked_waiters(&mut self) {
        self.completions
            .retain(|_, slot| matches!(slot, CompletionSlot::Buffered(_)));
        self.acks.clear();
    }
}

/// Handle to the completion slot of one entry. Resolve it through
/// [`StateMachine::resolve`].
pub(crate) struct CompletionHandle {
    pub(crate) index: EntryIndex,
    state: HandleState,
}

enum HandleState {
    Ready(CompletionResult),
    Wait(oneshot::Receiver<CompletionResult>),
}

impl CompletionHandle {
    fn ready(index: EntryIndex, result: CompletionResult) -> Self {
        Self {
            index,
            state: HandleState::Ready(result),
        }
    }

    fn wait(index: EntryIndex, rx: oneshot::Receiver<CompletionResult>) -> Self {
        Self {
            index,
            state: HandleState::Wait(rx),
        }
    }
}

pub(crate) struct StateMachine {
    invocation_id: InvocationId,
    debug_id: String,
    key: ByteString,
    input: Bytes,
    /// Number of entries the runtime already has, the input entry included.
    replay_count: EntryIndex,

    inner: Mutex<Inner>,

    failure: Mutex<Option<Error>>,
    failed_tx: watch::Sender<bool>,
    failed_rx: watch::Receiver<bool>,
}

impl StateMachine {
    pub(crate) fn new(
        start: pb::protocol::StartMessage,
        mut entries: Vec<RawEntry>,
        out_tx: mpsc::UnboundedSender<ProtocolMessage>,
    ) -> Result<Self, Error> {
        let replay_count = start.known_entries;
        debug_assert_eq!(entries.len() as u32, replay_count);

        let input = if replay_count >= 1 {
            let first = entries.remove(0);
            if first.ty() != EntryType::Input {
                return Err(Error::ProtocolViolation(
                    "the first journal entry must be the input entry",
                ));
            }
            match ProtobufRawEntryCodec::deserialize(&first)? {
                Entry::Input(input_entry) => input_entry.value,
                _ => unreachable!("input raw entries deserialize to input entries"),
            }
        } else {
            Bytes::new()
        };

        let current_index = replay_count.min(1);
        let replay_entries = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (i as EntryIndex + 2, entry))
            .collect();

        let (failed_tx, failed_rx) = watch::channel(false);

        Ok(Self {
            invocation_id: InvocationId::from_bytes(start.id),
            debug_id: start.debug_id,
            key: start.key.into(),
            input,
            replay_count,
            inner: Mutex::new(Inner {
                phase: if current_index >= replay_count {
                    Phase::Processing
                } else {
                    Phase::Replaying
                },
                current_index,
                replay_entries,
                completions: HashMap::new(),
                resolved: HashSet::new(),
                acks: HashMap::new(),
                eager_state: EagerState::new(start.state_map, start.partial_state),
                out_tx: Some(out_tx),
                canceled: false,
                reader_closed: false,
            }),
            failure: Mutex::new(None),
            failed_tx,
            failed_rx,
        })
    }

    pub(crate) fn debug_id(&self) -> &str {
        &self.debug_id
    }

    pub(crate) fn invocation_key(&self) -> &ByteString {
        &self.key
    }

    pub(crate) fn input(&self) -> Bytes {
        self.input.clone()
    }

    // --- The replay/new primitive

    /// Assigns the next entry index and either matches the handler's request
    /// against the journaled entry at that index, or journals a fresh entry.
    ///
    /// During replay no frame is ever written; `new_fn` is never invoked.
    fn replay_or_new<T>(
        &self,
        expected: EntryType,
        replay_fn: impl FnOnce(&mut Inner, EntryIndex, Entry) -> Result<T, Error>,
        new_fn: impl FnOnce(&mut Inner, EntryIndex) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_open()?;

        let index = inner.current_index + 1;
        inner.current_index = index;

        if index <= self.replay_count {
            let entry = Self::take_replay_entry(&mut inner, index, expected)?;
            if index == self.replay_count {
                debug!("Journal replay completed");
                inner.phase = Phase::Processing;
            }
            replay_fn(&mut *inner, index, entry)
        } else {
            new_fn(&mut *inner, index)
        }
    }

    fn take_replay_entry(
        inner: &mut Inner,
        index: EntryIndex,
        expected: EntryType,
    ) -> Result<Entry, Error> {
        let raw = inner
            .replay_entries
            .remove(&index)
            .ok_or(Error::ProtocolViolation("missing replay entry"))?;
        let actual = raw.ty();
        if actual != expected {
            return Err(Error::EntryTypeMismatch {
                index,
                expected,
                actual,
            });
        }
        Ok(ProtobufRawEntryCodec::deserialize(&raw)?)
    }

    // --- Failure latch

    /// Latches the first terminal failure and wakes the driver.
    pub(crate) fn fail(&self, err: Error) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            debug!(error = %err, "Invocation failed");
            *failure = Some(err);
            let _ = self.failed_tx.send(true);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.failure.lock().unwrap().take()
    }

    pub(crate) fn failed_watch(&self) -> watch::Receiver<bool> {
        self.failed_rx.clone()
    }

    /// For errors dooming the invocation the operation never resolves: the
    /// failure is latched for the driver, which aborts the handler and
    /// reports it to the runtime. Other errors surface to the handler.
    async fn maybe_halt(&self, err: Error) -> Error {
        if err.halts_invocation() {
            self.fail(err);
            futures::future::pending::<()>().await;
            unreachable!("pending never resolves")
        }
        err
    }

    pub(crate) async fn halt_with(&self, err: Error) -> Error {
        self.maybe_halt(err).await
    }

    fn disconnect_error(&self) -> Error {
        if self.inner.lock().unwrap().canceled {
            Error::Canceled
        } else {
            Error::ConnectionClosed
        }
    }

    pub(crate) async fn resolve(
        &self,
        handle: Result<CompletionHandle, Error>,
    ) -> Result<CompletionResult, Error> {
        match handle {
            Ok(CompletionHandle {
                state: HandleState::Ready(result),
                ..
            }) => Ok(result),
            Ok(CompletionHandle {
                index,
                state: HandleState::Wait(rx),
            }) => {
                trace!(entry_index = index, "Awaiting completion");
                match rx.await {
                    Ok(result) => Ok(result),
                    Err(_) => Err(self.disconnect_error()),
                }
            }
            Err(e) => Err(self.maybe_halt(e).await),
        }
    }

    pub(crate) async fn surface(&self, res: Result<(), Error>) -> Result<(), Error> {
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(self.maybe_halt(e).await),
        }
    }

    // --- State operations

    pub(crate) fn get_state_inner(&self, key: &Bytes) -> Result<CompletionHandle, Error> {
        self.replay_or_new(
            EntryType::GetState,
            |inner, index, entry| {
                let Entry::GetState(e) = entry else {
                    unreachable!()
                };
                if e.key != *key {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::GetState,
                    });
                }
                Ok(match e.value {
                    Some(value) => {
                        inner.resolved.insert(index);
                        CompletionHandle::ready(index, get_state_result_to_completion(value))
                    }
                    None => CompletionHandle::wait(index, inner.register_slot(index)),
                })
            },
            |inner, index| {
                if let Some(value) = inner.eager_state.get(key) {
                    inner.write_entry(Entry::get_state(
                        key.clone(),
                        Some(GetStateResult::Result(value.clone())),
                    ));
                    inner.resolved.insert(index);
                    Ok(CompletionHandle::ready(
                        index,
                        CompletionResult::Success(value),
                    ))
                } else if inner.eager_state.is_complete() {
                    inner.write_entry(Entry::get_state(key.clone(), Some(GetStateResult::Empty)));
                    inner.resolved.insert(index);
                    Ok(CompletionHandle::ready(index, CompletionResult::Empty))
                } else {
                    inner.write_entry(Entry::get_state(key.clone(), None));
                    Ok(CompletionHandle::wait(index, inner.register_slot(index)))
                }
            },
        )
    }

    pub(crate) async fn get_state(&self, key: Bytes) -> Result<Option<Bytes>, Error> {
        debug!(state.key = %String::from_utf8_lossy(&key), "Executing 'get state'");
        let handle = self.get_state_inner(&key);
        match self.resolve(handle).await? {
            CompletionResult::Empty => Ok(None),
            CompletionResult::Success(value) => Ok(Some(value)),
            CompletionResult::Failure(code, message) => {
                Err(Error::Failure(InvocationError::new(code, message)))
            }
        }
    }

    pub(crate) async fn set_state(&self, key: Bytes, value: Bytes) -> Result<(), Error> {
        debug!(state.key = %String::from_utf8_lossy(&key), "Executing 'set state'");
        let res = self.replay_or_new(
            EntryType::SetState,
            |_, index, entry| {
                let Entry::SetState(e) = entry else {
                    unreachable!()
                };
                if e.key != key || e.value != value {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::SetState,
                    });
                }
                Ok(())
            },
            |inner, _| {
                inner.eager_state.insert(key.clone(), value.clone());
                inner.write_entry(Entry::set_state(key.clone(), value.clone()));
                Ok(())
            },
        );
        self.surface(res).await
    }

    pub(crate) async fn clear_state(&self, key: Bytes) -> Result<(), Error> {
        debug!(state.key = %String::from_utf8_lossy(&key), "Executing 'clear state'");
        let res = self.replay_or_new(
            EntryType::ClearState,
            |_, index, entry| {
                let Entry::ClearState(e) = entry else {
                    unreachable!()
                };
                if e.key != key {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::ClearState,
                    });
                }
                Ok(())
            },
            |inner, _| {
                inner.eager_state.remove(&key);
                inner.write_entry(Entry::clear_state(key.clone()));
                Ok(())
            },
        );
        self.surface(res).await
    }

    pub(crate) async fn clear_all_state(&self) -> Result<(), Error> {
        debug!("Executing 'clear all state'");
        let res = self.replay_or_new(
            EntryType::ClearAllState,
            |_, _, _| Ok(()),
            |inner, _| {
                inner.eager_state.clear();
                inner.write_entry(Entry::clear_all_state());
                Ok(())
            },
        );
        self.surface(res).await
    }

    pub(crate) async fn get_state_keys(&self) -> Result<Vec<Bytes>, Error> {
        debug!("Executing 'get state keys'");
        let handle = self.replay_or_new(
            EntryType::GetStateKeys,
            |inner, index, entry| {
                let Entry::GetStateKeys(e) = entry else {
                    unreachable!()
                };
                Ok(match e.value {
                    Some(value) => {
                        inner.resolved.insert(index);
                        CompletionHandle::ready(index, keys_result_to_completion(value))
                    }
                    None => CompletionHandle::wait(index, inner.register_slot(index)),
                })
            },
            |inner, index| {
                if inner.eager_state.is_complete() {
                    let keys = inner.eager_state.keys();
                    inner.write_entry(Entry::get_state_keys(Some(GetStateKeysResult::Result(
                        keys.clone(),
                    ))));
                    inner.resolved.insert(index);
                    Ok(CompletionHandle::ready(
                        index,
                        CompletionResult::Success(ProtobufRawEntryCodec::serialize_state_keys(
                            keys,
                        )),
                    ))
                } else {
                    inner.write_entry(Entry::get_state_keys(None));
                    Ok(CompletionHandle::wait(index, inner.register_slot(index)))
                }
            },
        );
        match self.resolve(handle).await? {
            CompletionResult::Empty => Ok(vec![]),
            CompletionResult::Success(payload) => {
                let keys = ProtobufRawEntryCodec::deserialize_state_keys(payload)
                    .map_err(Error::Codec);
                match keys {
                    Ok(keys) => Ok(keys),
                    Err(e) => Err(self.maybe_halt(e).await),
                }
            }
            CompletionResult::Failure(code, message) => {
                Err(Error::Failure(InvocationError::new(code, message)))
            }
        }
    }

    // --- Syscalls

    pub(crate) async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        debug!(sleep.duration = ?duration, "Executing 'sleep'");
        let handle = self.replay_or_new(
            EntryType::Sleep,
            |inner, index, entry| {
                let Entry::Sleep(e) = entry else {
                    unreachable!()
                };
                Ok(match e.result {
                    Some(result) => {
                        inner.resolved.insert(index);
                        CompletionHandle::ready(index, sleep_result_to_completion(result))
                    }
                    None => CompletionHandle::wait(index, inner.register_slot(index)),
                })
            },
            |inner, index| {
                let wake_up_time = MillisSinceEpoch::now() + duration;
                inner.write_entry(Entry::sleep(wake_up_time, None));
                Ok(CompletionHandle::wait(index, inner.register_slot(index)))
            },
        );
        match self.resolve(handle).await? {
            CompletionResult::Empty | CompletionResult::Success(_) => Ok(()),
            CompletionResult::Failure(code, message) => {
                Err(Error::Failure(InvocationError::new(code, message)))
            }
        }
    }

    pub(crate) async fn call(&self, request: InvokeRequest) -> Result<CompletionHandle, Error> {
        debug!(
            rpc.service = %request.service_name,
            rpc.method = %request.handler_name,
            "Executing 'call'"
        );
        let handle = self.replay_or_new(
            EntryType::Call,
            |inner, index, entry| {
                let Entry::Call(e) = entry else {
                    unreachable!()
                };
                if e.request != request {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::Call,
                    });
                }
                Ok(match e.result {
                    Some(result) => {
                        inner.resolved.insert(index);
                        CompletionHandle::ready(index, entry_result_to_completion(result))
                    }
                    None => CompletionHandle::wait(index, inner.register_slot(index)),
                })
            },
            |inner, index| {
                inner.write_entry(Entry::call(request.clone(), None));
                Ok(CompletionHandle::wait(index, inner.register_slot(index)))
            },
        );
        match handle {
            Ok(handle) => Ok(handle),
            Err(e) => Err(self.maybe_halt(e).await),
        }
    }

    pub(crate) async fn one_way_call(
        &self,
        request: InvokeRequest,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        debug!(
            rpc.service = %request.service_name,
            rpc.method = %request.handler_name,
            "Executing 'one way call'"
        );
        let res = self.replay_or_new(
            EntryType::OneWayCall,
            |_, index, entry| {
                let Entry::OneWayCall(e) = entry else {
                    unreachable!()
                };
                // The journaled invoke time is authoritative, it was computed
                // from the wall clock of the recorded attempt.
                if e.request != request {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::OneWayCall,
                    });
                }
                Ok(())
            },
            |inner, _| {
                let invoke_time = delay.map(|delay| MillisSinceEpoch::now() + delay);
                inner.write_entry(Entry::one_way_call(request.clone(), invoke_time));
                Ok(())
            },
        );
        self.surface(res).await
    }

    pub(crate) async fn awakeable(&self) -> Result<(String, CompletionHandle), Error> {
        debug!("Executing 'awakeable'");
        let handle = self.replay_or_new(
            EntryType::Awakeable,
            |inner, index, entry| {
                let Entry::Awakeable(e) = entry else {
                    unreachable!()
                };
                Ok(match e.result {
                    Some(result) => {
                        inner.resolved.insert(index);
                        CompletionHandle::ready(index, entry_result_to_completion(result))
                    }
                    None => CompletionHandle::wait(index, inner.register_slot(index)),
                })
            },
            |inner, index| {
                inner.write_entry(Entry::awakeable(None));
                Ok(CompletionHandle::wait(index, inner.register_slot(index)))
            },
        );
        match handle {
            Ok(handle) => {
                let id =
                    AwakeableIdentifier::new(self.invocation_id.clone(), handle.index).to_string();
                Ok((id, handle))
            }
            Err(e) => Err(self.maybe_halt(e).await),
        }
    }

    pub(crate) async fn complete_awakeable(
        &self,
        id: ByteString,
        result: EntryResult,
    ) -> Result<(), Error> {
        debug!(awakeable.id = %id, "Executing 'complete awakeable'");
        let res = self.replay_or_new(
            EntryType::CompleteAwakeable,
            |_, index, entry| {
                let Entry::CompleteAwakeable(e) = entry else {
                    unreachable!()
                };
                if e.id != id || e.result != result {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::CompleteAwakeable,
                    });
                }
                Ok(())
            },
            |inner, _| {
                inner.write_entry(Entry::complete_awakeable(id.clone(), result.clone()));
                Ok(())
            },
        );
        self.surface(res).await
    }

    pub(crate) async fn run<F>(&self, f: F) -> Result<Bytes, Error>
    where
        F: FnOnce() -> Result<Bytes, HandlerError>,
    {
        debug!("Executing 'run'");

        // In replay mode the journaled result is returned without invoking
        // the closure.
        let replayed: Option<Result<Bytes, Error>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.ensure_open()?;
            if inner.current_index + 1 <= self.replay_count {
                let index = inner.current_index + 1;
                inner.current_index = index;
                Some(
                    Self::take_replay_entry(&mut *inner, index, EntryType::Run).map(|entry| {
                        if index == self.replay_count {
                            debug!("Journal replay completed");
                            inner.phase = Phase::Processing;
                        }
                        entry
                    }).and_then(|entry| {
                        let Entry::Run(e) = entry else { unreachable!() };
                        match e.result {
                            EntryResult::Success(value) => Ok(value),
                            EntryResult::Failure(code, message) => {
                                Err(Error::Failure(InvocationError::new(code, message)))
                            }
                        }
                    }),
                )
            } else {
                None
            }
        };
        if let Some(res) = replayed {
            return match res {
                Ok(value) => Ok(value),
                Err(e) => Err(self.maybe_halt(e).await),
            };
        }

        // The closure runs outside the journal lock; the entry index is
        // assigned when the result is journaled, so concurrent operations
        // journal in completion order.
        let closure_result = f();

        enum RunOutcome {
            Acked(oneshot::Receiver<()>, EntryIndex, Result<Bytes, Error>),
            RetryableFailure(anyhow::Error),
        }

        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.ensure_open()?;
            let index = inner.current_index + 1;
            inner.current_index = index;
            match closure_result {
                Ok(value) => {
                    let entry_result = EntryResult::Success(value);
                    let result = match &entry_result {
                        EntryResult::Success(value) => Ok(value.clone()),
                        EntryResult::Failure(code, message) => Err(Error::Failure(
                            InvocationError::new(*code, message.clone()),
                        )),
                    };
                    inner.write_entry(Entry::run(entry_result));
                    RunOutcome::Acked(inner.register_ack(index), index, result)
                }
                Err(HandlerError::Terminal(e)) => {
                    let entry_result =
                        EntryResult::Failure(e.code(), e.message().to_owned().into());
                    let result = match &entry_result {
                        EntryResult::Success(value) => Ok(value.clone()),
                        EntryResult::Failure(code, message) => Err(Error::Failure(
                            InvocationError::new(*code, message.clone()),
                        )),
                    };
                    inner.write_entry(Entry::run(entry_result));
                    RunOutcome::Acked(inner.register_ack(index), index, result)
                }
                Err(HandlerError::Retryable(e)) => {
                    // Roll the index back, nothing was journaled.
                    inner.current_index = index - 1;
                    RunOutcome::RetryableFailure(e)
                }
            }
        };

        match outcome {
            RunOutcome::RetryableFailure(e) => Err(self.maybe_halt(Error::RunFailed(e)).await),
            RunOutcome::Acked(ack_rx, index, result) => {
                // The run result must be durable before the handler proceeds.
                trace!(entry_index = index, "Awaiting entry ack");
                if ack_rx.await.is_err() {
                    return Err(self.disconnect_error());
                }
                result
            }
        }
    }

    // --- Output and lifecycle

    pub(crate) fn output(&self, result: EntryResult) -> Result<(), Error> {
        debug!("Writing invocation output");
        let expected = result.clone();
        self.replay_or_new(
            EntryType::Output,
            |_, index, entry| {
                let Entry::Output(e) = entry else {
                    unreachable!()
                };
                if e.result != expected {
                    return Err(Error::JournalMismatch {
                        index,
                        ty: EntryType::Output,
                    });
                }
                Ok(())
            },
            |inner, _| {
                inner.write_entry(Entry::Output(OutputEntry { result }));
                Ok(())
            },
        )
    }

    pub(crate) fn end(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Closed {
            debug!("Ending invocation");
            inner.enqueue(ProtocolMessage::new_end());
            inner.close();
        }
    }

    /// Emits the suspension frame listing the entries the handler is blocked
    /// on, if any, and closes the stream gracefully.
    pub(crate) fn suspend(&self) -> Option<BTreeSet<EntryIndex>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase == Phase::Closed {
            return None;
        }
        let indexes: BTreeSet<EntryIndex> = inner
            .completions
            .iter()
            .filter(|(_, slot)| matches!(slot, CompletionSlot::Waiting(_)))
            .map(|(index, _)| *index)
            .chain(inner.acks.keys().copied())
            .collect();
        if indexes.is_empty() {
            return None;
        }
        debug!(suspension.entry_indexes = ?indexes, "Suspending invocation");
        inner.enqueue(ProtocolMessage::new_suspension(indexes.iter().copied()));
        inner.close();
        Some(indexes)
    }

    pub(crate) fn emit_error(&self, msg: pb::protocol::ErrorMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Closed {
            inner.enqueue(ProtocolMessage::Error(msg));
            inner.close();
        }
    }

    /// Closes the outbound stream without writing any further frame.
    pub(crate) fn close(&self) {
        self.inner.lock().unwrap().close();
    }

    // --- Inbound routing, invoked by the session reader and the driver

    pub(crate) fn notify_completion(&self, completion: Completion) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let index = completion.entry_index;
        if index > self.replay_count && index > inner.current_index {
            return Err(Error::ProtocolViolation(
                "completion for an entry beyond the known journal",
            ));
        }
        if inner.resolved.contains(&index) {
            return Err(Error::ProtocolViolation(
                "duplicate completion for an already resolved entry",
            ));
        }
        match inner.completions.remove(&index) {
            Some(CompletionSlot::Waiting(tx)) => {
                inner.resolved.insert(index);
                let _ = tx.send(completion.result);
            }
            Some(CompletionSlot::Buffered(_)) => {
                return Err(Error::ProtocolViolation(
                    "duplicate completion for a buffered entry",
                ));
            }
            None => {
                trace!(entry_index = index, "Buffering completion");
                inner
                    .completions
                    .insert(index, CompletionSlot::Buffered(completion.result));
            }
        }
        Ok(())
    }

    pub(crate) fn notify_ack(&self, index: EntryIndex) {
        let mut inner = self.inner.lock().unwrap();
        match inner.acks.remove(&index) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => trace!(entry_index = index, "Ignoring ack for an unknown entry"),
        }
    }

    /// The inbound stream ended: nothing will resolve the outstanding slots
    /// anymore, unblock the handler.
    pub(crate) fn notify_reader_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reader_closed {
            trace!("Inbound stream closed");
            inner.reader_closed = true;
            inner.fail_blocked_waiters();
        }
    }

    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.canceled {
            debug!("Invocation canceled");
            inner.canceled = true;
            inner.fail_blocked_waiters();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.inner.lock().unwrap().canceled
    }
}

fn get_state_result_to_completion(value: GetStateResult) -> CompletionResult {
    match value {
        GetStateResult::Empty => CompletionResult::Empty,
        GetStateResult::Result(value) => CompletionResult::Success(value),
        GetStateResult::Failure(code, message) => CompletionResult::Failure(code, message),
    }
}

fn keys_result_to_completion(value: GetStateKeysResult) -> CompletionResult {
    match value {
        GetStateKeysResult::Result(keys) => {
            CompletionResult::Success(ProtobufRawEntryCodec::serialize_state_keys(keys))
        }
        GetStateKeysResult::Failure(code, message) => CompletionResult::Failure(code, message),
    }
}

fn sleep_result_to_completion(result: SleepResult) -> CompletionResult {
    match result {
        SleepResult::Fired => CompletionResult::Empty,
        SleepResult::Failure(code, message) => CompletionResult::Failure(code, message),
    }
}

fn entry_result_to_completion(result: EntryResult) -> CompletionResult {
    match result {
        EntryResult::Success(value) => CompletionResult::Success(value),
        EntryResult::Failure(code, message) => CompletionResult::Failure(code, message),
    }
}
