// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::*;

use crate::time::MillisSinceEpoch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    // IO
    Input(InputEntry),
    Output(OutputEntry),

    // State access
    GetState(GetStateEntry),
    SetState(SetStateEntry),
    ClearState(ClearStateEntry),
    ClearAllState,
    GetStateKeys(GetStateKeysEntry),

    // Syscalls
    Sleep(SleepEntry),
    Call(CallEntry),
    OneWayCall(OneWayCallEntry),
    Awakeable(AwakeableEntry),
    CompleteAwakeable(CompleteAwakeableEntry),
    Run(RunEntry),

    Custom(Bytes),
}

impl Entry {
    pub fn input(value: impl Into<Bytes>) -> Self {
        Entry::Input(InputEntry {
            value: value.into(),
        })
    }

    pub fn output(result: EntryResult) -> Self {
        Entry::Output(OutputEntry { result })
    }

    pub fn get_state(key: impl Into<Bytes>, value: Option<GetStateResult>) -> Self {
        Entry::GetState(GetStateEntry {
            key: key.into(),
            value,
        })
    }

    pub fn set_state(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Entry::SetState(SetStateEntry {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn clear_state(key: impl Into<Bytes>) -> Self {
        Entry::ClearState(ClearStateEntry { key: key.into() })
    }

    pub fn clear_all_state() -> Self {
        Entry::ClearAllState
    }

    pub fn get_state_keys(value: Option<GetStateKeysResult>) -> Self {
        Entry::GetStateKeys(GetStateKeysEntry { value })
    }

    pub fn sleep(wake_up_time: MillisSinceEpoch, result: Option<SleepResult>) -> Self {
        Entry::Sleep(SleepEntry {
            wake_up_time,
            result,
        })
    }

    pub fn call(request: InvokeRequest, result: Option<EntryResult>) -> Self {
        Entry::Call(CallEntry { request, result })
    }

    pub fn one_way_call(request: InvokeRequest, invoke_time: Option<MillisSinceEpoch>) -> Self {
        Entry::OneWayCall(OneWayCallEntry {
            request,
            invoke_time: invoke_time.map(|t| t.as_u64()).unwrap_or_default(),
        })
    }

    pub fn awakeable(result: Option<EntryResult>) -> Self {
        Entry::Awakeable(AwakeableEntry { result })
    }

    pub fn complete_awakeable(id: impl Into<ByteString>, result: EntryResult) -> Self {
        Entry::CompleteAwakeable(CompleteAwakeableEntry {
            id: id.into(),
            result,
        })
    }

    pub fn run(result: EntryResult) -> Self {
        Entry::Run(RunEntry { result })
    }

    pub fn ty(&self) -> EntryType {
        match self {
            Entry::Input(_) => EntryType::Input,
            Entry::Output(_) => EntryType::Output,
            Entry::GetState(_) => EntryType::GetState,
            Entry::SetState(_) => EntryType::SetState,
            Entry::ClearState(_) => EntryType::ClearState,
            Entry::ClearAllState => EntryType::ClearAllState,
            Entry::GetStateKeys(_) => EntryType::GetStateKeys,
            Entry::Sleep(_) => EntryType::Sleep,
            Entry::Call(_) => EntryType::Call,
            Entry::OneWayCall(_) => EntryType::OneWayCall,
            Entry::Awakeable(_) => EntryType::Awakeable,
            Entry::CompleteAwakeable(_) => EntryType::CompleteAwakeable,
            Entry::Run(_) => EntryType::Run,
            Entry::Custom(_) => EntryType::Custom,
        }
    }
}

/// Outcome recorded for an entry: the value the operation produced, or the
/// failure the handler observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryResult {
    Success(Bytes),
    Failure(InvocationErrorCode, ByteString),
}

/// Entries with a completion slot the runtime may fill after the entry was
/// journaled.
pub trait CompletableEntry: private::Sealed {
    /// Returns true if the entry is completed.
    fn is_completed(&self) -> bool;
}

mod private {
    use super::*;

    pub trait Sealed {}
    impl Sealed for GetStateEntry {}
    impl Sealed for GetStateKeysEntry {}
    impl Sealed for SleepEntry {}
    impl Sealed for CallEntry {}
    impl Sealed for AwakeableEntry {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub result: EntryResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetStateResult {
    Empty,
    Result(Bytes),
    Failure(InvocationErrorCode, ByteString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateEntry {
    pub key: Bytes,
    pub value: Option<GetStateResult>,
}

impl CompletableEntry for GetStateEntry {
    fn is_completed(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateEntry {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearStateEntry {
    pub key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetStateKeysResult {
    Result(Vec<Bytes>),
    Failure(InvocationErrorCode, ByteString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateKeysEntry {
    pub value: Option<GetStateKeysResult>,
}

impl CompletableEntry for GetStateKeysEntry {
    fn is_completed(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SleepResult {
    Fired,
    Failure(InvocationErrorCode, ByteString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepEntry {
    pub wake_up_time: MillisSinceEpoch,
    pub result: Option<SleepResult>,
}

impl CompletableEntry for SleepEntry {
    fn is_completed(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub service_name: ByteString,
    pub handler_name: ByteString,
    pub key: ByteString,
    pub parameter: Bytes,
}

impl InvokeRequest {
    pub fn new(
        service_name: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler_name: impl Into<ByteString>,
        parameter: impl Into<Bytes>,
    ) -> Self {
        InvokeRequest {
            service_name: service_name.into(),
            handler_name: handler_name.into(),
            key: key.into(),
            parameter: parameter.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    pub request: InvokeRequest,
    pub result: Option<EntryResult>,
}

impl CompletableEntry for CallEntry {
    fn is_completed(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneWayCallEntry {
    pub request: InvokeRequest,
    pub invoke_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwakeableEntry {
    pub result: Option<EntryResult>,
}

impl CompletableEntry for AwakeableEntry {
    fn is_completed(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteAwakeableEntry {
    pub id: ByteString,
    pub result: EntryResult,
}

/// Result of a side effect closure, always journaled together with the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEntry {
    pub result: EntryResult,
}
