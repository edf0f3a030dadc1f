// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conversions from the protobuf payloads to the journal entry model.

use super::pb::protocol::*;

use bytestring::ByteString;
use rewind_types::errors::InvocationErrorCode;
use rewind_types::journal::*;
use rewind_types::time::MillisSinceEpoch;

fn failure_into(failure: Failure) -> (InvocationErrorCode, ByteString) {
    (failure.code.into(), failure.message.into())
}

impl TryFrom<InputEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: InputEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::Input(InputEntry { value: msg.value }))
    }
}

impl TryFrom<OutputEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: OutputEntryMessage) -> Result<Self, Self::Error> {
        Ok(Entry::Output(OutputEntry {
            result: match msg.result.ok_or("result")? {
                output_entry_message::Result::Value(value) => EntryResult::Success(value),
                output_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    EntryResult::Failure(code, message)
                }
            },
        }))
    }
}

impl TryFrom<GetStateEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: GetStateEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::GetState(GetStateEntry {
            key: msg.key,
            value: msg.result.map(|v| match v {
                get_state_entry_message::Result::Empty(()) => GetStateResult::Empty,
                get_state_entry_message::Result::Value(value) => GetStateResult::Result(value),
                get_state_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    GetStateResult::Failure(code, message)
                }
            }),
        }))
    }
}

impl TryFrom<SetStateEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: SetStateEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::SetState(SetStateEntry {
            key: msg.key,
            value: msg.value,
        }))
    }
}

impl TryFrom<ClearStateEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: ClearStateEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::ClearState(ClearStateEntry { key: msg.key }))
    }
}

impl TryFrom<ClearAllStateEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(_: ClearAllStateEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::ClearAllState)
    }
}

impl TryFrom<GetStateKeysEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: GetStateKeysEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::GetStateKeys(GetStateKeysEntry {
            value: msg.result.map(|v| match v {
                get_state_keys_entry_message::Result::Value(state_keys) => {
                    GetStateKeysResult::Result(state_keys.keys)
                }
                get_state_keys_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    GetStateKeysResult::Failure(code, message)
                }
            }),
        }))
    }
}

impl TryFrom<SleepEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: SleepEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::Sleep(SleepEntry {
            wake_up_time: MillisSinceEpoch::new(msg.wake_up_time),
            result: msg.result.map(|r| match r {
                sleep_entry_message::Result::Empty(()) => SleepResult::Fired,
                sleep_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    SleepResult::Failure(code, message)
                }
            }),
        }))
    }
}

impl TryFrom<CallEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: CallEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::Call(CallEntry {
            request: InvokeRequest {
                service_name: msg.service_name.into(),
                handler_name: msg.handler_name.into(),
                key: msg.key.into(),
                parameter: msg.parameter,
            },
            result: msg.result.map(|v| match v {
                call_entry_message::Result::Value(value) => EntryResult::Success(value),
                call_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    EntryResult::Failure(code, message)
                }
            }),
        }))
    }
}

impl TryFrom<OneWayCallEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: OneWayCallEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::OneWayCall(OneWayCallEntry {
            request: InvokeRequest {
                service_name: msg.service_name.into(),
                handler_name: msg.handler_name.into(),
                key: msg.key.into(),
                parameter: msg.parameter,
            },
            invoke_time: msg.invoke_time,
        }))
    }
}

impl TryFrom<AwakeableEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: AwakeableEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::Awakeable(AwakeableEntry {
            result: msg.result.map(|v| match v {
                awakeable_entry_message::Result::Value(value) => EntryResult::Success(value),
                awakeable_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    EntryResult::Failure(code, message)
                }
            }),
        }))
    }
}

impl TryFrom<CompleteAwakeableEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: CompleteAwakeableEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::CompleteAwakeable(CompleteAwakeableEntry {
            id: msg.id.into(),
            result: match msg.result.ok_or("result")? {
                complete_awakeable_entry_message::Result::Value(value) => {
                    EntryResult::Success(value)
                }
                complete_awakeable_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    EntryResult::Failure(code, message)
                }
            },
        }))
    }
}

impl TryFrom<RunEntryMessage> for Entry {
    type Error = &'static str;

    fn try_from(msg: RunEntryMessage) -> Result<Self, Self::Error> {
        Ok(Self::Run(RunEntry {
            result: match msg.result.ok_or("result")? {
                run_entry_message::Result::Value(value) => EntryResult::Success(value),
                run_entry_message::Result::Failure(failure) => {
                    let (code, message) = failure_into(failure);
                    EntryResult::Failure(code, message)
                }
            },
        }))
    }
}
