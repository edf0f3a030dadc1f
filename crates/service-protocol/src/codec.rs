// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::pb::protocol;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use rewind_types::journal::raw::*;
use rewind_types::journal::{
    CompletableEntry, CompletionResult, Entry, EntryResult, EntryType, GetStateKeysResult,
    GetStateResult,
};
use std::mem;

/// This macro generates the pattern matching with arms per entry.
/// For each entry it first executes `Message#decode` and then `try_into()`.
/// It expects that for each `{...}Entry` there is a valid `TryFrom<{...}Message>` implementation with `Error = &'static str`.
/// These implementations are available in [`super::pb_into`].
macro_rules! match_decode {
    ($ty:expr, $buf:expr, { $($variant:ident),* }) => {
        match $ty {
              $(EntryType::$variant => paste::paste! {
                  protocol::[<$variant EntryMessage>]::decode($buf)
                    .map_err(|e| RawEntryCodecError::new($ty, ErrorKind::Decode { source: e.into() }))
                    .and_then(|msg| msg.try_into().map_err(|f| RawEntryCodecError::new($ty, ErrorKind::MissingField(f))))
              },)*
             EntryType::Custom => Ok(Entry::Custom($buf.copy_to_bytes($buf.remaining()))),
        }
    };
}

#[derive(Debug, Default, Copy, Clone)]
pub struct ProtobufRawEntryCodec;

impl ProtobufRawEntryCodec {
    /// Decodes the payload of a successful get-state-keys completion.
    pub fn deserialize_state_keys(buf: Bytes) -> Result<Vec<Bytes>, RawEntryCodecError> {
        protocol::get_state_keys_entry_message::StateKeys::decode(buf)
            .map(|sk| sk.keys)
            .map_err(|e| {
                RawEntryCodecError::new(
                    EntryType::GetStateKeys,
                    ErrorKind::Decode { source: e.into() },
                )
            })
    }

    /// Encodes a get-state-keys result the way the runtime delivers it, for
    /// answering the operation from eagerly received state.
    pub fn serialize_state_keys(keys: Vec<Bytes>) -> Bytes {
        protocol::get_state_keys_entry_message::StateKeys { keys }
            .encode_to_vec()
            .into()
    }

    fn serialize_invoke_request(
        request: rewind_types::journal::InvokeRequest,
    ) -> (String, String, String, Bytes) {
        (
            request.service_name.into(),
            request.handler_name.into(),
            request.key.into(),
            request.parameter,
        )
    }
}

impl RawEntryCodec for ProtobufRawEntryCodec {
    fn serialize(entry: Entry) -> RawEntry {
        match entry {
            Entry::Input(entry) => RawEntry::new(
                RawEntryHeader::Input,
                protocol::InputEntryMessage { value: entry.value }
                    .encode_to_vec()
                    .into(),
            ),
            Entry::Output(entry) => RawEntry::new(
                RawEntryHeader::Output,
                protocol::OutputEntryMessage {
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::output_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::output_entry_message::Result::Failure(protocol::Failure {
                                code: code.into(),
                                message: message.to_string(),
                            })
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::GetState(entry) => RawEntry::new(
                RawEntryHeader::GetState {
                    is_completed: entry.is_completed(),
                },
                protocol::GetStateEntryMessage {
                    key: entry.key,
                    result: entry.value.map(|value| match value {
                        GetStateResult::Empty => protocol::get_state_entry_message::Result::Empty(()),
                        GetStateResult::Result(v) => {
                            protocol::get_state_entry_message::Result::Value(v)
                        }
                        GetStateResult::Failure(code, message) => {
                            protocol::get_state_entry_message::Result::Failure(protocol::Failure {
                                code: code.into(),
                                message: message.to_string(),
                            })
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::SetState(entry) => RawEntry::new(
                RawEntryHeader::SetState,
                protocol::SetStateEntryMessage {
                    key: entry.key,
                    value: entry.value,
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::ClearState(entry) => RawEntry::new(
                RawEntryHeader::ClearState,
                protocol::ClearStateEntryMessage { key: entry.key }
                    .encode_to_vec()
                    .into(),
            ),
            Entry::ClearAllState => RawEntry::new(
                RawEntryHeader::ClearAllState,
                protocol::ClearAllStateEntryMessage {}.encode_to_vec().into(),
            ),
            Entry::GetStateKeys(entry) => RawEntry::new(
                RawEntryHeader::GetStateKeys {
                    is_completed: entry.is_completed(),
                },
                protocol::GetStateKeysEntryMessage {
                    result: entry.value.map(|value| match value {
                        GetStateKeysResult::Result(keys) => {
                            protocol::get_state_keys_entry_message::Result::Value(
                                protocol::get_state_keys_entry_message::StateKeys { keys },
                            )
                        }
                        GetStateKeysResult::Failure(code, message) => {
                            protocol::get_state_keys_entry_message::Result::Failure(
                                protocol::Failure {
                                    code: code.into(),
                                    message: message.to_string(),
                                },
                            )
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::Sleep(entry) => RawEntry::new(
                RawEntryHeader::Sleep {
                    is_completed: entry.is_completed(),
                },
                protocol::SleepEntryMessage {
                    wake_up_time: entry.wake_up_time.as_u64(),
                    result: entry.result.map(|result| match result {
                        rewind_types::journal::SleepResult::Fired => {
                            protocol::sleep_entry_message::Result::Empty(())
                        }
                        rewind_types::journal::SleepResult::Failure(code, message) => {
                            protocol::sleep_entry_message::Result::Failure(protocol::Failure {
                                code: code.into(),
                                message: message.to_string(),
                            })
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::Call(entry) => {
                let is_completed = entry.is_completed();
                let (service_name, handler_name, key, parameter) =
                    Self::serialize_invoke_request(entry.request);
                RawEntry::new(
                    RawEntryHeader::Call { is_completed },
                    protocol::CallEntryMessage {
                        service_name,
                        handler_name,
                        key,
                        parameter,
                        result: entry.result.map(|result| match result {
                            EntryResult::Success(value) => {
                                protocol::call_entry_message::Result::Value(value)
                            }
                            EntryResult::Failure(code, message) => {
                                protocol::call_entry_message::Result::Failure(protocol::Failure {
                                    code: code.into(),
                                    message: message.to_string(),
                                })
                            }
                        }),
                    }
                    .encode_to_vec()
                    .into(),
                )
            }
            Entry::OneWayCall(entry) => {
                let (service_name, handler_name, key, parameter) =
                    Self::serialize_invoke_request(entry.request);
                RawEntry::new(
                    RawEntryHeader::OneWayCall,
                    protocol::OneWayCallEntryMessage {
                        service_name,
                        handler_name,
                        key,
                        parameter,
                        invoke_time: entry.invoke_time,
                    }
                    .encode_to_vec()
                    .into(),
                )
            }
            Entry::Awakeable(entry) => RawEntry::new(
                RawEntryHeader::Awakeable {
                    is_completed: entry.is_completed(),
                },
                protocol::AwakeableEntryMessage {
                    result: entry.result.map(|result| match result {
                        EntryResult::Success(value) => {
                            protocol::awakeable_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::awakeable_entry_message::Result::Failure(protocol::Failure {
                                code: code.into(),
                                message: message.to_string(),
                            })
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::CompleteAwakeable(entry) => RawEntry::new(
                RawEntryHeader::CompleteAwakeable,
                protocol::CompleteAwakeableEntryMessage {
                    id: entry.id.to_string(),
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::complete_awakeable_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::complete_awakeable_entry_message::Result::Failure(
                                protocol::Failure {
                                    code: code.into(),
                                    message: message.to_string(),
                                },
                            )
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::Run(entry) => RawEntry::new(
                RawEntryHeader::Run,
                protocol::RunEntryMessage {
                    result: Some(match entry.result {
                        EntryResult::Success(value) => {
                            protocol::run_entry_message::Result::Value(value)
                        }
                        EntryResult::Failure(code, message) => {
                            protocol::run_entry_message::Result::Failure(protocol::Failure {
                                code: code.into(),
                                message: message.to_string(),
                            })
                        }
                    }),
                }
                .encode_to_vec()
                .into(),
            ),
            Entry::Custom(bytes) => RawEntry::new(
                RawEntryHeader::Custom {
                    code: 0xFC00,
                    requires_ack: false,
                },
                bytes,
            ),
        }
    }

    fn deserialize(entry: &RawEntry) -> Result<Entry, RawEntryCodecError> {
        // We clone the entry Bytes here to ensure that the generated Message::decode
        // invocation reuses the same underlying byte array.
        match_decode!(entry.ty(), entry.entry.clone(), {
            Input,
            Output,
            GetState,
            SetState,
            ClearState,
            ClearAllState,
            GetStateKeys,
            Sleep,
            Call,
            OneWayCall,
            Awakeable,
            CompleteAwakeable,
            Run
        })
    }

    fn write_completion(
        entry: &mut RawEntry,
        completion_result: CompletionResult,
    ) -> Result<(), RawEntryCodecError> {
        debug_assert_eq!(
            entry.header.is_completed(),
            Some(false),
            "entry '{:?}' is already completed",
            entry
        );

        // Prepare the result to serialize in protobuf
        let completion_result_message = match completion_result {
            CompletionResult::Empty => protocol::completion_message::Result::Empty(()),
            CompletionResult::Success(b) => protocol::completion_message::Result::Value(b),
            CompletionResult::Failure(code, message) => {
                protocol::completion_message::Result::Failure(protocol::Failure {
                    code: code.into(),
                    message: message.to_string(),
                })
            }
        };

        // Prepare a buffer for the result
        let len = entry.entry.len() + completion_result_message.encoded_len();
        let mut result_buf = BytesMut::with_capacity(len);

        // Concatenate entry + result
        // The reason why encoding completion_message_result works is that by convention the tags
        // of completion message are the same used by completable entries.
        // See https://protobuf.dev/programming-guides/encoding/#last-one-wins
        result_buf.put(mem::take(&mut entry.entry));
        completion_result_message.encode(&mut result_buf);

        // Write back to the entry the new buffer and the completed flag
        entry.entry = result_buf.freeze();
        entry.header.mark_completed();

        Ok(())
    }
}
