// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Module containing definitions of Protocol messages,
//! including encoding and decoding of headers and message payloads.

use super::pb;

use bytes::Bytes;
use prost::Message;
use rewind_types::identifiers::EntryIndex;
use rewind_types::journal::raw::RawEntry;
use rewind_types::journal::{Completion, CompletionResult};

mod encoding;
mod header;

pub use encoding::{Decoder, Encoder, EncodingError};
pub use header::{MessageHeader, MessageKind, MessageType, UnknownMessageType};

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    // Core
    Start(pb::protocol::StartMessage),
    Completion(pb::protocol::CompletionMessage),
    Suspension(pb::protocol::SuspensionMessage),
    Error(pb::protocol::ErrorMessage),
    EntryAck(pb::protocol::EntryAckMessage),
    End(pb::protocol::EndMessage),

    // Entries are not parsed at this point
    UnparsedEntry(RawEntry),
}

impl ProtocolMessage {
    pub fn new_start_message(
        id: Bytes,
        debug_id: String,
        key: String,
        known_entries: u32,
        partial_state: bool,
        state_map_entries: impl IntoIterator<Item = (Bytes, Bytes)>,
    ) -> Self {
        Self::Start(pb::protocol::StartMessage {
            id,
            debug_id,
            known_entries,
            partial_state,
            state_map: state_map_entries
                .into_iter()
                .map(|(key, value)| pb::protocol::start_message::StateEntry { key, value })
                .collect(),
            key,
        })
    }

    pub fn new_suspension(entry_indexes: impl IntoIterator<Item = EntryIndex>) -> Self {
        Self::Suspension(pb::protocol::SuspensionMessage {
            entry_indexes: entry_indexes.into_iter().collect(),
        })
    }

    pub fn new_entry_ack(entry_index: EntryIndex) -> Self {
        Self::EntryAck(pb::protocol::EntryAckMessage { entry_index })
    }

    pub fn new_end() -> Self {
        Self::End(pb::protocol::EndMessage {})
    }

    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            ProtocolMessage::Start(m) => m.encoded_len(),
            ProtocolMessage::Completion(m) => m.encoded_len(),
            ProtocolMessage::Suspension(m) => m.encoded_len(),
            ProtocolMessage::Error(m) => m.encoded_len(),
            ProtocolMessage::EntryAck(m) => m.encoded_len(),
            ProtocolMessage::End(m) => m.encoded_len(),
            ProtocolMessage::UnparsedEntry(entry) => entry.entry.len(),
        }
    }
}

impl From<Completion> for ProtocolMessage {
    fn from(completion: Completion) -> Self {
        ProtocolMessage::Completion(pb::protocol::CompletionMessage {
            entry_index: completion.entry_index,
            result: Some(match completion.result {
                CompletionResult::Empty => pb::protocol::completion_message::Result::Empty(()),
                CompletionResult::Success(b) => {
                    pb::protocol::completion_message::Result::Value(b)
                }
                CompletionResult::Failure(code, message) => {
                    pb::protocol::completion_message::Result::Failure(pb::protocol::Failure {
                        code: code.into(),
                        message: message.to_string(),
                    })
                }
            }),
        })
    }
}

impl From<RawEntry> for ProtocolMessage {
    fn from(value: RawEntry) -> Self {
        Self::UnparsedEntry(value)
    }
}

impl From<pb::protocol::CompletionMessage> for Completion {
    fn from(msg: pb::protocol::CompletionMessage) -> Self {
        Completion {
            entry_index: msg.entry_index,
            result: match msg.result {
                None | Some(pb::protocol::completion_message::Result::Empty(())) => {
                    CompletionResult::Empty
                }
                Some(pb::protocol::completion_message::Result::Value(value)) => {
                    CompletionResult::Success(value)
                }
                Some(pb::protocol::completion_message::Result::Failure(failure)) => {
                    CompletionResult::Failure(failure.code.into(), failure.message.into())
                }
            },
        }
    }
}
