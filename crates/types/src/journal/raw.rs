// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Raw journal entries: the serialized payload plus the header bits carried
//! by the entry frame. Payloads stay opaque until a codec materializes them.

use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntryHeader {
    Input,
    Output,
    GetState { is_completed: bool },
    SetState,
    ClearState,
    ClearAllState,
    GetStateKeys { is_completed: bool },
    Sleep { is_completed: bool },
    Call { is_completed: bool },
    OneWayCall,
    Awakeable { is_completed: bool },
    CompleteAwakeable,
    Run,
    Custom { code: u16, requires_ack: bool },
}

impl RawEntryHeader {
    pub fn ty(&self) -> EntryType {
        match self {
            RawEntryHeader::Input => EntryType::Input,
            RawEntryHeader::Output => EntryType::Output,
            RawEntryHeader::GetState { .. } => EntryType::GetState,
            RawEntryHeader::SetState => EntryType::SetState,
            RawEntryHeader::ClearState => EntryType::ClearState,
            RawEntryHeader::ClearAllState => EntryType::ClearAllState,
            RawEntryHeader::GetStateKeys { .. } => EntryType::GetStateKeys,
            RawEntryHeader::Sleep { .. } => EntryType::Sleep,
            RawEntryHeader::Call { .. } => EntryType::Call,
            RawEntryHeader::OneWayCall => EntryType::OneWayCall,
            RawEntryHeader::Awakeable { .. } => EntryType::Awakeable,
            RawEntryHeader::CompleteAwakeable => EntryType::CompleteAwakeable,
            RawEntryHeader::Run => EntryType::Run,
            RawEntryHeader::Custom { .. } => EntryType::Custom,
        }
    }

    pub fn is_completed(&self) -> Option<bool> {
        match self {
            RawEntryHeader::GetState { is_completed }
            | RawEntryHeader::GetStateKeys { is_completed }
            | RawEntryHeader::Sleep { is_completed }
            | RawEntryHeader::Call { is_completed }
            | RawEntryHeader::Awakeable { is_completed } => Some(*is_completed),
            _ => None,
        }
    }

    pub fn mark_completed(&mut self) {
        match self {
            RawEntryHeader::GetState { is_completed }
            | RawEntryHeader::GetStateKeys { is_completed }
            | RawEntryHeader::Sleep { is_completed }
            | RawEntryHeader::Call { is_completed }
            | RawEntryHeader::Awakeable { is_completed } => *is_completed = true,
            _ => {}
        }
    }
}

/// This struct represents a serialized journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub header: RawEntryHeader,
    pub entry: Bytes,
}

impl RawEntry {
    pub fn new(header: RawEntryHeader, entry: Bytes) -> Self {
        Self { header, entry }
    }

    pub fn ty(&self) -> EntryType {
        self.header.ty()
    }

    pub fn into_inner(self) -> (RawEntryHeader, Bytes) {
        (self.header, self.entry)
    }
}

pub trait RawEntryCodec {
    fn serialize(entry: Entry) -> RawEntry;

    fn deserialize(entry: &RawEntry) -> Result<Entry, RawEntryCodecError>;

    fn write_completion(
        entry: &mut RawEntry,
        completion_result: CompletionResult,
    ) -> Result<(), RawEntryCodecError>;
}

#[derive(Debug, thiserror::Error)]
#[error("cannot decode {ty:?}. {kind}")]
pub struct RawEntryCodecError {
    ty: EntryType,
    kind: ErrorKind,
}

impl RawEntryCodecError {
    pub fn new(ty: EntryType, kind: ErrorKind) -> Self {
        Self { ty, kind }
    }

    pub fn entry_type(&self) -> EntryType {
        self.ty
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("failed to decode: {source}")]
    Decode {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("field '{0}' is missing")]
    MissingField(&'static str),
}
