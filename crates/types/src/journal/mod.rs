// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The journal model. A journal is the ordered record of the effects one
//! invocation performed, each recorded as one entry.

use bytes::Bytes;
use bytestring::ByteString;

use crate::errors::InvocationErrorCode;
use crate::identifiers::EntryIndex;

mod entries;
pub mod raw;

pub use entries::*;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    // IO
    Input,
    Output,

    // State access
    GetState,
    SetState,
    ClearState,
    ClearAllState,
    GetStateKeys,

    // Syscalls
    Sleep,
    Call,
    OneWayCall,
    Awakeable,
    CompleteAwakeable,
    Run,

    // Unknown
    Custom,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resolved result of an entry that returns a value, as delivered by the
/// runtime either embedded in a replayed entry or through a completion frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Empty,
    Success(Bytes),
    Failure(InvocationErrorCode, ByteString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub entry_index: EntryIndex,
    pub result: CompletionResult,
}

impl Completion {
    pub fn new(entry_index: EntryIndex, result: CompletionResult) -> Self {
        Self {
            entry_index,
            result,
        }
    }
}
