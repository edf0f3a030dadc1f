// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use std::fmt;

/// Index of an entry in the journal of one invocation. Entries are numbered
/// starting from 1, in the order the handler performs them.
pub type EntryIndex = u32;

/// Identifier of a single invocation.
///
/// The runtime assigns it and the SDK never interprets it; it is echoed back
/// verbatim inside awakeable identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationId(Bytes);

impl InvocationId {
    pub fn from_bytes(bytes: Bytes) -> Self {
        InvocationId(bytes)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for InvocationId {
    fn from(value: Bytes) -> Self {
        InvocationId(value)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
