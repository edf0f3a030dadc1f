// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use bytes::BufMut;
use bytes::BytesMut;
use rewind_types::identifiers::{EntryIndex, InvocationId};
use std::fmt::Display;
use std::mem::size_of;
use std::str::FromStr;

/// Printable identifier handed to external parties to resolve an awakeable
/// entry: the invocation id plus the entry index, base64 encoded for wider
/// language support.
const AWAKEABLE_PREFIX: &str = "awk_1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwakeableIdentifier {
    invocation_id: InvocationId,
    entry_index: EntryIndex,
}

impl AwakeableIdentifier {
    pub fn new(invocation_id: InvocationId, entry_index: EntryIndex) -> Self {
        Self {
            invocation_id,
            entry_index,
        }
    }

    pub fn into_inner(self) -> (InvocationId, EntryIndex) {
        (self.invocation_id, self.entry_index)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdDecodeError {
    #[error("unexpected identifier prefix")]
    Prefix,
    #[error("identifier is not valid base64")]
    Codec,
    #[error("identifier is too short")]
    Length,
}

impl FromStr for AwakeableIdentifier {
    type Err = IdDecodeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let remaining = input
            .strip_prefix(AWAKEABLE_PREFIX)
            .ok_or(IdDecodeError::Prefix)?;

        let buffer = URL_SAFE.decode(remaining).map_err(|_| IdDecodeError::Codec)?;

        if buffer.len() < size_of::<EntryIndex>() {
            return Err(IdDecodeError::Length);
        }
        let split_at = buffer.len() - size_of::<EntryIndex>();

        let invocation_id = InvocationId::from_bytes(buffer[..split_at].to_vec().into());
        let entry_index = EntryIndex::from_be_bytes(
            buffer[split_at..]
                .try_into()
                // Unwrap is safe because we check the size above.
                .unwrap(),
        );

        Ok(Self {
            invocation_id,
            entry_index,
        })
    }
}

impl Display for AwakeableIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut input_buf =
            BytesMut::with_capacity(self.invocation_id.as_bytes().len() + size_of::<EntryIndex>());
        input_buf.put_slice(self.invocation_id.as_bytes());
        input_buf.put_u32(self.entry_index);

        write!(f, "{}{}", AWAKEABLE_PREFIX, URL_SAFE.encode(input_buf))
    }
}
