// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use rewind_service_protocol::message::{EncodingError, MessageType};
use rewind_service_protocol::pb;
use rewind_types::errors::{codes, InvocationError, InvocationErrorCode};
use rewind_types::identifiers::EntryIndex;
use rewind_types::journal::raw::RawEntryCodecError;
use rewind_types::journal::EntryType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("received unexpected message {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error(
        "journal mismatch at entry {index}: the handler issued a {expected} entry, \
         but the journal recorded a {actual} entry"
    )]
    EntryTypeMismatch {
        index: EntryIndex,
        /// The entry type of the operation the handler issued.
        expected: EntryType,
        /// The entry type the journal actually recorded at this index.
        actual: EntryType,
    },
    #[error(
        "journal mismatch at entry {index}: the {ty} request issued by the handler \
         diverges from the journaled one"
    )]
    JournalMismatch { index: EntryIndex, ty: EntryType },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Codec(#[from] RawEntryCodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the inbound message channel is full, the runtime is overrunning the configured capacity")]
    InputChannelFull,
    #[error("the runtime closed the invocation stream")]
    ConnectionClosed,
    #[error("the invocation was canceled")]
    Canceled,
    #[error("the invocation is already closed")]
    Closed,
    #[error("no activity within the abort timeout")]
    AbortTimeout,
    #[error("run closure failed: {0}")]
    RunFailed(#[source] anyhow::Error),
    #[error("handler failed: {0}")]
    HandlerFailed(#[source] anyhow::Error),
    #[error(transparent)]
    Failure(#[from] InvocationError),
}

impl Error {
    /// True for conditions that doom the whole invocation the moment an
    /// operation observes them. The operation latches the error for the
    /// driver and never resolves; the driver aborts the handler and reports
    /// the failure to the runtime.
    pub(crate) fn halts_invocation(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedMessage(_)
                | Error::ProtocolViolation(_)
                | Error::EntryTypeMismatch { .. }
                | Error::JournalMismatch { .. }
                | Error::Encoding(_)
                | Error::Codec(_)
                | Error::InputChannelFull
                | Error::RunFailed(_)
        )
    }

    pub(crate) fn code(&self) -> InvocationErrorCode {
        match self {
            Error::EntryTypeMismatch { .. } | Error::JournalMismatch { .. } => {
                codes::JOURNAL_MISMATCH
            }
            Error::UnexpectedMessage(_)
            | Error::ProtocolViolation(_)
            | Error::Encoding(_)
            | Error::Codec(_)
            | Error::InputChannelFull => codes::PROTOCOL_VIOLATION,
            Error::Canceled => codes::CANCELED,
            Error::Failure(e) => e.code(),
            _ => codes::INTERNAL,
        }
    }

    fn related_entry(&self) -> Option<(EntryIndex, EntryType)> {
        match self {
            // Reference the entry as the journal recorded it.
            Error::EntryTypeMismatch { index, actual, .. } => Some((*index, *actual)),
            Error::JournalMismatch { index, ty } => Some((*index, *ty)),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> pb::protocol::ErrorMessage {
        let related_entry = self.related_entry();
        pb::protocol::ErrorMessage {
            code: self.code().into(),
            message: self.to_string(),
            description: Default::default(),
            related_entry_index: related_entry.map(|(index, _)| index),
            related_entry_type: related_entry
                .map(|(_, ty)| u16::from(MessageType::from(ty)) as u32),
        }
    }
}

/// Outcome of user code: either a terminal failure, journaled as the result
/// of the invocation, or a retryable one, which abandons this attempt and
/// lets the runtime retry on its own timeline.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Terminal(InvocationError),
    #[error(transparent)]
    Retryable(anyhow::Error),
}

impl HandlerError {
    pub fn terminal(
        code: impl Into<InvocationErrorCode>,
        message: impl std::fmt::Display,
    ) -> Self {
        HandlerError::Terminal(InvocationError::new(code, message))
    }
}

impl From<InvocationError> for HandlerError {
    fn from(value: InvocationError) -> Self {
        HandlerError::Terminal(value)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(value: anyhow::Error) -> Self {
        HandlerError::Retryable(value)
    }
}

impl From<Error> for HandlerError {
    fn from(value: Error) -> Self {
        match value {
            Error::Failure(e) => HandlerError::Terminal(e),
            Error::Canceled => {
                HandlerError::Terminal(rewind_types::errors::CANCELED_INVOCATION_ERROR)
            }
            e => HandlerError::Retryable(anyhow::Error::new(e)),
        }
    }
}
