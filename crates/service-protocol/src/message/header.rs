// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use rewind_types::journal::EntryType;

const CUSTOM_MESSAGE_MASK: u16 = 0xFC00;
const COMPLETED_MASK: u64 = 0x0001_0000_0000;
const VERSION_MASK: u64 = 0x03FF_0000_0000;
const REQUIRES_ACK_MASK: u64 = 0x8000_0000_0000;

type MessageTypeId = u16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Core,
    IO,
    State,
    Syscall,
    CustomEntry,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    Start,
    Completion,
    Suspension,
    Error,
    EntryAck,
    End,
    InputEntry,
    OutputEntry,
    GetStateEntry,
    SetStateEntry,
    ClearStateEntry,
    ClearAllStateEntry,
    GetStateKeysEntry,
    SleepEntry,
    CallEntry,
    OneWayCallEntry,
    AwakeableEntry,
    CompleteAwakeableEntry,
    RunEntry,
    CustomEntry(u16),
}

impl MessageType {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageType::Start
            | MessageType::Completion
            | MessageType::Suspension
            | MessageType::Error
            | MessageType::EntryAck
            | MessageType::End => MessageKind::Core,
            MessageType::InputEntry | MessageType::OutputEntry => MessageKind::IO,
            MessageType::GetStateEntry
            | MessageType::SetStateEntry
            | MessageType::ClearStateEntry
            | MessageType::ClearAllStateEntry
            | MessageType::GetStateKeysEntry => MessageKind::State,
            MessageType::SleepEntry
            | MessageType::CallEntry
            | MessageType::OneWayCallEntry
            | MessageType::AwakeableEntry
            | MessageType::CompleteAwakeableEntry
            | MessageType::RunEntry => MessageKind::Syscall,
            MessageType::CustomEntry(_) => MessageKind::CustomEntry,
        }
    }

    fn has_completed_flag(&self) -> bool {
        matches!(
            self,
            MessageType::GetStateEntry
                | MessageType::GetStateKeysEntry
                | MessageType::SleepEntry
                | MessageType::CallEntry
                | MessageType::AwakeableEntry
        )
    }

    fn has_protocol_version(&self) -> bool {
        *self == MessageType::Start
    }

    fn has_requires_ack_flag(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::IO | MessageKind::State | MessageKind::Syscall | MessageKind::CustomEntry
        )
    }
}

const START_MESSAGE_TYPE: u16 = 0x0000;
const COMPLETION_MESSAGE_TYPE: u16 = 0x0001;
const SUSPENSION_MESSAGE_TYPE: u16 = 0x0002;
const ERROR_MESSAGE_TYPE: u16 = 0x0003;
const ENTRY_ACK_MESSAGE_TYPE: u16 = 0x0004;
const END_MESSAGE_TYPE: u16 = 0x0005;
const INPUT_ENTRY_MESSAGE_TYPE: u16 = 0x0400;
const OUTPUT_ENTRY_MESSAGE_TYPE: u16 = 0x0401;
const GET_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0800;
const SET_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0801;
const CLEAR_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0802;
const CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE: u16 = 0x0803;
const GET_STATE_KEYS_ENTRY_MESSAGE_TYPE: u16 = 0x0804;
const SLEEP_ENTRY_MESSAGE_TYPE: u16 = 0x0C00;
const CALL_ENTRY_MESSAGE_TYPE: u16 = 0x0C01;
const ONE_WAY_CALL_ENTRY_MESSAGE_TYPE: u16 = 0x0C02;
const AWAKEABLE_ENTRY_MESSAGE_TYPE: u16 = 0x0C03;
const COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE: u16 = 0x0C04;
const RUN_ENTRY_MESSAGE_TYPE: u16 = 0x0C05;

impl From<MessageType> for MessageTypeId {
    fn from(mt: MessageType) -> Self {
        match mt {
            MessageType::Start => START_MESSAGE_TYPE,
            MessageType::Completion => COMPLETION_MESSAGE_TYPE,
            MessageType::Suspension => SUSPENSION_MESSAGE_TYPE,
            MessageType::Error => ERROR_MESSAGE_TYPE,
            MessageType::EntryAck => ENTRY_ACK_MESSAGE_TYPE,
            MessageType::End => END_MESSAGE_TYPE,
            MessageType::InputEntry => INPUT_ENTRY_MESSAGE_TYPE,
            MessageType::OutputEntry => OUTPUT_ENTRY_MESSAGE_TYPE,
            MessageType::GetStateEntry => GET_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::SetStateEntry => SET_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::ClearStateEntry => CLEAR_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::ClearAllStateEntry => CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE,
            MessageType::GetStateKeysEntry => GET_STATE_KEYS_ENTRY_MESSAGE_TYPE,
            MessageType::SleepEntry => SLEEP_ENTRY_MESSAGE_TYPE,
            MessageType::CallEntry => CALL_ENTRY_MESSAGE_TYPE,
            MessageType::OneWayCallEntry => ONE_WAY_CALL_ENTRY_MESSAGE_TYPE,
            MessageType::AwakeableEntry => AWAKEABLE_ENTRY_MESSAGE_TYPE,
            MessageType::CompleteAwakeableEntry => COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE,
            MessageType::RunEntry => RUN_ENTRY_MESSAGE_TYPE,
            MessageType::CustomEntry(id) => id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message code {0:#x}")]
pub struct UnknownMessageType(pub u16);

impl TryFrom<MessageTypeId> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: MessageTypeId) -> Result<Self, UnknownMessageType> {
        match value {
            START_MESSAGE_TYPE => Ok(MessageType::Start),
            COMPLETION_MESSAGE_TYPE => Ok(MessageType::Completion),
            SUSPENSION_MESSAGE_TYPE => Ok(MessageType::Suspension),
            ERROR_MESSAGE_TYPE => Ok(MessageType::Error),
            ENTRY_ACK_MESSAGE_TYPE => Ok(MessageType::EntryAck),
            END_MESSAGE_TYPE => Ok(MessageType::End),
            INPUT_ENTRY_MESSAGE_TYPE => Ok(MessageType::InputEntry),
            OUTPUT_ENTRY_MESSAGE_TYPE => Ok(MessageType::OutputEntry),
            GET_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::GetStateEntry),
            SET_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::SetStateEntry),
            CLEAR_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::ClearStateEntry),
            CLEAR_ALL_STATE_ENTRY_MESSAGE_TYPE => Ok(MessageType::ClearAllStateEntry),
            GET_STATE_KEYS_ENTRY_MESSAGE_TYPE => Ok(MessageType::GetStateKeysEntry),
            SLEEP_ENTRY_MESSAGE_TYPE => Ok(MessageType::SleepEntry),
            CALL_ENTRY_MESSAGE_TYPE => Ok(MessageType::CallEntry),
            ONE_WAY_CALL_ENTRY_MESSAGE_TYPE => Ok(MessageType::OneWayCallEntry),
            AWAKEABLE_ENTRY_MESSAGE_TYPE => Ok(MessageType::AwakeableEntry),
            COMPLETE_AWAKEABLE_ENTRY_MESSAGE_TYPE => Ok(MessageType::CompleteAwakeableEntry),
            RUN_ENTRY_MESSAGE_TYPE => Ok(MessageType::RunEntry),
            v if ((v & CUSTOM_MESSAGE_MASK) != 0) => Ok(MessageType::CustomEntry(v)),
            v => Err(UnknownMessageType(v)),
        }
    }
}

impl TryFrom<MessageType> for EntryType {
    type Error = MessageType;

    fn try_from(value: MessageType) -> Result<Self, MessageType> {
        match value {
            MessageType::InputEntry => Ok(EntryType::Input),
            MessageType::OutputEntry => Ok(EntryType::Output),
            MessageType::GetStateEntry => Ok(EntryType::GetState),
            MessageType::SetStateEntry => Ok(EntryType::SetState),
            MessageType::ClearStateEntry => Ok(EntryType::ClearState),
            MessageType::ClearAllStateEntry => Ok(EntryType::ClearAllState),
            MessageType::GetStateKeysEntry => Ok(EntryType::GetStateKeys),
            MessageType::SleepEntry => Ok(EntryType::Sleep),
            MessageType::CallEntry => Ok(EntryType::Call),
            MessageType::OneWayCallEntry => Ok(EntryType::OneWayCall),
            MessageType::AwakeableEntry => Ok(EntryType::Awakeable),
            MessageType::CompleteAwakeableEntry => Ok(EntryType::CompleteAwakeable),
            MessageType::RunEntry => Ok(EntryType::Run),
            MessageType::CustomEntry(_) => Ok(EntryType::Custom),
            MessageType::Start
            | MessageType::Completion
            | MessageType::Suspension
            | MessageType::Error
            | MessageType::EntryAck
            | MessageType::End => Err(value),
        }
    }
}

impl From<EntryType> for MessageType {
    fn from(value: EntryType) -> Self {
        match value {
            EntryType::Input => MessageType::InputEntry,
            EntryType::Output => MessageType::OutputEntry,
            EntryType::GetState => MessageType::GetStateEntry,
            EntryType::SetState => MessageType::SetStateEntry,
            EntryType::ClearState => MessageType::ClearStateEntry,
            EntryType::ClearAllState => MessageType::ClearAllStateEntry,
            EntryType::GetStateKeys => MessageType::GetStateKeysEntry,
            EntryType::Sleep => MessageType::SleepEntry,
            EntryType::Call => MessageType::CallEntry,
            EntryType::OneWayCall => MessageType::OneWayCallEntry,
            EntryType::Awakeable => MessageType::AwakeableEntry,
            EntryType::CompleteAwakeable => MessageType::CompleteAwakeableEntry,
            EntryType::Run => MessageType::RunEntry,
            EntryType::Custom => MessageType::CustomEntry(CUSTOM_MESSAGE_MASK),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    ty: MessageType,
    length: u32,

    // --- Flags
    /// Only completable entries carry the completed flag.
    /// See [`MessageType::has_completed_flag`].
    completed_flag: Option<bool>,
    /// Only the start message carries the protocol version.
    protocol_version: Option<u16>,
    /// All entry messages may carry the requires-ack flag.
    requires_ack_flag: Option<bool>,
}

impl MessageHeader {
    #[inline]
    pub fn new(ty: MessageType, length: u32) -> Self {
        Self::_new(ty, None, None, None, length)
    }

    #[inline]
    pub fn new_start(protocol_version: u16, length: u32) -> Self {
        Self::_new(
            MessageType::Start,
            None,
            Some(protocol_version),
            None,
            length,
        )
    }

    #[inline]
    pub fn new_entry_header(
        ty: MessageType,
        completed_flag: Option<bool>,
        requires_ack_flag: Option<bool>,
        length: u32,
    ) -> Self {
        debug_assert!(completed_flag.is_some() == ty.has_completed_flag());
        debug_assert!(requires_ack_flag.is_some() == ty.has_requires_ack_flag());

        Self::_new(ty, completed_flag, None, requires_ack_flag, length)
    }

    #[inline]
    fn _new(
        ty: MessageType,
        completed_flag: Option<bool>,
        protocol_version: Option<u16>,
        requires_ack_flag: Option<bool>,
        length: u32,
    ) -> Self {
        MessageHeader {
            ty,
            length,
            completed_flag,
            protocol_version,
            requires_ack_flag,
        }
    }

    #[inline]
    pub fn message_kind(&self) -> MessageKind {
        self.ty.kind()
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    #[inline]
    pub fn completed(&self) -> Option<bool> {
        self.completed_flag
    }

    #[inline]
    pub fn protocol_version(&self) -> Option<u16> {
        self.protocol_version
    }

    #[inline]
    pub fn requires_ack(&self) -> Option<bool> {
        self.requires_ack_flag
    }

    #[inline]
    pub fn frame_length(&self) -> u32 {
        self.length
    }
}

macro_rules! read_flag_if {
    ($cond:expr, $value:expr, $mask:expr) => {
        if $cond {
            Some(($value & $mask) != 0)
        } else {
            None
        }
    };
}

impl TryFrom<u64> for MessageHeader {
    type Error = UnknownMessageType;

    /// Deserialize the header. Layout, msb to lsb: u16 type code, u16 flags,
    /// u32 payload length.
    fn try_from(value: u64) -> Result<Self, UnknownMessageType> {
        let ty_code = (value >> 48) as u16;
        let ty: MessageType = ty_code.try_into()?;

        let completed_flag = read_flag_if!(ty.has_completed_flag(), value, COMPLETED_MASK);
        let protocol_version = if ty.has_protocol_version() {
            Some(((value & VERSION_MASK) >> 32) as u16)
        } else {
            None
        };
        let requires_ack_flag = read_flag_if!(ty.has_requires_ack_flag(), value, REQUIRES_ACK_MASK);
        let length = value as u32;

        Ok(MessageHeader::_new(
            ty,
            completed_flag,
            protocol_version,
            requires_ack_flag,
            length,
        ))
    }
}

macro_rules! write_flag {
    ($flag:expr, $value:expr, $mask:expr) => {
        if let Some(true) = $flag {
            *$value |= $mask;
        }
    };
}

impl From<MessageHeader> for u64 {
    /// Serialize the header. Layout, msb to lsb: u16 type code, u16 flags,
    /// u32 payload length.
    fn from(message_header: MessageHeader) -> Self {
        let mut res =
            ((u16::from(message_header.ty) as u64) << 48) | (message_header.length as u64);

        write_flag!(message_header.completed_flag, &mut res, COMPLETED_MASK);
        if let Some(protocol_version) = message_header.protocol_version {
            res |= ((protocol_version as u64) << 32) & VERSION_MASK;
        }
        write_flag!(
            message_header.requires_ack_flag,
            &mut res,
            REQUIRES_ACK_MASK
        );

        res
    }
}

#[cfg(test)]
mod tests {

    use super::{MessageKind::*, MessageType::*, *};

    impl MessageHeader {
        fn new_completable_entry(ty: MessageType, completed: bool, length: u32) -> Self {
            Self::new_entry_header(ty, Some(completed), Some(false), length)
        }
    }

    macro_rules! roundtrip_test {
        ($test_name:ident, $header:expr, $ty:expr, $kind:expr, $len:expr) => {
            roundtrip_test!($test_name, $header, $ty, $kind, $len, None, None, None);
        };
        ($test_name:ident, $header:expr, $ty:expr, $kind:expr, $len:expr, version: $version:expr) => {
            roundtrip_test!(
                $test_name,
                $header,
                $ty,
                $kind,
                $len,
                None,
                Some($version),
                None
            );
        };
        ($test_name:ident, $header:expr, $ty:expr, $kind:expr, $len:expr, requires_ack: $requires_ack:expr) => {
            roundtrip_test!(
                $test_name,
                $header,
                $ty,
                $kind,
                $len,
                None,
                None,
                Some($requires_ack)
            );
        };
        ($test_name:ident, $header:expr, $ty:expr, $kind:expr, $len:expr, requires_ack: $requires_ack:expr, completed: $completed:expr) => {
            roundtrip_test!(
                $test_name,
                $header,
                $ty,
                $kind,
                $len,
                Some($completed),
                None,
                Some($requires_ack)
            );
        };
        ($test_name:ident, $header:expr, $ty:expr, $kind:expr, $len:expr, $completed:expr, $version:expr, $requires_ack:expr) => {
            #[test]
            fn $test_name() {
                let serialized: u64 = $header.into();
                let header: MessageHeader = serialized.try_into().unwrap();

                assert_eq!(header.message_type(), $ty);
                assert_eq!(header.message_kind(), $kind);
                assert_eq!(header.completed(), $completed);
                assert_eq!(header.protocol_version(), $version);
                assert_eq!(header.requires_ack(), $requires_ack);
                assert_eq!(header.frame_length(), $len);
            }
        };
    }

    roundtrip_test!(
        start,
        MessageHeader::new_start(1, 25),
        Start,
        Core,
        25,
        version: 1
    );

    roundtrip_test!(
        completion,
        MessageHeader::new(Completion, 22),
        Completion,
        Core,
        22
    );

    roundtrip_test!(end, MessageHeader::new(End, 0), End, Core, 0);

    roundtrip_test!(
        entry_ack,
        MessageHeader::new(EntryAck, 4),
        EntryAck,
        Core,
        4
    );

    roundtrip_test!(
        completed_get_state,
        MessageHeader::new_completable_entry(GetStateEntry, true, 0),
        GetStateEntry,
        State,
        0,
        requires_ack: false,
        completed: true
    );

    roundtrip_test!(
        not_completed_get_state,
        MessageHeader::new_completable_entry(GetStateEntry, false, 0),
        GetStateEntry,
        State,
        0,
        requires_ack: false,
        completed: false
    );

    roundtrip_test!(
        completed_get_state_with_len,
        MessageHeader::new_completable_entry(GetStateEntry, true, 10341),
        GetStateEntry,
        State,
        10341,
        requires_ack: false,
        completed: true
    );

    roundtrip_test!(
        run_with_requires_ack,
        MessageHeader::new_entry_header(RunEntry, None, Some(true), 120),
        RunEntry,
        Syscall,
        120,
        requires_ack: true
    );

    roundtrip_test!(
        custom_entry,
        MessageHeader::new_entry_header(MessageType::CustomEntry(0xFC00), None, Some(false), 10341),
        MessageType::CustomEntry(0xFC00),
        MessageKind::CustomEntry,
        10341,
        requires_ack: false
    );

    #[test]
    fn unknown_type_code() {
        let serialized: u64 = 0x0010_0000_0000_0000;
        let res: Result<MessageHeader, _> = serialized.try_into();
        assert!(res.is_err());
    }
}
