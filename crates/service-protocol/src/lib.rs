// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire protocol spoken between the runtime and the SDK: length-prefixed
//! typed frames carrying protobuf payloads, one bidirectional stream per
//! invocation.

pub mod awakeable_id;
mod codec;
pub mod message;
pub mod pb;
mod pb_into;

pub use codec::ProtobufRawEntryCodec;
