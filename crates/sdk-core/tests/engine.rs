// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end tests of the invocation engine, driving the runtime side of
//! the stream with a scripted peer.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use rewind_sdk_core::{Error, InvocationOutcome, InvocationTask, Options};
use rewind_service_protocol::awakeable_id::AwakeableIdentifier;
use rewind_service_protocol::message::{
    Decoder, Encoder, MessageHeader, MessageType, ProtocolMessage,
};
use rewind_service_protocol::pb::protocol;
use rewind_service_protocol::ProtobufRawEntryCodec;
use rewind_types::errors::codes;
use rewind_types::identifiers::InvocationId;
use rewind_types::journal::raw::{RawEntry, RawEntryCodec};
use rewind_types::journal::{
    Completion, CompletionResult, Entry, EntryResult, EntryType, GetStateResult, SleepResult,
};
use rewind_types::time::MillisSinceEpoch;

const INVOCATION_ID: &[u8] = b"\x01\x02\x03\x04";

/// Scripted runtime peer of one invocation stream.
struct MockRuntime {
    stream: DuplexStream,
    encoder: Encoder,
    decoder: Decoder,
}

impl MockRuntime {
    fn new() -> (Self, DuplexStream) {
        let (runtime_side, sdk_side) = tokio::io::duplex(64 * 1024);
        (
            Self {
                stream: runtime_side,
                encoder: Encoder::new(1),
                decoder: Decoder::default(),
            },
            sdk_side,
        )
    }

    async fn send(&mut self, msg: ProtocolMessage) {
        let buf = self.encoder.encode(msg);
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn send_start(
        &mut self,
        known_entries: u32,
        partial_state: bool,
        state_map: Vec<(&str, &str)>,
    ) {
        self.send(ProtocolMessage::new_start_message(
            Bytes::from_static(INVOCATION_ID),
            "inv_test".to_owned(),
            "test-key".to_owned(),
            known_entries,
            partial_state,
            state_map.into_iter().map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            }),
        ))
        .await;
    }

    async fn send_entry(&mut self, entry: Entry) {
        self.send(ProtocolMessage::UnparsedEntry(
            ProtobufRawEntryCodec::serialize(entry),
        ))
        .await;
    }

    async fn send_completion(&mut self, entry_index: u32, result: CompletionResult) {
        self.send(Completion::new(entry_index, result).into()).await;
    }

    async fn recv(&mut self) -> (MessageHeader, ProtocolMessage) {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if let Some(res) = self.decoder.consume_next().unwrap() {
                return res;
            }
            let n = self.stream.read_buf(&mut buf).await.unwrap();
            assert_ne!(n, 0, "stream closed while awaiting a frame");
            self.decoder.push(buf.split().freeze());
        }
    }

    async fn recv_entry(&mut self, expected: MessageType) -> (MessageHeader, RawEntry) {
        let (header, msg) = self.recv().await;
        assert_eq!(header.message_type(), expected);
        match msg {
            ProtocolMessage::UnparsedEntry(entry) => (header, entry),
            other => panic!("expected an entry frame, got {other:?}"),
        }
    }

    async fn recv_error(&mut self) -> protocol::ErrorMessage {
        let (header, msg) = self.recv().await;
        assert_eq!(header.message_type(), MessageType::Error);
        match msg {
            ProtocolMessage::Error(e) => e,
            other => panic!("expected an error frame, got {other:?}"),
        }
    }

    async fn recv_output(&mut self) -> protocol::OutputEntryMessage {
        let (_, entry) = self.recv_entry(MessageType::OutputEntry).await;
        protocol::OutputEntryMessage::decode(entry.entry).unwrap()
    }

    async fn recv_end(&mut self) {
        let (header, _) = self.recv().await;
        assert_eq!(header.message_type(), MessageType::End);
    }

    /// The SDK shut the stream down without further frames.
    async fn recv_eof(&mut self) {
        let mut buf = BytesMut::new();
        let n = self.stream.read_buf(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected eof, got more frames");
    }
}

fn output_value(msg: &protocol::OutputEntryMessage) -> Bytes {
    match &msg.result {
        Some(protocol::output_entry_message::Result::Value(value)) => value.clone(),
        other => panic!("expected an output value, got {other:?}"),
    }
}

#[tokio::test]
async fn fresh_run_state_roundtrip() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, input| async move {
            assert_eq!(input, Bytes::from_static(b"x"));
            assert_eq!(ctx.get_state("k").await?, None);
            ctx.set_state("k", "v").await?;
            Ok(Bytes::from_static(b"ok"))
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let (header, entry) = runtime.recv_entry(MessageType::GetStateEntry).await;
    assert_eq!(header.completed(), Some(false));
    let get_state = protocol::GetStateEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(get_state.key, Bytes::from_static(b"k"));

    runtime.send_completion(2, CompletionResult::Empty).await;

    let (_, entry) = runtime.recv_entry(MessageType::SetStateEntry).await;
    let set_state = protocol::SetStateEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(set_state.key, Bytes::from_static(b"k"));
    assert_eq!(set_state.value, Bytes::from_static(b"v"));

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"ok"));
    runtime.recv_end().await;

    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn replay_reissues_operations_without_frames() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            assert_eq!(ctx.get_state("k").await?, None);
            ctx.set_state("k", "v").await?;
            Ok(Bytes::from_static(b"ok"))
        },
    ));

    runtime.send_start(3, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime
        .send_entry(Entry::get_state("k", Some(GetStateResult::Empty)))
        .await;
    runtime.send_entry(Entry::set_state("k", "v")).await;

    // The first outbound frame must be the output, nothing is re-emitted.
    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"ok"));
    runtime.recv_end().await;

    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn journal_mismatch_on_diverging_request() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            assert_eq!(ctx.get_state("k").await?, None);
            ctx.set_state("k", "v").await?;
            Ok(Bytes::from_static(b"ok"))
        },
    ));

    runtime.send_start(3, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime
        .send_entry(Entry::get_state("k", Some(GetStateResult::Empty)))
        .await;
    // The journal diverges on the set-state key.
    runtime.send_entry(Entry::set_state("k2", "v")).await;

    let error = runtime.recv_error().await;
    assert_eq!(error.code, u32::from(codes::JOURNAL_MISMATCH));
    assert_eq!(error.related_entry_index, Some(3));
    runtime.recv_eof().await;

    match task.await.unwrap() {
        InvocationOutcome::Failed(Error::JournalMismatch { index, .. }) => assert_eq!(index, 3),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn sleep_suspends_and_resumes() {
    // First attempt: the timer does not fire while the stream is open.
    let (mut runtime, sdk_side) = MockRuntime::new();
    let options = Options::default().with_suspension_timeout(Duration::from_millis(200));
    let task = tokio::spawn(InvocationTask::new(sdk_side, options).run(|ctx, _| async move {
        ctx.sleep(Duration::from_secs(60)).await?;
        Ok(Bytes::from_static(b"done"))
    }));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let before = MillisSinceEpoch::now().as_u64();
    let (header, entry) = runtime.recv_entry(MessageType::SleepEntry).await;
    assert_eq!(header.completed(), Some(false));
    let sleep = protocol::SleepEntryMessage::decode(entry.entry).unwrap();
    assert!(sleep.wake_up_time >= before + 60_000);

    let (header, msg) = runtime.recv().await;
    assert_eq!(header.message_type(), MessageType::Suspension);
    match msg {
        ProtocolMessage::Suspension(suspension) => {
            assert_eq!(suspension.entry_indexes, vec![2]);
        }
        other => panic!("expected a suspension frame, got {other:?}"),
    }

    match task.await.unwrap() {
        InvocationOutcome::Suspended(indexes) => {
            assert_eq!(indexes.into_iter().collect::<Vec<_>>(), vec![2]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // Retry: the sleep entry is journaled as fired, the handler completes.
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(Bytes::from_static(b"done"))
        },
    ));

    runtime.send_start(2, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime
        .send_entry(Entry::sleep(
            MillisSinceEpoch::new(1_700_000_000_000),
            Some(SleepResult::Fired),
        ))
        .await;

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"done"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn call_then_delayed_send() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            let call = ctx.call("B", "k1", "m", Bytes::from_static(b"param")).await?;
            let response = call.response().await?;
            ctx.send(
                "C",
                "k2",
                "m2",
                Bytes::from_static(b"p2"),
                Some(Duration::from_secs(5)),
            )
            .await?;
            Ok(response)
        },
    ));

    let before = MillisSinceEpoch::now().as_u64();
    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let (header, entry) = runtime.recv_entry(MessageType::CallEntry).await;
    assert_eq!(header.completed(), Some(false));
    let call = protocol::CallEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(call.service_name, "B");
    assert_eq!(call.handler_name, "m");
    assert_eq!(call.key, "k1");
    assert_eq!(call.parameter, Bytes::from_static(b"param"));
    assert_eq!(call.result, None);

    runtime
        .send_completion(2, CompletionResult::Success(Bytes::from_static(b"y")))
        .await;

    let (_, entry) = runtime.recv_entry(MessageType::OneWayCallEntry).await;
    let send = protocol::OneWayCallEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(send.service_name, "C");
    assert_eq!(send.handler_name, "m2");
    assert_eq!(send.key, "k2");
    let after = MillisSinceEpoch::now().as_u64();
    assert!(send.invoke_time >= before + 5_000);
    assert!(send.invoke_time <= after + 5_000);

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"y"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn completion_as_first_frame_is_a_protocol_violation() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |_, input| async move { Ok(input) },
    ));

    runtime.send_completion(1, CompletionResult::Empty).await;

    let error = runtime.recv_error().await;
    assert_eq!(error.code, u32::from(codes::PROTOCOL_VIOLATION));
    runtime.recv_eof().await;

    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::UnexpectedMessage(MessageType::Completion))
    ));
}

#[tokio::test]
async fn completion_arriving_early_is_buffered() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            // Give the completion frame time to arrive before the handler
            // reaches the journaled entry.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let value = ctx.get_state("k").await?;
            Ok(value.unwrap_or_default())
        },
    ));

    runtime.send_start(2, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime.send_entry(Entry::get_state("k", None)).await;
    runtime
        .send_completion(2, CompletionResult::Success(Bytes::from_static(b"v")))
        .await;

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"v"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn run_executes_once_and_waits_for_the_ack() {
    let executions = Arc::new(AtomicUsize::new(0));

    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = {
        let executions = Arc::clone(&executions);
        tokio::spawn(
            InvocationTask::new(sdk_side, Options::default()).run(|ctx, _| async move {
                let value = ctx
                    .run(move || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(Bytes::from_static(b"r1"))
                    })
                    .await?;
                Ok(value)
            }),
        )
    };

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let (header, entry) = runtime.recv_entry(MessageType::RunEntry).await;
    assert_eq!(header.requires_ack(), Some(true));
    let run = protocol::RunEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(
        run.result,
        Some(protocol::run_entry_message::Result::Value(
            Bytes::from_static(b"r1")
        ))
    );

    runtime.send(ProtocolMessage::new_entry_ack(2)).await;

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"r1"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_replays_the_journaled_result_without_executing() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            let value = ctx
                .run(|| unreachable!("the closure must not run during replay"))
                .await?;
            Ok(value)
        },
    ));

    runtime.send_start(2, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime
        .send_entry(Entry::run(EntryResult::Success(Bytes::from_static(b"r1"))))
        .await;

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"r1"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn retryable_run_failure_abandons_without_frames() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            let value = ctx
                .run(|| Err(anyhow::anyhow!("downstream hiccup").into()))
                .await?;
            Ok(value)
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    // Nothing is journaled and no error frame is written back, the runtime
    // retries the invocation on its own timeline.
    runtime.recv_eof().await;
    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::RunFailed(_))
    ));
}

#[tokio::test]
async fn retryable_handler_failure_abandons_without_frames() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            ctx.set_state("k", "v").await?;
            Err(anyhow::anyhow!("flaky dependency").into())
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let _ = runtime.recv_entry(MessageType::SetStateEntry).await;
    // No output, end or error frame follows.
    runtime.recv_eof().await;
    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::HandlerFailed(_))
    ));
}

#[tokio::test]
async fn eager_state_answers_locally() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            assert_eq!(
                ctx.get_state("k").await?,
                Some(Bytes::from_static(b"v"))
            );
            assert_eq!(ctx.get_state("missing").await?, None);
            ctx.set_state("k2", "v2").await?;
            let keys = ctx.get_state_keys().await?;
            assert_eq!(
                keys,
                vec![Bytes::from_static(b"k"), Bytes::from_static(b"k2")]
            );
            Ok(Bytes::from_static(b"done"))
        },
    ));

    runtime.send_start(1, false, vec![("k", "v")]).await;
    runtime.send_entry(Entry::input("x")).await;

    // Every state operation is answered locally: the entries arrive already
    // completed and no completion frame is ever sent.
    let (header, entry) = runtime.recv_entry(MessageType::GetStateEntry).await;
    assert_eq!(header.completed(), Some(true));
    let get_state = protocol::GetStateEntryMessage::decode(entry.entry).unwrap();
    assert_eq!(
        get_state.result,
        Some(protocol::get_state_entry_message::Result::Value(
            Bytes::from_static(b"v")
        ))
    );

    let (header, _) = runtime.recv_entry(MessageType::GetStateEntry).await;
    assert_eq!(header.completed(), Some(true));
    let _ = runtime.recv_entry(MessageType::SetStateEntry).await;
    let (header, _) = runtime.recv_entry(MessageType::GetStateKeysEntry).await;
    assert_eq!(header.completed(), Some(true));

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"done"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn state_keys_deferred_on_partial_state() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            let keys = ctx.get_state_keys().await?;
            assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
            Ok(Bytes::from_static(b"done"))
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let (header, _) = runtime.recv_entry(MessageType::GetStateKeysEntry).await;
    assert_eq!(header.completed(), Some(false));
    runtime
        .send_completion(
            2,
            CompletionResult::Success(ProtobufRawEntryCodec::serialize_state_keys(vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
            ])),
        )
        .await;

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"done"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn ending_before_consuming_the_replayed_journal_is_a_mismatch() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(
        InvocationTask::new(sdk_side, Options::default())
            .run(|_, _| async move { Ok(Bytes::from_static(b"early")) }),
    );

    runtime.send_start(3, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    runtime
        .send_entry(Entry::get_state("k", Some(GetStateResult::Empty)))
        .await;
    runtime.send_entry(Entry::set_state("k", "v")).await;

    let error = runtime.recv_error().await;
    assert_eq!(error.code, u32::from(codes::JOURNAL_MISMATCH));
    assert_eq!(error.related_entry_index, Some(2));
    // The error frame references the entry as the journal recorded it.
    assert_eq!(
        error.related_entry_type,
        Some(u16::from(MessageType::GetStateEntry) as u32)
    );
    runtime.recv_eof().await;

    match task.await.unwrap() {
        InvocationOutcome::Failed(Error::EntryTypeMismatch {
            index,
            expected,
            actual,
        }) => {
            assert_eq!(index, 2);
            assert_eq!(expected, EntryType::Output);
            assert_eq!(actual, EntryType::GetState);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_completion_is_a_protocol_violation() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            ctx.get_state("k").await?;
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(Bytes::new())
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let _ = runtime.recv_entry(MessageType::GetStateEntry).await;
    runtime.send_completion(2, CompletionResult::Empty).await;
    let _ = runtime.recv_entry(MessageType::SleepEntry).await;
    runtime.send_completion(2, CompletionResult::Empty).await;

    let error = runtime.recv_error().await;
    assert_eq!(error.code, u32::from(codes::PROTOCOL_VIOLATION));

    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn completion_beyond_the_known_journal_is_a_protocol_violation() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(Bytes::new())
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let _ = runtime.recv_entry(MessageType::SleepEntry).await;
    runtime.send_completion(10, CompletionResult::Empty).await;

    let error = runtime.recv_error().await;
    assert_eq!(error.code, u32::from(codes::PROTOCOL_VIOLATION));
    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn cancellation_closes_without_frames() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let cancellation = CancellationToken::new();
    let task = tokio::spawn(
        InvocationTask::new(sdk_side, Options::default())
            .with_cancellation(cancellation.clone())
            .run(|ctx, _| async move {
                ctx.sleep(Duration::from_secs(60)).await?;
                Ok(Bytes::new())
            }),
    );

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;
    let _ = runtime.recv_entry(MessageType::SleepEntry).await;

    cancellation.cancel();

    runtime.recv_eof().await;
    assert!(matches!(
        task.await.unwrap(),
        InvocationOutcome::Failed(Error::Canceled)
    ));
}

#[tokio::test]
async fn awakeable_roundtrip() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |ctx, _| async move {
            let (id, handle) = ctx.awakeable().await?;
            let (_, entry_index) = AwakeableIdentifier::from_str(&id).unwrap().into_inner();
            assert_eq!(entry_index, 2);
            let value = handle.result().await?;
            ctx.complete_awakeable(id, Ok(value.clone())).await?;
            Ok(value)
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let (header, _) = runtime.recv_entry(MessageType::AwakeableEntry).await;
    assert_eq!(header.completed(), Some(false));
    runtime
        .send_completion(2, CompletionResult::Success(Bytes::from_static(b"42")))
        .await;

    let (_, entry) = runtime.recv_entry(MessageType::CompleteAwakeableEntry).await;
    let complete = protocol::CompleteAwakeableEntryMessage::decode(entry.entry).unwrap();
    let expected_id = AwakeableIdentifier::new(
        InvocationId::from_bytes(Bytes::from_static(INVOCATION_ID)),
        2,
    )
    .to_string();
    assert_eq!(complete.id, expected_id);

    let output = runtime.recv_output().await;
    assert_eq!(output_value(&output), Bytes::from_static(b"42"));
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}

#[tokio::test]
async fn terminal_handler_failure_becomes_the_output() {
    let (mut runtime, sdk_side) = MockRuntime::new();
    let task = tokio::spawn(InvocationTask::new(sdk_side, Options::default()).run(
        |_, _| async move {
            Err(rewind_sdk_core::HandlerError::terminal(
                codes::BAD_REQUEST,
                "ticket already sold",
            ))
        },
    ));

    runtime.send_start(1, true, vec![]).await;
    runtime.send_entry(Entry::input("x")).await;

    let output = runtime.recv_output().await;
    match output.result {
        Some(protocol::output_entry_message::Result::Failure(failure)) => {
            assert_eq!(failure.code, u32::from(codes::BAD_REQUEST));
            assert_eq!(failure.message, "ticket already sold");
        }
        other => panic!("expected an output failure, got {other:?}"),
    }
    runtime.recv_end().await;
    assert!(matches!(task.await.unwrap(), InvocationOutcome::Ended));
}
