// Copyright (c) 2024 -  Rewind Software, Inc.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Represents an open invocation stream: the handshake consuming the start
//! frame and the replay burst, the reader and writer tasks owning the two
//! stream halves, and the driver loop running the handler.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use rewind_service_protocol::message::{Decoder, Encoder, MessageHeader, ProtocolMessage};
use rewind_types::identifiers::EntryIndex;
use rewind_types::journal::{Completion, EntryResult};

use crate::context::Context;
use crate::errors::{Error, HandlerError};
use crate::machine::StateMachine;
use crate::options::Options;

/// Terminal state of one invocation stream.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// Output and end frames written, the invocation is complete.
    Ended,
    /// Suspension frame written, listing the entries the handler was blocked
    /// on. The runtime re-invokes the handler once one of them completes.
    Suspended(BTreeSet<EntryIndex>),
    /// The invocation did not complete. The runtime retries on its own
    /// timeline.
    Failed(Error),
}

/// This is needed to split the driver in multiple loop functions and have
/// shortcircuiting.
enum TerminalLoopState<T> {
    Continue(T),
    Ended,
    Suspended(BTreeSet<EntryIndex>),
    Failed(Error),
}

impl<T, E: Into<Error>> From<Result<T, E>> for TerminalLoopState<T> {
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(v) => TerminalLoopState::Continue(v),
            Err(e) => TerminalLoopState::Failed(e.into()),
        }
    }
}

/// Could be replaced by ? operator if we had Try stable.
macro_rules! shortcircuit {
    ($value:expr) => {
        match TerminalLoopState::from($value) {
            TerminalLoopState::Continue(v) => v,
            TerminalLoopState::Ended => return TerminalLoopState::Ended,
            TerminalLoopState::Suspended(v) => return TerminalLoopState::Suspended(v),
            TerminalLoopState::Failed(e) => return TerminalLoopState::Failed(e),
        }
    };
}

/// Represents one open invocation stream.
pub struct InvocationTask<S> {
    stream: S,
    options: Options,
    cancellation: CancellationToken,
}

impl<S> InvocationTask<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, options: Options) -> Self {
        Self {
            stream,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    /// Ambient cancellation of this invocation. When the token fires,
    /// outstanding awaits in the handler fail fast and the stream closes
    /// without emitting frames.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Consumes the stream, driving the handler over it until a terminal
    /// state is reached.
    pub async fn run<F, Fut>(self, handler: F) -> InvocationOutcome
    where
        F: FnOnce(Context, Bytes) -> Fut,
        Fut: Future<Output = Result<Bytes, HandlerError>>,
    {
        match self.run_internal(handler).await {
            TerminalLoopState::Continue(()) => {
                unreachable!("the driver loop only exits through a terminal state")
            }
            TerminalLoopState::Ended => InvocationOutcome::Ended,
            TerminalLoopState::Suspended(indexes) => InvocationOutcome::Suspended(indexes),
            TerminalLoopState::Failed(e) => InvocationOutcome::Failed(e),
        }
    }

    async fn run_internal<F, Fut>(self, handler: F) -> TerminalLoopState<()>
    where
        F: FnOnce(Context, Bytes) -> Fut,
        Fut: Future<Output = Result<Bytes, HandlerError>>,
    {
        let InvocationTask {
            stream,
            options,
            cancellation,
        } = self;

        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut decoder = Decoder::new(options.message_size_warning, options.message_size_limit);
        let encoder = Encoder::new(options.protocol_version);

        // --- Handshake: the first frame must be the start frame, followed by
        // the replay burst of known entries.

        let (header, msg) = shortcircuit!(read_message(&mut read_half, &mut decoder).await);
        let start = match msg {
            ProtocolMessage::Start(start) => start,
            _ => {
                // No journal exists yet; answer with an error frame and close.
                let err = Error::UnexpectedMessage(header.message_type());
                return fail_before_journal(&mut write_half, &encoder, err).await;
            }
        };
        trace!(
            invocation.id = %start.debug_id,
            known_entries = start.known_entries,
            "Received start message"
        );

        let span = info_span!(
            "sdk_invocation",
            rewind.invocation.id = %start.debug_id,
            rewind.invocation.key = %start.key,
        );

        let mut entries = Vec::with_capacity(start.known_entries as usize);
        for _ in 0..start.known_entries {
            let (header, msg) = shortcircuit!(read_message(&mut read_half, &mut decoder).await);
            match msg {
                ProtocolMessage::UnparsedEntry(entry) => entries.push(entry),
                _ => {
                    let err = Error::UnexpectedMessage(header.message_type());
                    return fail_before_journal(&mut write_half, &encoder, err).await;
                }
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let machine = match StateMachine::new(start, entries, out_tx) {
            Ok(machine) => Arc::new(machine),
            Err(err) => return fail_before_journal(&mut write_half, &encoder, err).await,
        };

        drive(
            &options,
            cancellation,
            machine,
            read_half,
            decoder,
            write_half,
            encoder,
            out_rx,
            handler,
        )
        .instrument(span)
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive<S, F, Fut>(
    options: &Options,
    cancellation: CancellationToken,
    machine: Arc<StateMachine>,
    read_half: ReadHalf<S>,
    decoder: Decoder,
    write_half: WriteHalf<S>,
    encoder: Encoder,
    out_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    handler: F,
) -> TerminalLoopState<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnOnce(Context, Bytes) -> Fut,
    Fut: Future<Output = Result<Bytes, HandlerError>>,
{
    let (in_tx, mut in_rx) = mpsc::channel(options.inbound_channel_capacity);
    let (activity_tx, mut activity_rx) = watch::channel(Instant::now());

    // Subscribe before the tasks spawn so no failure notification is missed.
    let mut failed_rx = machine.failed_watch();

    let writer_handle = tokio::spawn(
        write_loop(write_half, encoder, out_rx, Arc::clone(&machine)).in_current_span(),
    );
    let _reader_guard = AbortOnDrop(tokio::spawn(
        read_loop(
            read_half,
            decoder,
            Arc::clone(&machine),
            in_tx,
            activity_tx,
        )
        .in_current_span(),
    ));

    let ctx = Context::new(Arc::clone(&machine));
    let input = machine.input();
    let mut handler_fut = std::pin::pin!(handler(ctx, input));

    let mut reader_gone = false;
    let mut canceled = false;

    loop {
        if *failed_rx.borrow() {
            let err = machine
                .take_failure()
                .unwrap_or(Error::ProtocolViolation("unknown failure"));
            return close_failed(&machine, writer_handle, err).await;
        }

        let last_activity = *activity_rx.borrow_and_update();
        let suspend_at = last_activity + *options.suspension_timeout;
        let abort_at = last_activity + *options.abort_timeout;
        let deadline = if Instant::now() < suspend_at {
            suspend_at
        } else {
            abort_at
        };

        tokio::select! {
            handler_result = &mut handler_fut => {
                return finalize(&machine, writer_handle, handler_result, canceled).await;
            },
            _ = failed_rx.changed() => {
                let err = machine
                    .take_failure()
                    .unwrap_or(Error::ProtocolViolation("unknown failure"));
                return close_failed(&machine, writer_handle, err).await;
            },
            maybe_msg = in_rx.recv(), if !reader_gone => {
                match maybe_msg {
                    Some((_, ProtocolMessage::EntryAck(ack))) => {
                        machine.notify_ack(ack.entry_index);
                    }
                    Some((header, _)) => {
                        let err = Error::UnexpectedMessage(header.message_type());
                        return close_failed(&machine, writer_handle, err).await;
                    }
                    None => {
                        reader_gone = true;
                        machine.notify_reader_closed();
                    }
                }
            },
            res = activity_rx.changed(), if !reader_gone => {
                if res.is_err() {
                    reader_gone = true;
                    machine.notify_reader_closed();
                }
            },
            _ = cancellation.cancelled(), if !canceled => {
                canceled = true;
                machine.cancel();
            },
            _ = tokio::time::sleep_until(deadline) => {
                if Instant::now() >= abort_at {
                    debug!("No activity within the abort timeout, abandoning the invocation");
                    machine.close();
                    let _ = writer_handle.await;
                    return TerminalLoopState::Failed(Error::AbortTimeout);
                }
                if let Some(indexes) = machine.suspend() {
                    let _ = writer_handle.await;
                    return TerminalLoopState::Suspended(indexes);
                }
                // The handler is busy with something that is not a journal
                // completion, keep waiting up to the abort timeout.
            },
        }
    }
}

async fn finalize(
    machine: &Arc<StateMachine>,
    writer_handle: JoinHandle<Result<(), Error>>,
    handler_result: Result<Bytes, HandlerError>,
    canceled: bool,
) -> TerminalLoopState<()> {
    if canceled || machine.is_canceled() {
        machine.close();
        let _ = writer_handle.await;
        return TerminalLoopState::Failed(Error::Canceled);
    }
    // A terminal condition may have been latched while the handler was
    // completing; it wins over whatever the handler returned.
    if let Some(err) = machine.take_failure() {
        return close_failed(machine, writer_handle, err).await;
    }

    let output = match handler_result {
        Ok(value) => EntryResult::Success(value),
        Err(HandlerError::Terminal(e)) => {
            debug!(error = %e, "Handler completed with a terminal failure");
            EntryResult::Failure(e.code(), e.message().to_owned().into())
        }
        Err(HandlerError::Retryable(e)) => {
            debug!(error = %e, "Handler completed with a retryable failure");
            return close_failed(machine, writer_handle, Error::HandlerFailed(e)).await;
        }
    };

    if let Err(err) = machine.output(output) {
        return close_failed(machine, writer_handle, err).await;
    }
    machine.end();

    match writer_handle.await {
        Ok(Ok(())) => TerminalLoopState::Ended,
        Ok(Err(err)) => TerminalLoopState::Failed(err),
        Err(join_err) => TerminalLoopState::Failed(Error::Io(std::io::Error::other(join_err))),
    }
}

/// Reports the failure to the runtime where the taxonomy calls for it, closes
/// the stream and settles the writer. Transient I/O conditions are not
/// written back.
async fn close_failed(
    machine: &Arc<StateMachine>,
    writer_handle: JoinHandle<Result<(), Error>>,
    err: Error,
) -> TerminalLoopState<()> {
    match err {
        // Transient conditions are not written back; the runtime retries on
        // its own timeline. This includes non-terminal run closure and
        // handler failures.
        Error::Io(_)
        | Error::ConnectionClosed
        | Error::Canceled
        | Error::AbortTimeout
        | Error::RunFailed(_)
        | Error::HandlerFailed(_) => {
            machine.close();
        }
        _ => machine.emit_error(err.to_error_message()),
    }
    let _ = writer_handle.await;
    TerminalLoopState::Failed(err)
}

async fn read_message<R: AsyncRead + Unpin>(
    read_half: &mut R,
    decoder: &mut Decoder,
) -> Result<(MessageHeader, ProtocolMessage), Error> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(res) = decoder.consume_next()? {
            return Ok(res);
        }
        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        decoder.push(buf.split().freeze());
    }
}

async fn fail_before_journal<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    encoder: &Encoder,
    err: Error,
) -> TerminalLoopState<()> {
    warn!(error = %err, "Refusing invocation stream");
    let buf = encoder.encode(ProtocolMessage::Error(err.to_error_message()));
    let _ = write_half.write_all(&buf).await;
    let _ = write_half.flush().await;
    let _ = write_half.shutdown().await;
    TerminalLoopState::Failed(err)
}

/// Owns the write half: drains the outbound queue until the engine closes it,
/// then flushes and shuts the stream down.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut write_half: W,
    encoder: Encoder,
    mut out_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    machine: Arc<StateMachine>,
) -> Result<(), Error> {
    while let Some(msg) = out_rx.recv().await {
        trace!(message = ?msg, "Sending message");
        let buf = encoder.encode(msg);
        if let Err(e) = write_half.write_all(&buf).await {
            machine.fail(Error::Io(std::io::Error::new(e.kind(), e.to_string())));
            return Err(Error::Io(e));
        }
    }
    write_half.flush().await?;
    let _ = write_half.shutdown().await;
    Ok(())
}

/// Owns the read half: decodes frames and fans them out. Completions go
/// straight to the journal's completion slots; everything else goes to the
/// bounded input channel consumed by the driver.
async fn read_loop<R: AsyncRead + Unpin>(
    mut read_half: R,
    mut decoder: Decoder,
    machine: Arc<StateMachine>,
    in_tx: mpsc::Sender<(MessageHeader, ProtocolMessage)>,
    activity_tx: watch::Sender<Instant>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    'outer: loop {
        loop {
            let (header, msg) = match decoder.consume_next() {
                Ok(Some(res)) => res,
                Ok(None) => break,
                Err(e) => {
                    machine.fail(Error::Encoding(e));
                    break 'outer;
                }
            };
            trace!(message = ?msg, "Received message");
            let _ = activity_tx.send(Instant::now());
            match msg {
                ProtocolMessage::Completion(completion) => {
                    if let Err(e) = machine.notify_completion(Completion::from(completion)) {
                        machine.fail(e);
                        break 'outer;
                    }
                }
                msg => {
                    if in_tx.try_send((header, msg)).is_err() {
                        machine.fail(Error::InputChannelFull);
                        break 'outer;
                    }
                }
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => decoder.push(buf.split().freeze()),
            Err(e) => {
                machine.fail(Error::Io(e));
                break;
            }
        }
    }
    machine.notify_reader_closed();
}

/// This wrapper makes sure we abort the reader task when the driver exits,
/// without waiting for it to complete.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort()
    }
}
