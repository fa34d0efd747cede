//! Read and write loops for one accepted connection.
//!
//! ```text
//!            ┌──────────── supervisor ────────────┐
//!            │                                    │
//!  stream ──►│ read loop ─► session.handle_message│
//!            │ write loop ◄─ outbound queue       │──► sink
//!            │            ◄─ ping ticker          │
//!            └────────────────────────────────────┘
//! ```
//!
//! The loops only talk through the session. Whichever exits first (socket
//! error, close frame, cancellation, closed queue) takes the other down,
//! and the supervisor unregisters the session exactly once.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::frame::{CloseReason, Frame};
use super::manager::ConnectionManager;
use super::messages::{errors, ServerMessage};
use super::session::{ClientSession, Outbound, SessionParams};

/// Most queued messages folded into one text frame.
const MAX_BATCH: usize = 256;

/// Grace period for the second loop after the first one exits.
const LOOP_EXIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum TransportError {
    #[error("write timed out")]
    Timeout,

    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy)]
struct LoopTimings {
    pong_wait: Duration,
    write_wait: Duration,
    ping_period: Duration,
}

/// Runs one connection to completion.
///
/// Registers the session (sending a policy close frame if a limit is hit),
/// subscribes it to its own user channel, sends the welcome ack, then runs
/// the read and write loops until either exits.
pub async fn serve_connection<S, R, E>(
    manager: ConnectionManager,
    params: SessionParams,
    mut sink: S,
    stream: R,
) where
    S: Sink<Frame> + Send + Unpin + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let timings = LoopTimings {
        pong_wait: manager.config().pong_wait,
        write_wait: manager.config().write_wait,
        ping_period: manager.config().ping_period(),
    };

    let (session, outbound) = manager.create_session(params);

    if let Err(e) = manager.register(session.clone()).await {
        tracing::warn!(
            client_id = %session.id(),
            user_id = %session.user_id(),
            ip_address = %session.ip_address(),
            reason = %e,
            "Connection rejected"
        );
        let _ = write_frame(&mut sink, Frame::Close(Some(e.close_reason())), timings.write_wait).await;
        let _ = timeout(timings.write_wait, sink.close()).await;
        return;
    }

    session.add_subscription(session.user_channel().to_string());
    session.send(&ServerMessage::welcome(&session.id(), session.user_channel()));
    session.mark_started();

    tracing::info!(
        client_id = %session.id(),
        user_id = %session.user_id(),
        ip_address = %session.ip_address(),
        "WebSocket connection established"
    );

    supervise(manager, session, outbound, sink, stream, timings).await;
}

async fn supervise<S, R, E>(
    manager: ConnectionManager,
    session: Arc<ClientSession>,
    outbound: Outbound,
    sink: S,
    stream: R,
    timings: LoopTimings,
) where
    S: Sink<Frame> + Send + Unpin + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let mut reader = tokio::spawn(read_loop(session.clone(), stream, timings.pong_wait));
    let mut writer = tokio::spawn(write_loop(session.clone(), outbound, sink, timings));

    let reader_first = tokio::select! {
        result = &mut reader => {
            report_exit(&session, "read", result);
            true
        }
        result = &mut writer => {
            report_exit(&session, "write", result);
            false
        }
    };

    session.cancel();
    manager.unregister(session.id()).await;

    let (name, mut other) = if reader_first {
        ("write", writer)
    } else {
        ("read", reader)
    };
    match timeout(timings.write_wait + LOOP_EXIT_GRACE, &mut other).await {
        Ok(result) => report_exit(&session, name, result),
        Err(_) => {
            tracing::warn!(client_id = %session.id(), task = name, "Loop did not stop in time, aborting");
            other.abort();
        }
    }

    session.mark_finished();
    tracing::info!(
        client_id = %session.id(),
        user_id = %session.user_id(),
        "WebSocket connection closed"
    );
}

/// A panicking loop is logged and treated like a transport failure.
fn report_exit(session: &ClientSession, task: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => tracing::debug!(client_id = %session.id(), task, "Loop exited"),
        Err(e) if e.is_panic() => tracing::error!(
            client_id = %session.id(),
            user_id = %session.user_id(),
            task,
            "Connection loop panicked"
        ),
        Err(e) => tracing::debug!(client_id = %session.id(), task, error = %e, "Loop cancelled"),
    }
}

async fn read_loop<R, E>(session: Arc<ClientSession>, mut stream: R, pong_wait: Duration)
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => return,
            next = timeout(pong_wait, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                tracing::debug!(client_id = %session.id(), "Read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(client_id = %session.id(), error = %e, "WebSocket read error");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        session.touch();
        match frame {
            Frame::Text(text) => {
                session.metrics().record_received();
                session.handle_message(&text).await;
            }
            Frame::Binary(bytes) => {
                session.metrics().record_received();
                match String::from_utf8(bytes) {
                    Ok(text) => session.handle_message(&text).await,
                    Err(_) => {
                        session.metrics().record_error(errors::INVALID_FORMAT);
                        session.send(&ServerMessage::error(None, errors::INVALID_FORMAT));
                    }
                }
            }
            Frame::Ping(_) | Frame::Pong(_) => {}
            Frame::Close(_) => {
                tracing::debug!(client_id = %session.id(), "Client sent close frame");
                return;
            }
        }
    }
}

async fn write_loop<S>(
    session: Arc<ClientSession>,
    mut outbound: Outbound,
    mut sink: S,
    timings: LoopTimings,
) where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + timings.ping_period, timings.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => {
                let _ = write_frame(&mut sink, Frame::Close(session.close_reason()), timings.write_wait).await;
                break;
            }
            message = outbound.recv() => {
                let Some(first) = message else {
                    let reason = session.close_reason().unwrap_or_else(CloseReason::normal);
                    let _ = write_frame(&mut sink, Frame::Close(Some(reason)), timings.write_wait).await;
                    break;
                };

                let mut batch = String::from(&*first);
                let mut count = 1;
                while count < MAX_BATCH {
                    match outbound.try_recv() {
                        Ok(next) => {
                            batch.push('\n');
                            batch.push_str(&next);
                            count += 1;
                        }
                        Err(_) => break,
                    }
                }

                if let Err(e) = write_frame(&mut sink, Frame::Text(batch), timings.write_wait).await {
                    tracing::debug!(client_id = %session.id(), error = %e, "WebSocket write failed");
                    break;
                }
                session.metrics().record_sent(count as u64);
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut sink, Frame::Ping(Vec::new()), timings.write_wait).await {
                    tracing::debug!(client_id = %session.id(), error = %e, "WebSocket ping failed");
                    break;
                }
            }
        }
    }

    let _ = timeout(timings.write_wait, sink.close()).await;
}

async fn write_frame<S>(sink: &mut S, frame: Frame, limit: Duration) -> Result<(), TransportError>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    timeout(limit, sink.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Io(e.to_string()))
}
