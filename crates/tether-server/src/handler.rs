//! Per-connection protocol loop.
//!
//! One task per attached client. The loop multiplexes two sources with
//! `tokio::select!`: session events (output, exit) flowing to the client, and
//! client messages (input, resize, signal, detach) flowing to the process.
//! Both directions make progress independently, so a burst of output never
//! delays a keystroke and vice versa.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use tether_pty::io_thread::UNKNOWN_EXIT_CODE;
use tether_pty::{
    classify_control_byte, Attachment, ControlSignal, InputValidator, Session, SessionEvent,
    SessionRegistry, ValidationError,
};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// A bidirectional message channel to one client.
#[async_trait]
pub trait Transport: Send {
    /// Next client message, or `None` once the client has gone away.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<ClientMessage, ProtocolError>>;

    async fn send(&mut self, message: ServerMessage) -> Result<(), ProtocolError>;
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    SessionNotFound,
    /// The client asked to detach; the session keeps running.
    Detached,
    ClientGone,
    ProcessExited(i32),
    /// The client fell too far behind the output stream.
    Lagged,
    TransportError,
}

/// What to do with input containing a forbidden escape sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Refuse the whole message.
    #[default]
    Reject,
    /// Strip the forbidden sequences and forward the rest.
    Sanitize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerSettings {
    pub validator: InputValidator,
    pub policy: InputPolicy,
    /// Deliver a message consisting of a single control byte as a signal.
    pub forward_control_signals: bool,
}

/// Run the protocol for one client attached to `session_id` until it ends.
pub async fn serve<T: Transport>(
    registry: &SessionRegistry,
    session_id: &str,
    transport: &mut T,
    settings: &HandlerSettings,
) -> Disconnect {
    let Some(session) = registry.get(session_id) else {
        log::debug!("attach to unknown session {session_id}");
        return Disconnect::SessionNotFound;
    };
    let mut conn = Connection::new(session, settings);
    let outcome = conn.run(transport).await;
    conn.transition(ConnectionState::Closed);
    log::info!("connection to session {session_id} ended: {outcome:?}");
    outcome
}

struct Connection<'a> {
    session: Arc<Session>,
    settings: &'a HandlerSettings,
    state: ConnectionState,
}

impl<'a> Connection<'a> {
    fn new(session: Arc<Session>, settings: &'a HandlerSettings) -> Self {
        Self {
            session,
            settings,
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!(
                "session {}: connection {:?} -> {next:?}",
                self.session.id(),
                self.state
            );
            self.state = next;
        }
    }

    async fn run<T: Transport>(&mut self, transport: &mut T) -> Disconnect {
        let Attachment {
            replay,
            exit_code,
            mut events,
            guard: _guard,
        } = self.session.attach();
        self.transition(ConnectionState::Streaming);

        if transport.send(ServerMessage::Replay { data: replay }).await.is_err() {
            self.transition(ConnectionState::Closing);
            return Disconnect::TransportError;
        }
        if let Some(code) = exit_code {
            self.transition(ConnectionState::Closing);
            let _ = transport.send(ServerMessage::Exited { code }).await;
            return Disconnect::ProcessExited(code);
        }

        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SessionEvent::Output(data)) => {
                        let message = ServerMessage::Output { data: data.to_vec() };
                        if transport.send(message).await.is_err() {
                            break Disconnect::TransportError;
                        }
                    }
                    Ok(SessionEvent::Exited(code)) => {
                        self.transition(ConnectionState::Closing);
                        let _ = transport.send(ServerMessage::Exited { code }).await;
                        break Disconnect::ProcessExited(code);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "session {}: client lagged by {skipped} chunks, disconnecting",
                            self.session.id()
                        );
                        break Disconnect::Lagged;
                    }
                    Err(RecvError::Closed) => {
                        let code = self.session.exit_code().unwrap_or(UNKNOWN_EXIT_CODE);
                        let _ = transport.send(ServerMessage::Exited { code }).await;
                        break Disconnect::ProcessExited(code);
                    }
                },
                message = transport.recv() => match message {
                    None => break Disconnect::ClientGone,
                    Some(Ok(ClientMessage::Detach)) => break Disconnect::Detached,
                    Some(Ok(message)) => {
                        if self.handle(message, transport).await.is_err() {
                            break Disconnect::TransportError;
                        }
                    }
                    Some(Err(ProtocolError::Decode(reason))) => {
                        if reject(transport, reason).await.is_err() {
                            break Disconnect::TransportError;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("session {}: {e}", self.session.id());
                        break Disconnect::TransportError;
                    }
                },
            }
        };
        self.transition(ConnectionState::Closing);
        outcome
    }

    async fn handle<T: Transport>(
        &self,
        message: ClientMessage,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        match message {
            ClientMessage::Input { data } => self.handle_input(&data, transport).await,
            ClientMessage::Resize { rows, cols } => {
                match self.session.pty().resize(rows, cols) {
                    Ok(()) => {
                        self.session.touch();
                        Ok(())
                    }
                    Err(e) => reject(transport, e.to_string()).await,
                }
            }
            ClientMessage::Signal { name } => {
                self.deliver_signal(name).await;
                Ok(())
            }
            // Handled by the loop.
            ClientMessage::Detach => Ok(()),
        }
    }

    async fn handle_input<T: Transport>(
        &self,
        data: &[u8],
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        let validator = &self.settings.validator;
        let data = match validator.validate(data) {
            Ok(()) => Cow::Borrowed(data),
            Err(ValidationError::DangerousSequence(kind))
                if self.settings.policy == InputPolicy::Sanitize =>
            {
                let cleaned = validator.sanitize(data);
                // An unterminated sequence survives sanitizing; refuse it.
                if let Err(e) = validator.validate(&cleaned) {
                    return reject(transport, e.to_string()).await;
                }
                log::debug!("session {}: stripped {kind} sequence", self.session.id());
                cleaned
            }
            Err(e) => {
                log::debug!("session {}: rejected input: {e}", self.session.id());
                return reject(transport, e.to_string()).await;
            }
        };
        if data.is_empty() {
            return Ok(());
        }

        if self.settings.forward_control_signals && data.len() == 1 {
            if let Some(signal) = classify_control_byte(data[0]) {
                self.deliver_signal(signal).await;
                return Ok(());
            }
        }

        self.session.pty().write(&data).await;
        self.session.touch();
        Ok(())
    }

    async fn deliver_signal(&self, signal: ControlSignal) {
        let pty = self.session.pty();
        match signal.signal() {
            Some(sig) => {
                if let Err(e) = pty.send_signal(sig) {
                    log::warn!("session {}: failed to send {sig}: {e}", self.session.id());
                }
            }
            None => pty.write(&[signal.byte()]).await,
        }
        self.session.touch();
    }
}

async fn reject<T: Transport>(transport: &mut T, reason: String) -> Result<(), ProtocolError> {
    transport.send(ServerMessage::Rejected { reason }).await
}
