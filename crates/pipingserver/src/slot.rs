// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-path rendezvous state machine
//!
//! A [`Slot`] coordinates one sender and up to N receivers meeting on a path.
//! Requests park here until the transfer can start; the slot enforces the
//! single-sender and capacity rules and hands everything to the pump once
//! both sides are present.

use std::sync::{Arc, Mutex};

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use tokio::sync::oneshot;
use tracing::debug;

use crate::pump::{self, Transfer};
use crate::registry::Registry;
use crate::response::{self, GenericResponse, StatusCode};

/// Client-protocol violations surfaced as HTTP 400.
///
/// The `Display` text is the diagnostic sent to the client.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Reject {
    #[error("Cannot send to a reserved path.")]
    ReservedPath,
    #[error("Another sender is already connected on this path.")]
    SenderOccupied,
    #[error("Too many receivers connected on this path.")]
    TooManyReceivers,
    #[error("The query parameter \"n\" must be a positive integer.")]
    InvalidCapacity,
    #[error("Unsupported method for a relay path.")]
    UnsupportedMethod,
}

impl Reject {
    pub fn into_response(self) -> GenericResponse {
        response::text(StatusCode::BAD_REQUEST, format_args!("[ERROR] {self}\n"))
    }
}

/// Everything the pump needs from a sender request.
pub(crate) struct SenderParts {
    pub body: BoxBody<Bytes, anyhow::Error>,
    /// Raw `Content-Length` header, copied verbatim to each receiver.
    pub content_length: Option<HeaderValue>,
    /// Raw `Content-Type` header, copied verbatim to each receiver.
    pub content_type: Option<HeaderValue>,
}

struct PendingSender {
    id: u64,
    capacity: usize,
    parts: SenderParts,
    reply: oneshot::Sender<GenericResponse>,
}

struct PendingReceiver {
    id: u64,
    reply: oneshot::Sender<GenericResponse>,
}

/// Rendezvous lifecycle. Terminal state is `Done`; a `Done` slot is inert and
/// the registry replaces it on the next lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Empty,
    SenderWaiting,
    ReceiversWaiting,
    Transferring,
    Done,
}

struct Inner {
    state: State,
    sender: Option<PendingSender>,
    /// FIFO by arrival; order decides admission when capacity is revealed.
    receivers: Vec<PendingReceiver>,
    next_id: u64,
}

/// Cheap handle to one path's rendezvous state.
#[derive(Clone)]
pub(crate) struct Slot {
    shared: Arc<Shared>,
}

struct Shared {
    path: String,
    inner: Mutex<Inner>,
}

/// A parked request: await `resolve` for the final response.
///
/// Dropping the admission (the handler future was dropped because the peer
/// disconnected) deregisters the request from the slot.
pub(crate) struct Admission {
    reply: oneshot::Receiver<GenericResponse>,
    guard: RegistrationGuard,
}

impl Admission {
    pub(crate) async fn resolve(self) -> GenericResponse {
        let Self { reply, guard } = self;
        let response = match reply.await {
            Ok(response) => response,
            // The slot side never drops a parked reply channel without
            // answering it, so this is strictly defensive.
            Err(_) => response::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error: rendezvous abandoned.\n",
            ),
        };
        drop(guard);
        response
    }
}

pub(crate) enum SenderRejected {
    /// Respond 400; the slot is unchanged.
    Busy(Reject),
    /// The slot finished in the meantime; retry against a fresh slot.
    Finished(SenderParts),
}

pub(crate) enum ReceiverRejected {
    Busy(Reject),
    Finished,
}

#[derive(Copy, Clone, Debug)]
enum Role {
    Sender,
    Receiver,
}

struct RegistrationGuard {
    slot: Slot,
    registry: Registry,
    role: Role,
    id: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.slot.deregister(&self.registry, self.role, self.id);
    }
}

impl Slot {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.to_owned(),
                inner: Mutex::new(Inner {
                    state: State::Empty,
                    sender: None,
                    receivers: Vec::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.shared.path
    }

    /// Whether `self` and `other` are handles to the same slot.
    pub(crate) fn ptr_eq(&self, other: &Slot) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.inner.lock().unwrap().state == State::Done
    }

    /// Register a sender with the capacity parsed from its `?n=` parameter.
    ///
    /// If enough receivers are already queued this starts the transfer;
    /// queued receivers beyond `capacity` are answered 400 in arrival order.
    pub(crate) fn register_sender(
        &self,
        registry: &Registry,
        capacity: usize,
        parts: SenderParts,
    ) -> Result<Admission, SenderRejected> {
        let mut transfer = None;
        let admission = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                State::Done => return Err(SenderRejected::Finished(parts)),
                State::SenderWaiting | State::Transferring => {
                    return Err(SenderRejected::Busy(Reject::SenderOccupied))
                }
                State::Empty | State::ReceiversWaiting => {}
            }

            let id = inner.assign_id();
            let (reply_tx, reply_rx) = oneshot::channel();
            inner.sender = Some(PendingSender {
                id,
                capacity,
                parts,
                reply: reply_tx,
            });

            // Capacity is now known; queued receivers beyond it lose, in
            // arrival order.
            if inner.receivers.len() > capacity {
                for over in inner.receivers.split_off(capacity) {
                    let _ = over.reply.send(Reject::TooManyReceivers.into_response());
                }
            }

            if inner.receivers.len() == capacity {
                inner.state = State::Transferring;
                transfer = Some(inner.take_transfer(self.path()));
            } else {
                inner.state = State::SenderWaiting;
            }
            debug!(
                path = %self.path(),
                capacity,
                queued = inner.receivers.len(),
                state = ?inner.state,
                "sender registered",
            );

            Admission {
                reply: reply_rx,
                guard: self.guard(registry, Role::Sender, id),
            }
        };

        if let Some(transfer) = transfer {
            self.begin_transfer(registry, transfer);
        }
        Ok(admission)
    }

    /// Register a receiver, FIFO.
    ///
    /// Starts the transfer if this receiver completes the sender's count.
    pub(crate) fn register_receiver(
        &self,
        registry: &Registry,
    ) -> Result<Admission, ReceiverRejected> {
        let mut transfer = None;
        let admission = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                State::Done => return Err(ReceiverRejected::Finished),
                State::Transferring => {
                    return Err(ReceiverRejected::Busy(Reject::TooManyReceivers))
                }
                State::SenderWaiting => {
                    let capacity = inner
                        .sender
                        .as_ref()
                        .expect("Bug: SENDER_WAITING requires a pending sender")
                        .capacity;
                    if inner.receivers.len() >= capacity {
                        return Err(ReceiverRejected::Busy(Reject::TooManyReceivers));
                    }
                }
                State::Empty | State::ReceiversWaiting => {}
            }

            let id = inner.assign_id();
            let (reply_tx, reply_rx) = oneshot::channel();
            inner.receivers.push(PendingReceiver {
                id,
                reply: reply_tx,
            });

            match inner.state {
                State::SenderWaiting => {
                    let capacity = inner
                        .sender
                        .as_ref()
                        .expect("Bug: SENDER_WAITING requires a pending sender")
                        .capacity;
                    if inner.receivers.len() == capacity {
                        inner.state = State::Transferring;
                        transfer = Some(inner.take_transfer(self.path()));
                    }
                }
                State::Empty | State::ReceiversWaiting => {
                    inner.state = State::ReceiversWaiting;
                }
                State::Transferring | State::Done => {
                    unreachable!("Bug: rejected above")
                }
            }
            debug!(
                path = %self.path(),
                queued = inner.receivers.len(),
                state = ?inner.state,
                "receiver registered",
            );

            Admission {
                reply: reply_rx,
                guard: self.guard(registry, Role::Receiver, id),
            }
        };

        if let Some(transfer) = transfer {
            self.begin_transfer(registry, transfer);
        }
        Ok(admission)
    }

    fn guard(&self, registry: &Registry, role: Role, id: u64) -> RegistrationGuard {
        RegistrationGuard {
            slot: self.clone(),
            registry: registry.clone(),
            role,
            id,
        }
    }

    /// Remove a pending request whose handler disappeared (peer disconnect).
    ///
    /// No-op when the request is no longer pending, e.g. it was already
    /// answered or handed to the pump.
    fn deregister(&self, registry: &Registry, role: Role, id: u64) {
        let dispose = {
            let mut inner = self.shared.inner.lock().unwrap();
            match role {
                Role::Sender => {
                    if inner.sender.as_ref().map(|s| s.id) != Some(id) {
                        return;
                    }
                    inner.sender = None;
                    if inner.receivers.is_empty() {
                        inner.state = State::Done;
                    } else {
                        // The capacity left with the sender; the next sender
                        // re-classifies the queue.
                        inner.state = State::ReceiversWaiting;
                    }
                }
                Role::Receiver => {
                    let Some(at) = inner.receivers.iter().position(|r| r.id == id) else {
                        return;
                    };
                    inner.receivers.remove(at);
                    if inner.receivers.is_empty() && inner.sender.is_none() {
                        inner.state = State::Done;
                    }
                }
            }
            debug!(path = %self.path(), ?role, state = ?inner.state, "pending peer disconnected");
            inner.state == State::Done
        };
        if dispose {
            registry.remove(self.path(), self);
        }
    }

    /// Run the pump in its own task; mark the slot done and dispose it when
    /// the transfer ends, however it ends.
    fn begin_transfer(&self, registry: &Registry, transfer: Transfer) {
        let slot = self.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            pump::run(transfer).await;
            slot.shared.inner.lock().unwrap().state = State::Done;
            registry.remove(slot.path(), &slot);
        });
    }
}

impl Inner {
    fn assign_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Move the sender and the admitted receivers out for the pump.
    fn take_transfer(&mut self, path: &str) -> Transfer {
        let PendingSender {
            parts,
            reply,
            capacity: _,
            id: _,
        } = self
            .sender
            .take()
            .expect("Bug: transfer started without a sender");
        Transfer {
            path: path.to_owned(),
            body: parts.body,
            reply,
            content_length: parts.content_length,
            content_type: parts.content_type,
            receivers: self.receivers.drain(..).map(|r| r.reply).collect(),
        }
    }
}
