// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide path-to-slot map
//!
//! The registry serialises slot creation and lookup so that concurrent
//! arrivals on the same path always meet in the same [`Slot`]. Slots remove
//! themselves on termination; removal is identity-checked so a finished slot
//! can never evict a successor that has already taken over its path.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::response::GenericResponse;
use crate::slot::{ReceiverRejected, SenderParts, SenderRejected, Slot};

/// Cheap handle to the process-wide rendezvous map.
#[derive(Clone, Default)]
pub struct Registry {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of paths with a live rendezvous in progress.
    pub fn len(&self) -> usize {
        self.shared.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a sender on `path` and wait out the whole exchange.
    ///
    /// Resolves once the transfer has finished (or the sender was rejected);
    /// the response body streams progress lines in the transfer case.
    pub(crate) async fn send(
        &self,
        path: &str,
        capacity: usize,
        parts: SenderParts,
    ) -> GenericResponse {
        let mut parts = parts;
        loop {
            let slot = self.lookup_or_create(path);
            match slot.register_sender(self, capacity, parts) {
                Ok(admission) => return admission.resolve().await,
                Err(SenderRejected::Busy(reject)) => return reject.into_response(),
                // Lost a race against slot completion; go again with a
                // fresh slot.
                Err(SenderRejected::Finished(returned)) => parts = returned,
            }
        }
    }

    /// Admit a receiver on `path` and wait for its response.
    ///
    /// Resolves with the committed 200 (body streaming from the sender) or a
    /// 400 rejection.
    pub(crate) async fn receive(&self, path: &str) -> GenericResponse {
        loop {
            let slot = self.lookup_or_create(path);
            match slot.register_receiver(self) {
                Ok(admission) => return admission.resolve().await,
                Err(ReceiverRejected::Busy(reject)) => return reject.into_response(),
                Err(ReceiverRejected::Finished) => continue,
            }
        }
    }

    /// Look up the live slot for `path`, creating one if there is none.
    ///
    /// A slot that already reached its terminal state is replaced; it is
    /// inert and its own removal will be a no-op thanks to the identity
    /// check.
    pub(crate) fn lookup_or_create(&self, path: &str) -> Slot {
        let mut slots = self.shared.slots.lock().unwrap();
        match slots.entry(path.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_done() {
                    let fresh = Slot::new(path);
                    occupied.insert(fresh.clone());
                    fresh
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                debug!(path, "creating slot");
                let slot = Slot::new(path);
                vacant.insert(slot.clone());
                slot
            }
        }
    }

    /// Remove `slot` from the map, but only while it is still the current
    /// occupant of its path.
    pub(crate) fn remove(&self, path: &str, slot: &Slot) {
        let mut slots = self.shared.slots.lock().unwrap();
        if slots.get(path).is_some_and(|current| current.ptr_eq(slot)) {
            debug!(path, "disposing slot");
            slots.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use http_body_util::combinators::BoxBody;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper::header::HeaderValue;
    use hyper::StatusCode;

    fn parts(content: &'static str) -> SenderParts {
        let body: BoxBody<Bytes, anyhow::Error> = Full::new(Bytes::from_static(content.as_bytes()))
            .map_err(|_| unreachable!())
            .boxed();
        SenderParts {
            body,
            content_length: Some(HeaderValue::from_str(&content.len().to_string()).unwrap()),
            content_type: Some(HeaderValue::from_static("text/plain")),
        }
    }

    async fn body_string(response: GenericResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Spin until the registry has settled down to `expected` live paths.
    async fn wait_for_len(registry: &Registry, expected: usize) {
        for _ in 0..100 {
            if registry.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never settled at {expected} paths");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_returns_the_same_slot() {
        let registry = Registry::new();
        let a = registry.lookup_or_create("/a");
        let b = registry.lookup_or_create("/a");
        assert!(a.ptr_eq(&b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removal_is_identity_checked() {
        let registry = Registry::new();
        let original = registry.lookup_or_create("/a");
        let unrelated = Slot::new("/a");

        registry.remove("/a", &unrelated);
        assert_eq!(registry.len(), 1, "imposter must not evict the occupant");

        registry.remove("/a", &original);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sender_first_roundtrip() {
        let registry = Registry::new();

        let send = registry.send("/data", 1, parts("this is a content"));
        let receive = async {
            // Give the sender a head start so it is the one parked.
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.receive("/data").await
        };
        let (sent, got) = tokio::join!(send, receive);

        assert_eq!(got.status(), StatusCode::OK);
        assert_eq!(
            got.headers().get(hyper::header::CONTENT_LENGTH).unwrap(),
            "17"
        );
        assert_eq!(
            got.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(body_string(got).await, "this is a content");

        assert_eq!(sent.status(), StatusCode::OK);
        let progress = body_string(sent).await;
        assert!(progress.contains("1 receiver(s) connected"), "{progress}");

        wait_for_len(&registry, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receiver_first_roundtrip() {
        let registry = Registry::new();

        let receive = registry.receive("/data");
        let send = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.send("/data", 1, parts("this is a content")).await
        };
        let (got, sent) = tokio::join!(receive, send);

        assert_eq!(got.status(), StatusCode::OK);
        assert_eq!(body_string(got).await, "this is a content");
        assert_eq!(sent.status(), StatusCode::OK);

        wait_for_len(&registry, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn path_is_reusable_after_completion() {
        let registry = Registry::new();

        for round in 0..2u8 {
            let receive = registry.receive("/again");
            let send = async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.send("/again", 1, parts("round data")).await
            };
            let (got, _sent) = tokio::join!(receive, send);
            assert_eq!(got.status(), StatusCode::OK, "round {round}");
            assert_eq!(body_string(got).await, "round data");
        }
        wait_for_len(&registry, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receiver_sees_abort_when_sender_body_fails() {
        let registry = Registry::new();

        let chunks: Vec<Result<hyper::body::Frame<Bytes>, anyhow::Error>> = vec![
            Ok(hyper::body::Frame::data(Bytes::from_static(b"partial"))),
            Err(anyhow::anyhow!("connection reset")),
        ];
        let body = http_body_util::StreamBody::new(futures::stream::iter(chunks)).boxed();
        let failing = SenderParts {
            body,
            content_length: None,
            content_type: None,
        };

        let send = registry.send("/doomed", 1, failing);
        let receive = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.receive("/doomed").await
        };
        let (_sent, got) = tokio::join!(send, receive);

        assert_eq!(got.status(), StatusCode::OK);
        let collected = got.into_body().collect().await;
        assert!(collected.is_err(), "truncated body must surface as an error");

        wait_for_len(&registry, 0).await;
    }
}
