// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming fan-out from one sender body to N receiver bodies
//!
//! The pump is the only reader of the sender's request body. Each receiver
//! gets a capacity-1 channel wrapped in a response body, so the in-flight
//! buffer is bounded by one chunk per receiver and the slowest live receiver
//! paces the whole transfer.

use std::pin::Pin;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::response::GenericResponse;

type FrameResult = Result<Frame<Bytes>, anyhow::Error>;

/// One rendezvous worth of work, handed over by the slot.
pub(crate) struct Transfer {
    pub path: String,
    pub body: BoxBody<Bytes, anyhow::Error>,
    pub reply: oneshot::Sender<GenericResponse>,
    pub content_length: Option<HeaderValue>,
    pub content_type: Option<HeaderValue>,
    pub receivers: Vec<oneshot::Sender<GenericResponse>>,
}

enum Outcome {
    Complete,
    SenderAborted(anyhow::Error),
}

/// Drive the transfer to completion.
///
/// Commits every receiver's headers, acknowledges the sender, then streams
/// the sender body chunk by chunk to all live receivers. Returns when the
/// sender body ends or fails.
pub(crate) async fn run(transfer: Transfer) {
    let Transfer {
        path,
        body,
        reply,
        content_length,
        content_type,
        receivers,
    } = transfer;
    let total = receivers.len();

    // Commit headers on every receiver before any body byte flows. A
    // receiver whose handler is already gone simply drops out of the
    // fan-out set.
    let mut outputs: Vec<mpsc::Sender<FrameResult>> = Vec::with_capacity(total);
    for commit in receivers {
        let (tx, rx) = mpsc::channel(1);
        let response = receiver_response(content_length.as_ref(), content_type.as_ref(), rx);
        if commit.send(response).is_ok() {
            outputs.push(tx);
        } else {
            debug!(%path, "receiver left before its headers were committed");
        }
    }

    // Acknowledge the sender, then start reading its body. The channel has
    // room for the acknowledgement and the completion line, so the pump
    // never blocks on the sender's read pace.
    let (progress, progress_rx) = mpsc::channel(2);
    let _ = reply.send(sender_response(progress_rx));
    let connected_line = info_line(format_args!("{total} receiver(s) connected."));
    let _ = progress.send(connected_line).await;

    let mut body = body;
    let mut forwarded: u64 = 0;
    let outcome = loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                forwarded += data.len() as u64;
                fan_out(&mut outputs, data).await;
            }
            Some(Err(err)) => break Outcome::SenderAborted(err),
            None => break Outcome::Complete,
        }
    };

    match outcome {
        Outcome::Complete => {
            let remaining = outputs.len();
            // Dropping the channels ends each receiver body cleanly.
            drop(outputs);
            let line = if remaining == 0 && total > 0 {
                info_line(format_args!(
                    "All receivers disconnected; discarded the remaining bytes."
                ))
            } else {
                info_line(format_args!("Sent to {remaining} receiver(s)."))
            };
            let _ = progress.send(line).await;
            debug!(%path, forwarded, remaining, "transfer complete");
        }
        Outcome::SenderAborted(err) => {
            warn!(%path, forwarded, "sender aborted mid-transfer: {err}");
            // An error frame makes the transport tear the receiver
            // connection down instead of ending the body cleanly.
            for tx in &outputs {
                let _ = tx
                    .send(Err(anyhow::anyhow!("sender aborted mid-transfer")))
                    .await;
            }
        }
    }
}

/// Deliver one chunk to every live receiver; prune the ones that hung up.
async fn fan_out(outputs: &mut Vec<mpsc::Sender<FrameResult>>, chunk: Bytes) {
    if outputs.is_empty() {
        return;
    }
    let sends = outputs
        .iter()
        .map(|tx| tx.send(Ok(Frame::data(chunk.clone()))));
    let delivered = futures::future::join_all(sends).await;
    if delivered.iter().any(|sent| sent.is_err()) {
        let mut delivered = delivered.into_iter();
        outputs.retain(|_| delivered.next().is_some_and(|sent| sent.is_ok()));
    }
}

fn info_line(message: std::fmt::Arguments<'_>) -> FrameResult {
    Ok(Frame::data(Bytes::from(format!("[INFO] {message}\n"))))
}

fn receiver_response(
    content_length: Option<&HeaderValue>,
    content_type: Option<&HeaderValue>,
    rx: mpsc::Receiver<FrameResult>,
) -> GenericResponse {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(length) = content_length {
        builder = builder.header(CONTENT_LENGTH, length);
    }
    if let Some(kind) = content_type {
        builder = builder.header(CONTENT_TYPE, kind);
    }
    builder.body(ChannelBody(rx).boxed()).unwrap()
}

fn sender_response(rx: mpsc::Receiver<FrameResult>) -> GenericResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(ChannelBody(rx).boxed())
        .unwrap()
}

/// Response body fed frame by frame through a bounded channel.
///
/// The sending half lives in the pump; dropping it ends the body, and an
/// `Err` frame aborts the connection.
struct ChannelBody(mpsc::Receiver<FrameResult>);

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<FrameResult>> {
        self.get_mut().0.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::Full;

    fn boxed(content: &'static str) -> BoxBody<Bytes, anyhow::Error> {
        Full::new(Bytes::from_static(content.as_bytes()))
            .map_err(|_| unreachable!())
            .boxed()
    }

    async fn body_string(response: GenericResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_delivers_identical_bytes_to_every_receiver() {
        let (sender_tx, sender_rx) = oneshot::channel();
        let (r1_tx, r1_rx) = oneshot::channel();
        let (r2_tx, r2_rx) = oneshot::channel();

        let transfer = Transfer {
            path: "/t".to_owned(),
            body: boxed("this is a content"),
            reply: sender_tx,
            content_length: Some(HeaderValue::from_static("17")),
            content_type: Some(HeaderValue::from_static("application/octet-stream")),
            receivers: vec![r1_tx, r2_tx],
        };

        let ((), got1, got2, ack) = tokio::join!(
            run(transfer),
            async { r1_rx.await.unwrap() },
            async { r2_rx.await.unwrap() },
            async { sender_rx.await.unwrap() },
        );

        for got in [got1, got2] {
            assert_eq!(got.status(), StatusCode::OK);
            assert_eq!(got.headers().get(CONTENT_LENGTH).unwrap(), "17");
            assert_eq!(
                got.headers().get(CONTENT_TYPE).unwrap(),
                "application/octet-stream"
            );
            assert_eq!(body_string(got).await, "this is a content");
        }

        let progress = body_string(ack).await;
        assert!(progress.contains("2 receiver(s) connected."), "{progress}");
        assert!(progress.contains("Sent to 2 receiver(s)."), "{progress}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sender_is_told_when_every_receiver_is_gone() {
        let (sender_tx, sender_rx) = oneshot::channel();
        let (r1_tx, r1_rx) = oneshot::channel();

        // Two chunks: the first fills the receiver's buffer, the second can
        // only fail once the receiver has hung up.
        let chunks: Vec<FrameResult> = vec![
            Ok(Frame::data(Bytes::from_static(b"wasted "))),
            Ok(Frame::data(Bytes::from_static(b"effort"))),
        ];
        let transfer = Transfer {
            path: "/t".to_owned(),
            body: http_body_util::StreamBody::new(futures::stream::iter(chunks)).boxed(),
            reply: sender_tx,
            content_length: None,
            content_type: None,
            receivers: vec![r1_tx],
        };

        let ((), (), progress) = tokio::join!(
            run(transfer),
            // The receiver hangs up right after its headers are committed,
            // without reading any of the body.
            async {
                let response = r1_rx.await.unwrap();
                drop(response);
            },
            async { body_string(sender_rx.await.unwrap()).await }
        );

        assert!(progress.contains("1 receiver(s) connected."), "{progress}");
        assert!(progress.contains("All receivers disconnected"), "{progress}");
    }
}
