#![forbid(unsafe_code)]

//! WebSocket transport edge. The session engine only sees the capability
//! set {next frame, write frames, close, remote ip}; swapping the backend
//! (plain TCP vs TLS-terminated WebSocket) stays contained here.

use std::sync::Arc;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::server::client::Client;

pub struct FrameSink {
	sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

pub struct FrameSource {
	stream: SplitStream<WebSocketStream<TcpStream>>,
}

/// Perform the WebSocket handshake. Admission control runs before this:
/// a capped connection is dropped without ever completing the handshake.
pub async fn accept(stream: TcpStream) -> anyhow::Result<(FrameSink, FrameSource)> {
	let ws = tokio_tungstenite::accept_async(stream)
		.await
		.context("websocket handshake")?;
	let (sink, stream) = ws.split();
	Ok((FrameSink { sink }, FrameSource { stream }))
}

impl FrameSink {
	/// Write a batch of frames as one binary message. Frames carry their
	/// own length prefixes, so coalescing them is transparent to the
	/// receiver and turns a drained queue into a single write.
	pub async fn send_frames(&mut self, frames: &[Bytes]) -> anyhow::Result<()> {
		let payload = match frames {
			[] => return Ok(()),
			[single] => single.clone(),
			many => {
				let total = many.iter().map(|f| f.len()).sum();
				let mut joined = BytesMut::with_capacity(total);
				for frame in many {
					joined.extend_from_slice(frame);
				}
				joined.freeze()
			}
		};
		self.sink.send(Message::Binary(payload)).await.context("websocket write")
	}

	pub async fn close(&mut self) {
		let _ = self.sink.send(Message::Close(None)).await;
		let _ = self.sink.close().await;
	}
}

impl FrameSource {
	/// Next binary frame; `None` on close or error. Control messages are
	/// handled by the websocket layer; text messages violate the protocol.
	pub async fn next_frame(&mut self) -> Option<Bytes> {
		loop {
			match self.stream.next().await? {
				Ok(Message::Binary(data)) => return Some(data),
				Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
				Ok(Message::Close(_)) => return None,
				Ok(Message::Text(_)) | Ok(Message::Frame(_)) => return None,
				Err(e) => {
					debug!(error = %e, "websocket read failed");
					return None;
				}
			}
		}
	}
}

/// Drain the client's send queue onto the socket. Everything queued while
/// a write was in flight goes out as one batched write; a write failure or
/// a close signal ends the connection.
pub fn spawn_writer(mut sink: FrameSink, mut rx: mpsc::Receiver<Bytes>, client: Arc<Client>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut batch: Vec<Bytes> = Vec::with_capacity(64);
		loop {
			batch.clear();
			tokio::select! {
				_ = client.closer.wait() => break,
				received = rx.recv_many(&mut batch, 64) => {
					if received == 0 {
						break;
					}
					metrics::counter!("vmhub_server_frames_out_total").increment(batch.len() as u64);
					if let Err(e) = sink.send_frames(&batch).await {
						debug!(conn_id = client.conn_id, error = %e, "write failed, closing");
						client.close();
						break;
					}
				}
			}
		}
		sink.close().await;
	})
}
