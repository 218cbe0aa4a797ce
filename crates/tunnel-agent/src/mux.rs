//! Control-stream framing and channel multiplexing for the agent's one
//! connection to the hub — the agent-side twin of `tunnel-hub`'s
//! `server::mux`. Kept in lockstep with it since both sides speak the same
//! wire protocol; duplicated rather than shared because the two live in
//! separate binaries with no common internal crate for this piece.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use tunnel_core::codec::{cbor_decode, frame_encode};
use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::messages::{ChannelClose, ChannelData, ControlMessage};

/// Read exactly one length-prefixed CBOR frame.
pub async fn read_frame<T, R>(reader: &mut R) -> TunnelResult<T>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}

/// Write exactly one length-prefixed CBOR frame.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> TunnelResult<()>
where
    T: serde::Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    Ok(())
}

enum ChannelFrame {
    Data(Vec<u8>),
    Close,
}

/// Shared handle for sending control messages and opening byte-stream
/// channels on the one connection to the hub. Cheap to clone.
#[derive(Clone)]
pub struct Mux {
    tx: mpsc::UnboundedSender<ControlMessage>,
    channels: Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<ChannelFrame>>>>,
    next_id: Arc<AtomicU32>,
}

impl Mux {
    pub fn spawn<R, W>(read_half: R, write_half: W) -> (Self, mpsc::UnboundedReceiver<ControlMessage>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut write_rx) = mpsc::unbounded_channel::<ControlMessage>();
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(msg) = write_rx.recv().await {
                if write_frame(&mut write_half, &msg).await.is_err() {
                    break;
                }
            }
        });

        let channels: Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<ChannelFrame>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (top_tx, top_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let channels_reader = channels.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                let msg: ControlMessage = match read_frame(&mut read_half).await {
                    Ok(m) => m,
                    Err(_) => break,
                };
                match msg {
                    ControlMessage::ChannelData(ChannelData { channel_id, data }) => {
                        let guard = channels_reader.lock().await;
                        if let Some(sender) = guard.get(&channel_id) {
                            let _ = sender.send(ChannelFrame::Data(data));
                        }
                    }
                    ControlMessage::ChannelClose(ChannelClose { channel_id }) => {
                        let mut guard = channels_reader.lock().await;
                        if let Some(sender) = guard.remove(&channel_id) {
                            let _ = sender.send(ChannelFrame::Close);
                        }
                    }
                    other => {
                        if top_tx.send(other).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (
            Self {
                tx,
                channels,
                next_id: Arc::new(AtomicU32::new(1)),
            },
            top_rx,
        )
    }

    pub fn send(&self, msg: ControlMessage) -> TunnelResult<()> {
        self.tx.send(msg).map_err(|_| TunnelError::TransportClosed)
    }

    pub fn alloc_channel_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Pump bytes between `local` and a newly registered channel `channel_id`
    /// until either side closes. Consumes the registration on return.
    pub async fn pump<S>(&self, channel_id: u32, mut local: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelFrame>();
        self.channels.lock().await.insert(channel_id, tx);

        let mut buf = [0u8; 16 * 1024];
        loop {
            tokio::select! {
                read = local.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let _ = self.send(ControlMessage::ChannelClose(ChannelClose { channel_id }));
                            break;
                        }
                        Ok(n) => {
                            let data = buf[..n].to_vec();
                            if self.send(ControlMessage::ChannelData(ChannelData { channel_id, data })).is_err() {
                                break;
                            }
                        }
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Some(ChannelFrame::Data(data)) => {
                            if local.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelFrame::Close) | None => break,
                    }
                }
            }
        }
        self.channels.lock().await.remove(&channel_id);
    }
}
