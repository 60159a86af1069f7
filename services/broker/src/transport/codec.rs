// Frame and message encoding/decoding helpers over TCP streams, with
// size limits enforced before any payload allocation.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use quiver_wire::{Frame, FrameHeader, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Low-level frame reader with a max payload cap. Returns `Ok(None)` on a
// clean FIN at a frame boundary; EOF inside a frame is an error.
pub async fn read_frame<R>(recv: &mut R, max_payload_bytes: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    let mut filled = 0;
    while filled < header_bytes.len() {
        let n = recv
            .read(&mut header_bytes[filled..])
            .await
            .context("read frame header")?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(anyhow!("connection closed mid-header"));
        }
        filled += n;
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = header.length as usize;
    if length > max_payload_bytes {
        return Err(anyhow!(
            "frame length {length} exceeds max_payload_bytes {max_payload_bytes}"
        ));
    }
    let mut payload = vec![0u8; length];
    recv.read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

// Low-level frame writer.
pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    send.flush().await.context("flush frame")?;
    Ok(())
}

// Helper for tests and small control flows.
pub async fn read_message<R>(recv: &mut R, max_frame_bytes: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let frame = match read_frame(recv, max_frame_bytes).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Message::decode(frame).map(Some).context("decode message")
}

// Helper to encode + write a single message.
pub async fn write_message<W>(send: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode().context("encode message")?;
    write_frame(send, &frame).await
}
