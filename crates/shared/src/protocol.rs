use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single-frame payload. Guards both the guest-agent vsock channel
/// and the engine's exec/migration channels against a runaway length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    TooLarge(u32, u32),
}

/// Send one length-prefixed frame.
///
/// Warning: this is a private wire protocol — every reader on the other end
/// of the stream must consume a frame with [`receive_frame`] before the next
/// message is sent, or the stream desyncs.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FrameError> {
    if data.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(FrameError::TooLarge(data.len() as u32, MAX_FRAME_BYTES));
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Receive one length-prefixed frame.
pub async fn receive_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = stream.read_u32_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len, MAX_FRAME_BYTES));
    }
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
