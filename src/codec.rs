//! Length-prefixed bincode frames: a big-endian `u32` length followed by an
//! encoded [`RpcMessage`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core_types::RpcMessage;
use crate::error::RaftError;

pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, message: &RpcMessage) -> Result<(), RaftError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RaftError::validation(
            "frame",
            format!("{} bytes exceeds the frame limit", body.len()),
        ));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` means the peer closed the connection
/// cleanly between frames. Zero-length frames are skipped.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<RpcMessage>, RaftError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len == 0 {
            continue;
        }
        if len > MAX_FRAME_LEN {
            return Err(RaftError::validation(
                "frame",
                format!("{} bytes exceeds the frame limit", len),
            ));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        return Ok(Some(bincode::deserialize(&body)?));
    }
}
