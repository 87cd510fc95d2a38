//! NBD wire protocol: newstyle handshake with fixed-newstyle option
//! negotiation and the simple-reply transmission phase.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NbdError;

pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
pub const REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;

pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_ABORT: u32 = 2;
pub const OPT_LIST: u32 = 3;

pub const REP_ACK: u32 = 1;
pub const REP_SERVER: u32 = 2;
pub const REP_ERR_UNSUP: u32 = 0x8000_0001;

pub const TRANSMISSION_HAS_FLAGS: u16 = 1 << 0;
pub const TRANSMISSION_READ_ONLY: u16 = 1 << 1;
pub const TRANSMISSION_SEND_FLUSH: u16 = 1 << 2;

pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;

pub const EIO: u32 = 5;
pub const EINVAL: u32 = 22;
pub const EPERM: u32 = 1;

/// Largest request payload we accept (the protocol suggests 32 MiB).
pub const MAX_REQUEST_LENGTH: u32 = 32 * 1024 * 1024;

/// One parsed transmission-phase request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

/// Server side of the initial handshake; returns the client flags.
pub async fn server_handshake<S>(stream: &mut S) -> Result<u16, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u64(NBDMAGIC).await?;
    stream.write_u64(IHAVEOPT).await?;
    stream
        .write_u16(FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES)
        .await?;
    stream.flush().await?;

    let client_flags = stream.read_u32().await?;
    Ok(client_flags as u16)
}

/// One option header from the client: `(option, data)`.
pub async fn read_option<S>(stream: &mut S) -> Result<(u32, Vec<u8>), NbdError>
where
    S: AsyncRead + Unpin,
{
    let magic = stream.read_u64().await?;
    if magic != IHAVEOPT {
        return Err(NbdError::protocol(format!(
            "bad option magic {magic:#x}"
        )));
    }
    let option = stream.read_u32().await?;
    let length = stream.read_u32().await?;
    if length > MAX_REQUEST_LENGTH {
        return Err(NbdError::protocol(format!(
            "oversized option payload ({length} bytes)"
        )));
    }
    let mut data = vec![0u8; length as usize];
    stream.read_exact(&mut data).await?;
    Ok((option, data))
}

pub async fn write_option_reply<S>(
    stream: &mut S,
    option: u32,
    reply: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply).await?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// The export-name reply that moves the connection into transmission
/// phase: size, transmission flags, and the 124 pad bytes unless the
/// client negotiated NO_ZEROES.
pub async fn write_export_info<S>(
    stream: &mut S,
    size: u64,
    transmission_flags: u16,
    no_zeroes: bool,
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(size).await?;
    stream.write_u16(transmission_flags).await?;
    if !no_zeroes {
        stream.write_all(&[0u8; 124]).await?;
    }
    stream.flush().await?;
    Ok(())
}

pub async fn read_request<S>(stream: &mut S) -> Result<Request, NbdError>
where
    S: AsyncRead + Unpin,
{
    let magic = stream.read_u32().await?;
    if magic != REQUEST_MAGIC {
        return Err(NbdError::protocol(format!(
            "bad request magic {magic:#x}"
        )));
    }
    let _command_flags = stream.read_u16().await?;
    let command = stream.read_u16().await?;
    let handle = stream.read_u64().await?;
    let offset = stream.read_u64().await?;
    let length = stream.read_u32().await?;
    if length > MAX_REQUEST_LENGTH {
        return Err(NbdError::protocol(format!(
            "oversized request ({length} bytes)"
        )));
    }
    Ok(Request {
        command,
        handle,
        offset,
        length,
    })
}

pub async fn write_simple_reply<S>(
    stream: &mut S,
    error: u32,
    handle: u64,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(SIMPLE_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}
