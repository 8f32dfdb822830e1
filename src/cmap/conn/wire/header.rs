use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The wire protocol op codes understood by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpCode {
    Compressed = 2012,
    Message = 2013,
}

impl OpCode {
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(Error::invalid_response(format!(
                "invalid or unsupported wire protocol opcode: {}",
                other
            ))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header to bytes.
    pub(crate) fn to_vec(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LENGTH);
        bytes.extend(self.length.to_le_bytes());
        bytes.extend(self.request_id.to_le_bytes());
        bytes.extend(self.response_to.to_le_bytes());
        bytes.extend((self.op_code as i32).to_le_bytes());
        bytes
    }

    /// Writes the serialized header to the stream.
    #[allow(dead_code)]
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.to_vec()).await?;
        Ok(())
    }

    /// Reads bytes from the stream and deserializes them into a header.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self> {
        let length = stream.read_i32_le().await?;
        let request_id = stream.read_i32_le().await?;
        let response_to = stream.read_i32_le().await?;
        let op_code = OpCode::from_i32(stream.read_i32_le().await?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}
