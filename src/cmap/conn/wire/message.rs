use std::io::Read;

use bitflags::bitflags;
use bson::RawDocumentBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    compression,
    header::{Header, OpCode},
    CompressorId,
};
use crate::{
    bson_util,
    error::{Error, Result},
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use super::Compressor;

/// The default maximum message size, used when the server has not yet advertised a limit.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// An OP_MSG wire protocol message.
///
/// A message carries exactly one kind-0 section (the command body) and any number of kind-1
/// sections (identified document sequences laid out back-to-back without framing).
#[derive(Clone, Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: RawDocumentBuf,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

/// A kind-1 OP_MSG section: an identifier naming the command field the documents belong to,
/// followed by the documents themselves.
#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl DocumentSequence {
    /// The number of bytes this section occupies on the wire: kind byte, size prefix,
    /// identifier with null terminator, then the documents back-to-back.
    fn encoded_len(&self) -> usize {
        1 + 4
            + self.identifier.len()
            + 1
            + self
                .documents
                .iter()
                .map(|d| d.as_bytes().len())
                .sum::<usize>()
    }
}

impl Message {
    /// Creates a new message with the given command body and no document sequences.
    pub(crate) fn new(document_payload: RawDocumentBuf) -> Self {
        Self {
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload,
            document_sequences: Vec::new(),
            checksum: None,
            request_id: None,
        }
    }

    /// Creates a new message carrying the given document sequences in kind-1 sections.
    pub(crate) fn with_sequences(
        document_payload: RawDocumentBuf,
        document_sequences: Vec<DocumentSequence>,
    ) -> Self {
        Self {
            document_sequences,
            ..Self::new(document_payload)
        }
    }

    /// The total length of this message on the wire, including the header.
    pub(crate) fn encoded_len(&self) -> usize {
        Header::LENGTH
            + 4 // flag bits
            + 1 // kind byte for the body section
            + self.document_payload.as_bytes().len()
            + self
                .document_sequences
                .iter()
                .map(DocumentSequence::encoded_len)
                .sum::<usize>()
    }

    /// Reads a full message from `reader`, handling OP_COMPRESSED unwrapping.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        if header.length < Header::LENGTH as i32 || header.length > max_len {
            return Err(Error::invalid_response(format!(
                "message length {} out of bounds (max: {})",
                header.length, max_len
            )));
        }

        let mut buf = vec![0u8; header.length as usize - Header::LENGTH];
        reader.read_exact(&mut buf).await?;

        let mut message = match header.op_code {
            OpCode::Message => Self::parse_sections(header.response_to, &buf),
            OpCode::Compressed => Self::parse_compressed(header.response_to, &buf),
        }?;
        message.request_id = Some(header.request_id);
        Ok(message)
    }

    fn parse_compressed(response_to: i32, mut bytes: &[u8]) -> Result<Self> {
        let original_opcode = read_i32(&mut bytes)?;
        if original_opcode != OpCode::Message as i32 {
            return Err(Error::invalid_response(format!(
                "OP_COMPRESSED messages must contain an OP_MSG, got opcode {}",
                original_opcode
            )));
        }
        let uncompressed_size = read_i32(&mut bytes)?;
        let mut compressor_id = 0u8;
        std::io::Read::read_exact(&mut bytes, std::slice::from_mut(&mut compressor_id))?;

        let decompressed = compression::decompress(
            CompressorId::from_u8(compressor_id)?,
            uncompressed_size,
            bytes,
        )?;
        Self::parse_sections(response_to, &decompressed)
    }

    /// Parses the flag bits and section list of an OP_MSG body (everything after the header).
    fn parse_sections(response_to: i32, mut bytes: &[u8]) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(read_i32(&mut bytes)? as u32);

        let mut checksum = None;
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            if bytes.len() < 4 {
                return Err(Error::invalid_response(
                    "checksum flag set but message too short to contain one",
                ));
            }
            let (rest, checksum_bytes) = bytes.split_at(bytes.len() - 4);
            checksum = Some(u32::from_le_bytes([
                checksum_bytes[0],
                checksum_bytes[1],
                checksum_bytes[2],
                checksum_bytes[3],
            ]));
            bytes = rest;
        }

        let mut document_payload = None;
        let mut document_sequences = Vec::new();

        while !bytes.is_empty() {
            let kind = bytes[0];
            bytes = &bytes[1..];
            match kind {
                0 => {
                    let length = bson_util::read_document_length(bytes)?;
                    if bytes.len() < length {
                        return Err(Error::invalid_response(
                            "truncated command body in OP_MSG section",
                        ));
                    }
                    let (doc, rest) = bytes.split_at(length);
                    if document_payload
                        .replace(RawDocumentBuf::from_bytes(doc.to_vec())?)
                        .is_some()
                    {
                        return Err(Error::invalid_response(
                            "OP_MSG contained multiple kind-0 sections",
                        ));
                    }
                    bytes = rest;
                }
                1 => {
                    let section_length = read_i32(&mut bytes)? as usize;
                    // The size prefix covers itself, the identifier, and the documents.
                    if section_length < 4 || bytes.len() < section_length - 4 {
                        return Err(Error::invalid_response(
                            "truncated document sequence in OP_MSG section",
                        ));
                    }
                    let (section, rest) = bytes.split_at(section_length - 4);
                    bytes = rest;

                    let null_index = section.iter().position(|b| *b == 0).ok_or_else(|| {
                        Error::invalid_response("unterminated document sequence identifier")
                    })?;
                    let identifier = std::str::from_utf8(&section[..null_index])
                        .map_err(|e| Error::invalid_response(e.to_string()))?
                        .to_string();
                    let documents = bson_util::split_document_sequence(&section[null_index + 1..])?;
                    document_sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG section kind: {}",
                        other
                    )))
                }
            }
        }

        let document_payload = document_payload
            .ok_or_else(|| Error::invalid_response("OP_MSG contained no kind-0 section"))?;

        Ok(Self {
            response_to,
            flags,
            document_payload,
            document_sequences,
            checksum,
            request_id: None,
        })
    }

    /// Serializes the message (header included) for the wire.
    pub(crate) fn encode(&self, request_id: i32) -> Vec<u8> {
        let header = Header {
            length: self.encoded_len() as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut bytes = header.to_vec();
        bytes.extend(self.flags.bits().to_le_bytes());
        bytes.push(0);
        bytes.extend(self.document_payload.as_bytes());
        for sequence in &self.document_sequences {
            bytes.push(1);
            let section_length = sequence.encoded_len() - 1;
            bytes.extend((section_length as i32).to_le_bytes());
            bytes.extend(sequence.identifier.as_bytes());
            bytes.push(0);
            for doc in &sequence.documents {
                bytes.extend(doc.as_bytes());
            }
        }
        bytes
    }

    /// Writes the message to the stream.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        stream: &mut W,
        request_id: i32,
    ) -> Result<()> {
        stream.write_all(&self.encode(request_id)).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Compresses the message body and writes it to the stream inside an OP_COMPRESSED
    /// envelope.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin + Send>(
        &self,
        stream: &mut W,
        compressor: &Compressor,
        request_id: i32,
    ) -> Result<()> {
        let encoded = self.encode(request_id);
        let to_compress = &encoded[Header::LENGTH..];
        let compressed = compressor.compress(to_compress)?;

        let header = Header {
            length: (Header::LENGTH + 4 + 4 + 1 + compressed.len()) as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        let mut bytes = header.to_vec();
        bytes.extend((OpCode::Message as i32).to_le_bytes());
        bytes.extend((to_compress.len() as i32).to_le_bytes());
        bytes.push(compressor.id() as u8);
        bytes.extend(compressed);

        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Returns the single document this reply carries, reassembling any kind-1 sections back
    /// into the body under their identifiers.
    pub(crate) fn into_reply_body(self) -> Result<RawDocumentBuf> {
        if self.document_sequences.is_empty() {
            return Ok(self.document_payload);
        }
        let mut body = self.document_payload;
        for sequence in self.document_sequences {
            let array = bson_util::vec_to_raw_array_buf(sequence.documents);
            body.append(sequence.identifier, array);
        }
        Ok(body)
    }
}

bitflags! {
    /// The OP_MSG flag bits.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b1;
        const MORE_TO_COME     = 0b10;
        const EXHAUST_ALLOWED  = 0b1_00000000_00000000;
    }
}

fn read_i32(bytes: &mut &[u8]) -> Result<i32> {
    if bytes.len() < 4 {
        return Err(Error::invalid_response("unexpected end of wire message"));
    }
    let (int_bytes, rest) = bytes.split_at(4);
    *bytes = rest;
    Ok(i32::from_le_bytes([
        int_bytes[0],
        int_bytes[1],
        int_bytes[2],
        int_bytes[3],
    ]))
}
