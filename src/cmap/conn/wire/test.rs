use bson::{doc, rawdoc, RawDocumentBuf};

use super::{message::DEFAULT_MAX_MESSAGE_SIZE_BYTES, DocumentSequence, Message, MessageFlags};

fn body() -> RawDocumentBuf {
    rawdoc! { "insert": "coll", "$db": "test", "ordered": true }
}

#[tokio::test]
async fn round_trip_body_only() {
    let message = Message::new(body());
    let encoded = message.encode(42);

    let mut reader = encoded.as_slice();
    let parsed = Message::read_from(&mut reader, None).await.unwrap();

    // The command body survives bytewise.
    assert_eq!(parsed.document_payload.as_bytes(), body().as_bytes());
    assert!(parsed.document_sequences.is_empty());
    assert_eq!(encoded.len(), message.encoded_len());
}

#[tokio::test]
async fn round_trip_document_sequence() {
    let docs = vec![
        rawdoc! { "a": 1 },
        rawdoc! { "b": "two" },
        rawdoc! { "c": 3.5 },
    ];
    let message = Message::with_sequences(
        body(),
        vec![DocumentSequence {
            identifier: "documents".to_string(),
            documents: docs.clone(),
        }],
    );
    let encoded = message.encode(7);

    let mut reader = encoded.as_slice();
    let parsed = Message::read_from(&mut reader, None).await.unwrap();

    assert_eq!(parsed.document_sequences.len(), 1);
    let sequence = &parsed.document_sequences[0];
    assert_eq!(sequence.identifier, "documents");
    assert_eq!(sequence.documents.len(), 3);
    for (parsed_doc, original) in sequence.documents.iter().zip(&docs) {
        assert_eq!(parsed_doc.as_bytes(), original.as_bytes());
    }
}

#[tokio::test]
async fn reply_body_reassembles_sequences() {
    let message = Message::with_sequences(
        rawdoc! { "ok": 1 },
        vec![DocumentSequence {
            identifier: "cursor".to_string(),
            documents: vec![rawdoc! { "x": 1 }],
        }],
    );
    let reassembled: bson::Document = message
        .into_reply_body()
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(
        reassembled,
        doc! { "ok": 1, "cursor": [ { "x": 1 } ] }
    );
}

#[tokio::test]
async fn oversized_message_rejected() {
    let message = Message::new(body());
    let encoded = message.encode(1);

    let mut reader = encoded.as_slice();
    let result = Message::read_from(&mut reader, Some(16)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_opcode_rejected() {
    let message = Message::new(body());
    let mut encoded = message.encode(1);
    // Overwrite the opcode field with OP_QUERY (2004), which OP_MSG replaced.
    encoded[12..16].copy_from_slice(&2004i32.to_le_bytes());

    let mut reader = encoded.as_slice();
    assert!(Message::read_from(&mut reader, None).await.is_err());
}

#[tokio::test]
async fn invalid_section_kind_rejected() {
    let message = Message::new(body());
    let mut encoded = message.encode(1);
    // The kind byte of the first section sits right after the header and flag bits.
    encoded[20] = 9;

    let mut reader = encoded.as_slice();
    assert!(Message::read_from(&mut reader, None).await.is_err());
}

#[tokio::test]
async fn truncated_sequence_rejected() {
    let message = Message::with_sequences(
        body(),
        vec![DocumentSequence {
            identifier: "ops".to_string(),
            documents: vec![rawdoc! { "a": 1 }],
        }],
    );
    let encoded = message.encode(1);
    let mut truncated = encoded[..encoded.len() - 3].to_vec();
    // Fix up the header length so the truncation shows up during section parsing.
    let new_len = truncated.len() as i32;
    truncated[0..4].copy_from_slice(&new_len.to_le_bytes());

    let mut reader = truncated.as_slice();
    assert!(Message::read_from(&mut reader, None).await.is_err());
}

#[tokio::test]
async fn checksum_stripped_from_sections() {
    let message = Message::new(rawdoc! { "ok": 1 });
    let mut encoded = message.encode(1);

    // Set the checksum flag and append a trailing crc32 value.
    let flags = MessageFlags::CHECKSUM_PRESENT.bits();
    encoded[16..20].copy_from_slice(&flags.to_le_bytes());
    encoded.extend(0xdeadbeefu32.to_le_bytes());
    let new_len = encoded.len() as i32;
    encoded[0..4].copy_from_slice(&new_len.to_le_bytes());

    let mut reader = encoded.as_slice();
    let parsed = Message::read_from(&mut reader, None).await.unwrap();
    assert_eq!(parsed.checksum, Some(0xdeadbeef));
    let parsed_body: bson::Document = parsed.document_payload.try_into().unwrap();
    assert_eq!(parsed_body, doc! { "ok": 1 });
}

#[test]
fn default_max_message_size_matches_server_default() {
    assert_eq!(DEFAULT_MAX_MESSAGE_SIZE_BYTES, 48 * 1024 * 1024);
}

#[cfg(feature = "zlib-compression")]
#[tokio::test]
async fn compressed_round_trip() {
    use super::Compressor;

    let docs = vec![rawdoc! { "a": "b" }; 16];
    let message = Message::with_sequences(
        body(),
        vec![DocumentSequence {
            identifier: "documents".to_string(),
            documents: docs,
        }],
    );

    let mut encoded = Vec::new();
    message
        .write_compressed_to(&mut encoded, &Compressor::Zlib { level: None }, 3)
        .await
        .unwrap();

    let mut reader = encoded.as_slice();
    let parsed = Message::read_from(&mut reader, None).await.unwrap();
    assert_eq!(
        parsed.document_payload.as_bytes(),
        message.document_payload.as_bytes()
    );
    assert_eq!(parsed.document_sequences.len(), 1);
    assert_eq!(parsed.document_sequences[0].documents.len(), 16);
}
