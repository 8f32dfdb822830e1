use bson::{Bson, Document, RawArrayBuf, RawDocumentBuf};

use crate::error::{Error, Result};

pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Returns the first key in the document, which is the command name for command documents.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// Serializes the document to raw bytes and returns its length, validating that it serializes
/// cleanly.
pub(crate) fn doc_size_bytes(doc: &Document) -> Result<usize> {
    Ok(bson::to_vec(doc).map_err(Error::from)?.len())
}

pub(crate) fn to_raw_document_buf(doc: &Document) -> Result<RawDocumentBuf> {
    let bytes = bson::to_vec(doc).map_err(Error::from)?;
    RawDocumentBuf::from_bytes(bytes).map_err(Error::from)
}

pub(crate) fn vec_to_raw_array_buf(docs: Vec<RawDocumentBuf>) -> RawArrayBuf {
    let mut array = RawArrayBuf::new();
    for doc in docs {
        array.push(doc);
    }
    array
}

/// Reads the little-endian length prefix of a serialized BSON document without parsing it.
pub(crate) fn read_document_length(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 4 {
        return Err(Error::invalid_response(
            "truncated BSON document: missing length prefix",
        ));
    }
    let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if length < 5 {
        return Err(Error::invalid_response(format!(
            "invalid BSON document length: {}",
            length
        )));
    }
    Ok(length as usize)
}

/// Splits a buffer of back-to-back serialized BSON documents into individual documents.
pub(crate) fn split_document_sequence(mut bytes: &[u8]) -> Result<Vec<RawDocumentBuf>> {
    let mut docs = Vec::new();
    while !bytes.is_empty() {
        let length = read_document_length(bytes)?;
        if bytes.len() < length {
            return Err(Error::invalid_response(
                "truncated BSON document in document sequence",
            ));
        }
        let (doc, rest) = bytes.split_at(length);
        docs.push(RawDocumentBuf::from_bytes(doc.to_vec())?);
        bytes = rest;
    }
    Ok(docs)
}

/// Whether the given update document is a pipeline or contains only `$`-prefixed operators.
pub(crate) fn update_document_check(update: &Document) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    match first_key(update) {
        Some(key) if key.starts_with('$') => Ok(()),
        _ => Err(Error::invalid_argument(
            "update document must only contain update modifiers",
        )),
    }
}

/// Verifies that a replacement document does not contain update modifiers.
pub(crate) fn replacement_document_check(replacement: &Document) -> Result<()> {
    match first_key(replacement) {
        Some(key) if key.starts_with('$') => Err(Error::invalid_argument(
            "replacement document must not contain update modifiers",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn document_sequence_round_trip() {
        let d1 = bson::to_vec(&doc! { "a": 1 }).unwrap();
        let d2 = bson::to_vec(&doc! { "b": "two" }).unwrap();
        let mut seq = d1.clone();
        seq.extend_from_slice(&d2);

        let docs = split_document_sequence(&seq).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].as_bytes(), d1.as_slice());
        assert_eq!(docs[1].as_bytes(), d2.as_slice());
    }

    #[test]
    fn document_sequence_rejects_truncation() {
        let bytes = bson::to_vec(&doc! { "a": 1 }).unwrap();
        assert!(split_document_sequence(&bytes[..bytes.len() - 1]).is_err());
        assert!(read_document_length(&[1, 0]).is_err());
    }

    #[test]
    fn update_and_replacement_checks() {
        assert!(update_document_check(&doc! { "$set": { "a": 1 } }).is_ok());
        assert!(update_document_check(&doc! { "a": 1 }).is_err());
        assert!(replacement_document_check(&doc! { "a": 1 }).is_ok());
        assert!(replacement_document_check(&doc! { "$set": { "a": 1 } }).is_err());
    }
}
