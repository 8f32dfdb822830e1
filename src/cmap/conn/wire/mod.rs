mod compression;
mod header;
mod message;

#[cfg(test)]
mod test;

pub(crate) use self::message::{DocumentSequence, Message, MessageFlags};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
pub use self::compression::Compressor;
pub(crate) use self::compression::CompressorId;

pub(crate) fn next_request_id() -> i32 {
    use std::sync::atomic::{AtomicI32, Ordering};
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}
