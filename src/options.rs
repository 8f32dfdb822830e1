//! Contains all of the types needed to specify options to the methods in this crate.

pub use crate::{
    change_stream::options::*,
    client::options::*,
    client::session::{SessionOptions, TransactionOptions},
    coll::{options::*, CollectionOptions},
    concern::*,
    db::DatabaseOptions,
    selection_criteria::*,
};

pub use crate::bulk_write::BulkWriteOptions;

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
pub use crate::cmap::conn::wire::Compressor;
