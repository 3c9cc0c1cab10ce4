mod local_store;


use std::path::Path;

#[doc(hidden)]
pub use local_store::*;
use tracing::debug;
use tracing::warn;

/// Opens the embedded store backing the FSM: one sled database holding the
/// data and metadata partitions as separate trees.
pub fn init_sled_local_store(
    root_path: impl AsRef<Path> + std::fmt::Debug
) -> std::result::Result<sled::Db, std::io::Error> {
    debug!("init_sled_local_store from path: {:?}", &root_path);

    let path = root_path.as_ref();
    let store_db_path = path.join("store");

    sled::Config::default()
        .path(&store_db_path)
        .cache_capacity(64 * 1024 * 1024) //64MB
        .flush_every_ms(Some(3))
        .use_compression(true)
        .compression_factor(1)
        .open()
        .map_err(|e| {
            warn!("Try to open DB at this location: {:?} and failed: {:?}", store_db_path, e);
            std::io::Error::other(e)
        })
}
