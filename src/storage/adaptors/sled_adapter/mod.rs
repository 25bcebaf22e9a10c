mod sled_storage_engine;

pub use sled_storage_engine::*;


use crate::config::BackendConfig;
use crate::constants::STORAGE_ENGINE_DIR;
use crate::Error;

/// Opens the sled database under `<data_dir>/storage_engine`
#[doc(hidden)]
pub fn init_sled_storage_engine_db(config: &BackendConfig) -> Result<sled::Db, Error> {
    tracing::debug!("init_sled_storage_engine_db from path: {:?}", &config.data_dir);

    let db_path = config.data_dir.join(STORAGE_ENGINE_DIR);

    sled::Config::default()
        .path(&db_path)
        .cache_capacity(config.cache_capacity_in_bytes)
        .flush_every_ms(config.flush_every_ms)
        .use_compression(config.use_compression)
        .compression_factor(1)
        .mode(sled::Mode::HighThroughput)
        .open()
        .map_err(|e| {
            tracing::warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                db_path,
                e
            );
            e.into()
        })
}
