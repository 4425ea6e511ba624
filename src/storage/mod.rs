pub mod lmdb;

pub use lmdb::{ LmdbStorage, SharedLmdbStorage, create_shared_storage };
