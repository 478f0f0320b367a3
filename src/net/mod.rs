pub mod aoi;
pub mod archive;
pub mod archive_builder;
pub mod connection;
pub mod policy;
pub mod protocol;
