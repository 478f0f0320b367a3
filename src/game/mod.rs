pub mod constants;
pub mod entity;
pub mod inventory;
pub mod locomotion;
pub mod minimap;
pub mod region;
pub mod replication;
pub mod session;
pub mod spatial;
