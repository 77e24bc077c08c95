// fieldsync-common: shared types and wire protocol for the fieldsync workspace

pub mod protocol;
pub mod types;
