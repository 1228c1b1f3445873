pub mod bloom;
pub mod ftype;
pub mod hnsw;
pub mod ids;
pub mod meta;
