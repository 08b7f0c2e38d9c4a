pub mod blockchain;
pub mod import_blocks;
pub mod reindex;
pub mod run;
pub mod verify_chain;
