//! Behavioural task logs to BIDS `events.tsv`.

pub mod blocks;
pub mod fracback;
pub mod match_logs;

pub use blocks::{merge_block_files, BlockEvent};
pub use fracback::{convert_fracback, FracbackOptions, FracbackReport};
pub use match_logs::{match_fracback_logs, LogMatch};
