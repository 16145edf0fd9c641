//! Compile-time defaults, generated by build.rs
//!
//! Set `COT_CONFIG_RS=/path/to/cot_config.rs` at build time to override any
//! subset of these with `pub const NAME: TYPE = VALUE;` lines.

include!(concat!(env!("OUT_DIR"), "/cot_merged_config.rs"));
