#![allow(clippy::too_many_arguments, clippy::needless_range_loop,
         clippy::manual_range_contains, clippy::comparison_chain)]

pub mod context;
pub mod plug_in;
pub mod parser;
pub mod demo_file;
pub mod obituaries;
pub mod cut_by_chat;
pub mod cut_by_frag;
pub mod splitter;
pub mod api;

#[cfg(test)]
pub mod test_support;
