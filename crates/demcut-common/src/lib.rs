#![allow(clippy::too_many_arguments, clippy::needless_range_loop,
         clippy::manual_range_contains, clippy::comparison_chain)]

pub mod qshared;
pub mod huffman;
pub mod msg;
pub mod fields;
pub mod convert;
pub mod arena;
pub mod tokenizer;
pub mod info;
