pub mod category;
pub mod config;
pub mod dom;
pub mod event;
pub mod fetch;
pub mod frontpage;
pub mod fsindex;
pub mod listener;
pub mod materialize;
pub mod render;
pub mod runtime;
pub mod sync;
pub mod title;
pub mod trace;
pub mod transform;
pub mod writer;

#[cfg(test)]
mod testing;
