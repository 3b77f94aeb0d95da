pub mod codecs;
pub mod jitter;
pub mod listener;
pub mod port_pool;
pub mod rtp;
pub mod sender;
