pub mod buffer;
pub mod candle_factory;
pub mod streamer;

pub use buffer::RollingBuffer;
pub use candle_factory::CandleFactory;
pub use streamer::Streamer;
