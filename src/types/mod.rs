pub mod candle;
pub mod position;
pub mod trading;

pub use candle::*;
pub use position::*;
pub use trading::*;
