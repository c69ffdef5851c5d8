#[cfg(feature = "embedded")]
pub mod driver;
pub mod traits;

#[cfg(feature = "embedded")]
pub use driver::Sx1262Driver;
#[cfg(test)]
pub use traits::mock;
pub use traits::{ChannelState, ErrorKind, LoraConfig, RadioError, RadioTransport, RxPacket};
