mod activation;
mod license;
mod payment;

pub use activation::*;
pub use license::*;
pub use payment::*;
