mod daraja;

pub use daraja::*;
