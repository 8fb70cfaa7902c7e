pub mod cipher;
pub mod compress;
pub mod mac;
pub mod section;

pub use compress::*;
pub use mac::*;
pub use section::*;
