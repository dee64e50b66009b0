pub mod alert;
pub mod identity;
pub mod outcome;
pub mod proxy;
pub mod summary;

pub use alert::*;
pub use identity::*;
pub use outcome::*;
pub use proxy::*;
pub use summary::*;
