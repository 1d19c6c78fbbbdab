//! Request handlers, grouped by resource.

pub mod branches;
pub mod download;
pub mod health;
pub mod stream;
pub mod tasks;

pub use branches::*;
pub use download::*;
pub use health::*;
pub use stream::*;
pub use tasks::*;
