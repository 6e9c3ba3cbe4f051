mod group;
mod thread;

pub use self::group::*;
pub use self::thread::*;
