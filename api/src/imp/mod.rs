pub mod lowswap;
pub mod task;
