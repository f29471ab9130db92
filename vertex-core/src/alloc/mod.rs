pub mod arena;
pub mod pool;

pub use arena::Arena;
pub use pool::Pool;
