//! 购物车仓储层

mod memory_repo;
mod redis_repo;
mod traits;

pub use memory_repo::InMemoryCartRepository;
pub use redis_repo::RedisCartRepository;
#[cfg(test)]
pub use traits::MockCartRepository;
pub use traits::CartRepository;
