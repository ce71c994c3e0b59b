#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Number of page frames the pool holds in memory.
    pub buffer_pool_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseConfig {
    pub buffer_pool: BufferPoolConfig,
}
