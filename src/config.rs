use crate::cache::DEFAULT_BUFFER_POOL_SIZE;

use std::sync::LazyLock;

#[allow(non_snake_case)]
pub struct Config {
    // number of frames in the buffer pool
    pub BUFFER_POOL_SIZE: usize,
    // root directory
    pub ROOT_DIRECTORY: String,
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| Config {
    BUFFER_POOL_SIZE: DEFAULT_BUFFER_POOL_SIZE,
    ROOT_DIRECTORY: "/tmp/".to_string(),
});
