pub mod utils {
    pub mod command;
    pub mod errors;
    pub mod logger;
    pub mod procnet;
    pub mod psutils;
}

pub mod config;
pub mod discoverers;
pub mod handle_cache;
pub mod sampler;
pub mod session;
pub mod shutdown;
