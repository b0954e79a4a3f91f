pub mod controller;
pub mod reaper;
pub mod sampler;
pub mod scheduler;

pub use controller::RunController;
pub use sampler::PlatformSampler;
pub use scheduler::CHILD_ENV_VAR;
