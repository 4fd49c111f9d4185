// gwf - Filesystem watch-and-upload agent
//
// Root package: re-exports the pipeline crates and hosts workspace-level
// integration tests (tests/pipeline.rs) that exercise detection through
// delivery end to end.

pub use gwf_config;
pub use gwf_core;
pub use gwf_pool;
pub use gwf_queue;
pub use gwf_upload;
pub use gwf_watch;
