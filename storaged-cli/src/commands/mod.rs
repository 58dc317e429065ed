pub mod call;
pub mod daemon;
pub mod jobs;
pub mod status;
