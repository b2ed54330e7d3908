pub mod normalizer;
pub mod rate_limit;
pub mod resampler;
pub mod validator;
pub mod window_plan;
