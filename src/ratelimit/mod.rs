//! Rate limiting logic.

mod key;
mod limiter;
mod policy;
mod registry;

pub use key::PolicyNamespace;
pub use limiter::{ConsumeResult, Limiter, LimiterError, Rejection, DEFAULT_STORE_TIMEOUT};
pub use policy::LimiterPolicy;
pub use registry::{LimiterRegistry, DEFAULT_KEY_PREFIX};
