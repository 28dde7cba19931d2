//! Service orchestration: rolling deploys with a health gate and rollback,
//! bulk lifecycle operations, and replica scaling.

pub mod deploy;
pub mod lifecycle;
pub mod scale;

pub use deploy::{DeployOptions, Deployer, DEFAULT_DEPLOY_TIMEOUT};
pub use lifecycle::Lifecycle;
pub use scale::Scaler;
