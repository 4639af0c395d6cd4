pub mod coordinator;
pub mod service;
pub mod shutdown;
pub mod signals;

pub use coordinator::{Dispatched, LaunchOptions, LifecycleCoordinator, LifecycleError, Phase};
pub use service::{ForegroundController, ServiceAdapter, ServiceController, ServiceHooks};
pub use shutdown::{RunTask, ShutdownCoordinator, ShutdownError, ShutdownOptions};
pub use signals::{ReloadOnHangup, ShutdownSignal, wait_for_shutdown};
