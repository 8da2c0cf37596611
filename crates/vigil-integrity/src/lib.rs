#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-integrity** – Fork detection, the fork monitor loop, the
//! crisis trigger, and sliding-window rate limiting (§4.F, §4.G, §4.H,
//! §4.P).

pub mod crisis;
pub mod fork;
pub mod monitor;
pub mod rate_limiter;

pub use crisis::{Crisis, CrisisTrigger};
pub use fork::{detect_fork, fork_payload_hash, sign_fork_payload, verify_fork_signal, ForkPayload, SignedForkSignal};
pub use monitor::{ForkHandler, ForkMonitorConfig, ForkMonitorLoop};
pub use rate_limiter::SlidingWindowLimiter;
