//! Rate limiting decisions.

mod algorithm;
mod decision;
mod key;
mod limiter;
mod policy;
mod tiers;

pub use algorithm::Algorithm;
pub use decision::{CheckRequest, LimitContext, RateLimitResult, UNLIMITED};
pub use key::{IdentityKey, KeyGenerator, RateLimitKey, KEY_SEPARATOR};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use policy::{FixedLimit, LimitObserver, LimitResolver, SkipPredicate};
pub use tiers::TieredLimit;
