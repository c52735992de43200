pub mod concurrency;

pub use concurrency::ConcurrencyLimiter;
