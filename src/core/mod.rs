// Core host abstractions for the mdev recovery controller

#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod host;
pub mod linux;
