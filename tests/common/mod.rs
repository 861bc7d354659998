//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.

mod constants;
mod fakes;
mod fixtures;

#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fakes::{FakeDownloader, FakeExecutors, FakeOutcome, FAKE_FILE_SIZE};
#[allow(unused_imports)]
pub use fixtures::{wait_until, TestHarness};
