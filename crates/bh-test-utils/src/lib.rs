// bh-test-utils: shared test helpers for the protocol suites.
//
// Provides throwaway TLS certificate chains, fake service scripts, and an
// in-process dispatcher harness for integration testing of the drivers,
// the client machine, and the dispatcher itself.

pub mod certs;
pub mod harness;
pub mod scripts;

pub use certs::TestTls;
pub use harness::DispatcherHarness;
pub use scripts::write_service_script;
