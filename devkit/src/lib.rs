/*!
# AC Bridge DevKit - Mocks and test utilities

Runs the synchronization engine without a broker or a vendor account:
- Mock bus channel recording every publication and subscription
- Mock cloud channel recording every command, driven by the test
- Test harness wiring both into a running engine, with assertions
*/

pub mod mock_bus;
pub mod mock_cloud;
pub mod test_utils;

pub use mock_bus::{mock_bus, MockBus, MockBusEvents, MockMessage};
pub use mock_cloud::{mock_cloud, MockCloud, MockCloudEvents};
pub use test_utils::{AcMessageBuilder, TestHarness};
