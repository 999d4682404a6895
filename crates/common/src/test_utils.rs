//! Test utilities for the lowcar device handler
//!
//! Provides fixtures and polling helpers shared by the crates' tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_usb_identity, wait_until, DEFAULT_TEST_TIMEOUT};
//!
//! let usb = create_mock_usb_identity(3);
//! assert_eq!(usb.device_address, 3);
//! assert!(wait_until(DEFAULT_TEST_TIMEOUT, || true));
//! ```

use crate::usb_types::UsbIdentity;
use protocol::{DeviceIdentity, SubscriptionResponse};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor id used for mock lowcar boards (Arduino)
pub const MOCK_VENDOR_ID: u16 = 0x2341;

/// Product id used for mock lowcar boards
pub const MOCK_PRODUCT_ID: u16 = 0x8036;

/// Mock USB identity on bus 1 at address `address`
pub fn create_mock_usb_identity(address: u8) -> UsbIdentity {
    UsbIdentity::new(MOCK_VENDOR_ID, MOCK_PRODUCT_ID, 1, address)
}

/// Mock device identity of the given type with a uid derived from it
pub fn create_mock_device_identity(device_type: u16) -> DeviceIdentity {
    DeviceIdentity::new(device_type, 20, 0x1000 + device_type as u64)
}

/// SubscriptionResponse a freshly reset device would send
pub fn create_subscription_response(identity: DeviceIdentity) -> SubscriptionResponse {
    SubscriptionResponse {
        params: 0,
        delay_ms: 0,
        identity,
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
///
/// Returns whether the condition was observed.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
