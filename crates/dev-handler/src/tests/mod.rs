//! Relay and discovery tests against the simulated board in
//! [`crate::test_utils`]
