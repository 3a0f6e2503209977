//! Test module for sensord-daemon
//!
//! This module contains tests for:
//! - Request dispatch, method contracts and the error-code table
//! - Sensor registration, autostart and teardown
//! - Presence forwarding from sensors to the sink hub
