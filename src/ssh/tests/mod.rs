//! Unit tests for the SSH transport.

mod fixtures;
