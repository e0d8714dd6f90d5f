//! End-to-end tests for hyproxy live in `tests/`; this crate has no
//! library surface of its own.
