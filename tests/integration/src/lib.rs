//! End-to-end tests of the Janssen authentication engine live under `tests/`.
