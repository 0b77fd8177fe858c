//! End-to-end smoke tests against a live Postgres; see `tests/`.
