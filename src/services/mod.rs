//! Domain service factories. Each submodule builds one [`crate::Service`]
//! from the loaded settings: pool first, routes second, nothing
//! half-initialized.

pub mod users;
