// tests/integration/main.rs
#[path = "../common/mod.rs"]
mod common;

mod launch_tests;
mod manager_tests;
