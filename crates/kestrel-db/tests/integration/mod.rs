pub mod common;
mod orchestrator_tests;
mod run_store_tests;
